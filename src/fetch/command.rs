use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{fill_template, FetchFailure, ImageFetcher};
use crate::scan::{default_extensions, scan_images};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs an external image crawler once per query.
///
/// The program must write its images somewhere under the directory passed as
/// `{output}`. Whatever it leaves there is counted afterwards, so the program's
/// own output format does not matter.
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    extensions: Vec<String>,
}

impl CommandFetcher {
    pub fn new(program: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args,
            timeout,
            extensions: default_extensions(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    fn build_args(&self, query: &str, limit: usize, output_dir: &Path) -> Vec<String> {
        let limit = limit.to_string();
        let output = output_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                fill_template(
                    arg,
                    &[
                        ("query", query),
                        ("limit", limit.as_str()),
                        ("output", output.as_ref()),
                    ],
                )
            })
            .collect()
    }
}

impl ImageFetcher for CommandFetcher {
    fn fetch(&self, query: &str, limit: usize, output_dir: &Path) -> Result<usize, FetchFailure> {
        fs::create_dir_all(output_dir)?;

        let mut child = Command::new(&self.program)
            .args(self.build_args(query, limit, output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    FetchFailure::Backend(format!("program not found: {}", self.program))
                }
                _ => FetchFailure::Io(e),
            })?;

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                if let Err(e) = child.kill() {
                    log::warn!("Failed to kill stalled {} process: {}", self.program, e);
                }
                let _ = child.wait();
                return Err(FetchFailure::Timeout(self.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            return Err(FetchFailure::Backend(format!(
                "{} exited with {}",
                self.program, status
            )));
        }

        Ok(scan_images(output_dir, &self.extensions).len())
    }

    fn name(&self) -> &str {
        "command"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str, timeout: Duration) -> CommandFetcher {
        CommandFetcher::new(
            "sh",
            vec![
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                "{output}".to_string(),
                "{limit}".to_string(),
                "{query}".to_string(),
            ],
            timeout,
        )
    }

    #[test]
    fn test_counts_images_written_by_program() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("scratch");
        let fetcher = sh(
            r#"mkdir -p "$1/$3" && i=1; while [ $i -le $2 ]; do printf x > "$1/$3/Image_$i.jpg"; i=$((i+1)); done; printf x > "$1/log.txt""#,
            Duration::from_secs(10),
        );

        let count = fetcher.fetch("Toyota Vios 2020 front", 3, &output).unwrap();
        assert_eq!(count, 3);
        assert!(output.join("Toyota Vios 2020 front").join("Image_3.jpg").exists());
    }

    #[test]
    fn test_no_results_is_zero_not_error() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = sh("exit 0", Duration::from_secs(10));
        assert_eq!(fetcher.fetch("q", 5, temp_dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_nonzero_exit_is_backend_failure() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = sh("exit 3", Duration::from_secs(10));
        assert!(matches!(
            fetcher.fetch("q", 5, temp_dir.path()),
            Err(FetchFailure::Backend(_))
        ));
    }

    #[test]
    fn test_stalled_program_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = sh("sleep 10", Duration::from_millis(300));

        let started = Instant::now();
        let result = fetcher.fetch("q", 5, temp_dir.path());
        assert!(matches!(result, Err(FetchFailure::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program_is_backend_failure() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = CommandFetcher::new(
            "carset-no-such-downloader",
            Vec::new(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            fetcher.fetch("q", 1, temp_dir.path()),
            Err(FetchFailure::Backend(_))
        ));
    }
}
