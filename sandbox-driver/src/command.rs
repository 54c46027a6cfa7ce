// Standard library
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use duct::cmd;
use tracing::debug;
use which::which;

use crate::error::{DriverError, Result};

/// Lines of output kept when a command fails.
const ERROR_CONTEXT_LINES: usize = 50;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    /// The last lines of output, which is where CLI tools print their errors.
    pub fn tail(&self) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(ERROR_CONTEXT_LINES);
        lines[start..].join("\n")
    }
}

/// Runs `program args..` in `dir`, capturing combined output.
///
/// A non-zero exit is reported through [`CommandOutput::success`], not as an
/// error. Errors are reserved for commands that could not start or that
/// exceeded `timeout`, in which case the child is killed.
pub fn run_captured(
    program: &Path,
    args: &[String],
    dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let full_command = format!("{} {}", program.display(), args.join(" "));
    debug!(command = %full_command, dir = %dir.display(), "running driver command");

    let expression = cmd(program.to_path_buf(), args.to_vec())
        .dir(dir)
        .env("TF_IN_AUTOMATION", "1")
        .env("TF_INPUT", "0")
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked();

    let Some(timeout) = timeout else {
        let output = expression.run().map_err(|source| DriverError::Spawn {
            command: full_command.clone(),
            source,
        })?;
        return Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        });
    };

    let handle = expression.start().map_err(|source| DriverError::Spawn {
        command: full_command.clone(),
        source,
    })?;

    let started = Instant::now();
    loop {
        if started.elapsed() >= timeout {
            let _ = handle.kill();
            return Err(DriverError::Timeout {
                command: full_command,
                after: timeout,
            });
        }

        match handle.try_wait() {
            Ok(Some(output)) => {
                return Ok(CommandOutput {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    output: String::from_utf8_lossy(&output.stdout).into_owned(),
                });
            }
            Ok(None) => thread::sleep(Duration::from_millis(100)),
            Err(e) => {
                return Err(DriverError::Spawn {
                    command: full_command,
                    source: e,
                })
            }
        }
    }
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}
