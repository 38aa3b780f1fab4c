//! Asynchronous utilities for use with Tokio.

use crate::prelude::*;

pub mod io;

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at `debug` level, because
/// OCR tools are chatty even when everything works. A failing command's
/// standard error is logged at `warn` and included in the returned error.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );

    if output.status.success() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        warn!(
            command_name = command_name,
            exit_code,
            output = %stderr,
            "Command failed",
        );
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Command was killed",
        );
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn failing_commands_are_reported() {
        let ok = Command::new("sh").args(["-c", "echo hi"]).output().unwrap();
        assert!(check_for_command_failure("sh", &ok).is_ok());

        let failed = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .output()
            .unwrap();
        let err = check_for_command_failure("sh", &failed).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("oops"), "{msg}");
    }
}
