//! Captured-output command execution for volume and cache operations.
//!
//! All OS tooling (diskutil, mount_apfs, bless, kmutil, ditto, ...) is
//! invoked through these wrappers so stdout/stderr are always captured and
//! logged, never inherited.

use std::process::{Command, Output};

use crate::error::PatchError;

/// True when the current process already runs as root.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and only reads process state.
    unsafe { libc::geteuid() == 0 }
}

/// Run a command, capturing output. Spawn failures become CommandFailed.
pub fn run_and_capture(args: &[&str]) -> Result<Output, PatchError> {
    let (cmd, rest) = args
        .split_first()
        .ok_or_else(|| PatchError::CommandFailed {
            cmd: String::new(),
            reason: "empty command line".to_string(),
        })?;

    Command::new(cmd)
        .args(rest)
        .output()
        .map_err(|e| PatchError::CommandFailed {
            cmd: args.join(" "),
            reason: e.to_string(),
        })
}

/// Log any captured output under the given tag.
pub fn log_output(tag: &str, output: &Output) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        log::info!("[{}] stdout: {}", tag, stdout.trim_end());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        log::info!("[{}] stderr: {}", tag, stderr.trim_end());
    }
}

/// Run a command and require a zero exit status.
pub fn run_and_verify(args: &[&str]) -> Result<Output, PatchError> {
    let output = run_and_capture(args)?;
    if !output.status.success() {
        log_output(args.first().copied().unwrap_or("?"), &output);
        return Err(PatchError::CommandFailed {
            cmd: args.join(" "),
            reason: format!("exit status {:?}", output.status.code()),
        });
    }
    Ok(output)
}

/// Run a command with root privileges and require a zero exit status.
///
/// When the process is already root the command runs as-is; otherwise it is
/// wrapped in sudo. Arguments are always passed as separate argv entries,
/// never interpolated through a shell.
pub fn run_elevated_and_verify(args: &[&str]) -> Result<Output, PatchError> {
    if is_root() {
        return run_and_verify(args);
    }
    let mut elevated = Vec::with_capacity(args.len() + 1);
    elevated.push("/usr/bin/sudo");
    elevated.extend_from_slice(args);
    run_and_verify(&elevated)
}

/// Best-effort variant: runs elevated, logs a nonzero exit instead of
/// returning it. Used for cleanup paths where failure is tolerable.
pub fn run_elevated_allow_failure(args: &[&str]) {
    let mut line: Vec<&str> = Vec::with_capacity(args.len() + 1);
    if !is_root() {
        line.push("/usr/bin/sudo");
    }
    line.extend_from_slice(args);

    match run_and_capture(&line) {
        Ok(output) if !output.status.success() => {
            log_output(args.first().copied().unwrap_or("?"), &output)
        }
        Ok(_) => {}
        Err(e) => log::warn!("command failed to spawn: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        let result = run_and_capture(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_and_capture_true() {
        let output = run_and_capture(&["true"]).expect("true should spawn");
        assert!(output.status.success());
    }

    #[test]
    fn test_run_and_verify_nonzero_exit() {
        let result = run_and_verify(&["false"]);
        assert!(matches!(result, Err(PatchError::CommandFailed { .. })));
    }

    #[test]
    fn test_run_and_verify_captures_stdout() {
        let output = run_and_verify(&["echo", "hello"]).expect("echo should succeed");
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }
}
