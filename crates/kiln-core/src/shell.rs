//! Interactive mode: hand the terminal to a shell.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::toolchain::exit_code_of;

/// Run `shell` with inherited stdio and return its exit code.
///
/// No orchestration happens around the session; the build and output
/// directories are never touched.
pub fn run_interactive_shell(shell: &Path, args: &[String]) -> std::io::Result<i32> {
    debug!(shell = %shell.display(), args = ?args, "starting interactive shell");
    let status = Command::new(shell).args(args).status()?;
    Ok(if status.success() {
        0
    } else {
        exit_code_of(status)
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_shell_exit_code_is_returned() {
        let code = run_interactive_shell(
            Path::new("/bin/sh"),
            &["-c".to_string(), "exit 7".to_string()],
        )
        .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_missing_shell_is_io_error() {
        assert!(run_interactive_shell(Path::new("/nonexistent/shell"), &[]).is_err());
    }
}
