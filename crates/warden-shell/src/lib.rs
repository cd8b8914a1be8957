//! POSIX shell quoting and shell resolution.
//!
//! The sandbox compilers assemble a single composite command string that is
//! handed to a shell verbatim, so every argument they fold in has to survive
//! one round of POSIX word splitting unchanged.

use std::path::{Path, PathBuf};

pub use crate::shlex::{escape_for_single_quotes, join, quote};

mod shlex;

/// Error resolving the shell that will host the sandboxed payload.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("shell `{0}` not found on `PATH`")]
    NotFound(String),

    #[error("shell `{}` does not exist", _0.display())]
    Missing(PathBuf),
}

/// Resolve the shell binary that will run the user command.
///
/// An absolute `preferred` path is used as-is after an existence check.
/// A bare name (or no preference, which defaults to `bash`) is looked up on
/// the host's `PATH`: the sandbox helper execs directly and performs no
/// `PATH` search of its own.
pub fn resolve_shell(preferred: Option<&Path>) -> Result<PathBuf, ShellError> {
    match preferred {
        Some(path) if path.is_absolute() => {
            if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(ShellError::Missing(path.to_path_buf()))
            }
        }
        Some(name) => {
            let name = name.to_string_lossy();
            which::which(name.as_ref()).map_err(|_| ShellError::NotFound(name.into_owned()))
        }
        None => which::which("bash").map_err(|_| ShellError::NotFound("bash".to_string())),
    }
}
