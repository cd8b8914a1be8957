//! Compile declarative sandbox policies into host-OS sandbox invocations.
//!
//! Given a [`SandboxPolicy`] and a raw user command, [`wrap_command`] emits a
//! single composite shell command string that runs the command under the
//! platform sandbox — bubblewrap plus a seccomp filter on Linux, the
//! Seatbelt profile engine on macOS — and exits with the command's status.
//!
//! The caller executes the returned string, then invokes
//! [`cleanup_mount_points`] to remove any host-side residue the sandbox
//! helper materialized while binding over non-existent deny paths.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use crate::env::{WARDEN_HOST_HTTP_PORT, WARDEN_HOST_SOCKS_PORT};
pub use crate::mandatory::{DANGEROUS_DIRECTORIES, DANGEROUS_FILES};
pub use crate::reaper::cleanup_mount_points;
#[cfg(target_os = "linux")]
pub use crate::seccomp::SeccompError;
pub use crate::settings::{
    NetworkBridge, NetworkPolicy, ReadPolicy, RipgrepConfig, SandboxPolicy, UnixSocketPolicy,
    WritePolicy,
};

mod env;
#[cfg(target_os = "linux")]
mod linux;
// The profile builder is platform-independent text generation; keep it
// compiled (and tested) everywhere even though only macOS hosts execute it.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod macos;
mod mandatory;
mod pattern;
mod reaper;
#[cfg(target_os = "linux")]
mod seccomp;
mod settings;

/// Why a policy could not be compiled.
///
/// Per-path anomalies never surface here; they are dropped with a debug
/// line. These are the conditions under which no meaningful sandbox can be
/// produced at all.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox helper `{0}` not found")]
    ToolNotFound(&'static str),

    #[error(transparent)]
    Shell(#[from] warden_shell::ShellError),

    #[error(
        "network bridge socket {} does not exist; the bridge supervisor may have crashed",
        _0.display()
    )]
    BridgeSocketMissing(PathBuf),

    #[error("path {} cannot be expressed in a sandbox profile", _0.display())]
    UnrepresentablePath(PathBuf),

    #[cfg(target_os = "linux")]
    #[error("cannot construct syscall filter")]
    Seccomp(#[from] SeccompError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("sandboxing is not supported on this platform")]
    UnsupportedPlatform,
}

/// Per-invocation inputs that are not part of the serializable policy.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Working directory the policy's relative paths resolve against, and
    /// the root of the mandatory-deny scan.
    pub cwd: PathBuf,

    /// Shell that hosts the user command. A bare name is resolved on
    /// `PATH`; `None` defaults to `bash`.
    pub bin_shell: Option<PathBuf>,

    /// Aborts the mandatory-deny scan; compilation then proceeds with
    /// whatever the enumerator produced before the signal.
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            bin_shell: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Wrap `command` in a composite sandbox invocation for the current platform.
///
/// A policy with no restrictions short-circuits to the unmodified command.
/// On compilation failure, any syscall-filter artifacts generated along the
/// way are removed before the error propagates.
pub async fn wrap_command(
    command: &str,
    policy: &SandboxPolicy,
    ctx: &CommandContext,
) -> Result<String, SandboxError> {
    if policy.is_unrestricted() {
        debug!("Policy imposes no restrictions; running command unsandboxed");
        return Ok(command.to_string());
    }

    let mandatory_denies = if policy.write.is_some() {
        mandatory::enumerate_mandatory_denies(policy, &ctx.cwd, &ctx.cancel).await
    } else {
        Vec::new()
    };

    let result = compile_for_host(command, policy, &mandatory_denies, ctx);

    #[cfg(target_os = "linux")]
    if result.is_err() {
        seccomp::remove_generated_filters();
    }

    result
}

fn compile_for_host(
    command: &str,
    policy: &SandboxPolicy,
    mandatory_denies: &[PathBuf],
    ctx: &CommandContext,
) -> Result<String, SandboxError> {
    #[cfg(target_os = "linux")]
    {
        linux::compile_command(command, policy, mandatory_denies, ctx)
    }
    #[cfg(target_os = "macos")]
    {
        macos::compile_command(command, policy, mandatory_denies, ctx)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (command, policy, mandatory_denies, ctx);
        Err(SandboxError::UnsupportedPlatform)
    }
}
