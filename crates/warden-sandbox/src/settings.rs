//! The caller-facing sandbox policy record.
//!
//! The policy is a declaration of intent, not a description of the
//! filesystem: entries may be stale, globs may match nothing, and the
//! compilers are expected to drop unusable entries rather than fail. All
//! types round-trip through serde so a long-lived supervisor can ship
//! policy updates as JSON over the control channel between commands.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A declarative sandbox policy for a single command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SandboxPolicy {
    /// Read restrictions. Absent (or an empty deny list) means reads are
    /// unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<ReadPolicy>,

    /// Write restrictions. Absent means writes are unrestricted; present
    /// with an empty `allow-only` means a read-only filesystem with nothing
    /// writable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<WritePolicy>,

    /// Network restrictions.
    #[serde(default)]
    pub network: NetworkPolicy,

    /// Unix-domain-socket creation policy.
    #[serde(default)]
    pub unix_sockets: UnixSocketPolicy,

    /// Leave `.git/config` writable. `.git/hooks` stays denied regardless.
    #[serde(default)]
    pub allow_git_config: bool,

    /// Allow pseudo-terminal allocation (macOS only).
    #[serde(default)]
    pub allow_pty: bool,

    /// Allow binding to the loopback interface (macOS only).
    #[serde(default)]
    pub allow_local_binding: bool,

    /// Skip mounting a fresh `/proc` (Linux only). Required inside container
    /// runtimes that reject `--proc` even when PID namespaces work.
    #[serde(default)]
    pub enable_weaker_nested_sandbox: bool,

    /// Location of the external file-index scanner used by the
    /// mandatory-deny enumerator.
    #[serde(default)]
    pub ripgrep: RipgrepConfig,

    /// How deep below the working directory the mandatory-deny scan looks
    /// for nested dangerous files.
    #[serde(default = "default_mandatory_deny_search_depth")]
    pub mandatory_deny_search_depth: usize,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            read: None,
            write: None,
            network: NetworkPolicy::default(),
            unix_sockets: UnixSocketPolicy::default(),
            allow_git_config: false,
            allow_pty: false,
            allow_local_binding: false,
            enable_weaker_nested_sandbox: false,
            ripgrep: RipgrepConfig::default(),
            mandatory_deny_search_depth: default_mandatory_deny_search_depth(),
        }
    }
}

impl SandboxPolicy {
    /// Whether the policy imposes no restrictions at all, in which case the
    /// orchestrator returns the user command unchanged.
    pub fn is_unrestricted(&self) -> bool {
        self.read.as_ref().is_none_or(|read| read.deny_only.is_empty())
            && self.write.is_none()
            && !self.network.restricted
            && self.unix_sockets.allow_all
    }

    /// Whether a syscall filter must wrap the user command (Linux). The
    /// Seatbelt engine handles socket-domain filtering natively, so this is
    /// never consulted on macOS.
    pub fn needs_syscall_filter(&self) -> bool {
        !self.unix_sockets.allow_all
    }
}

/// Read restrictions: a deny list over an otherwise-readable filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReadPolicy {
    /// Paths or globs that must not be readable.
    #[serde(default)]
    pub deny_only: Vec<String>,
}

/// Write restrictions: an allow list, with a deny list carved back out of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WritePolicy {
    /// The only paths the command may write to.
    #[serde(default)]
    pub allow_only: Vec<String>,

    /// Paths or globs inside the allowed subtrees that must stay read-only.
    #[serde(default)]
    pub deny_within_allow: Vec<String>,
}

/// Network restrictions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NetworkPolicy {
    /// Deny network access. Without a bridge this is a total block.
    #[serde(default)]
    pub restricted: bool,

    /// Proxy endpoints provided by the out-of-process bridge supervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<NetworkBridge>,
}

/// Unix-socket endpoints of the network bridge supervisor, plus the
/// host-side ports its proxies listen on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NetworkBridge {
    /// Unix socket forwarding to the host-side HTTP proxy.
    pub http_socket_path: PathBuf,
    /// Unix socket forwarding to the host-side SOCKS proxy.
    pub socks_socket_path: PathBuf,
    /// Host-side HTTP proxy port, also used for the in-sandbox forwarder.
    pub http_port: u16,
    /// Host-side SOCKS proxy port, also used for the in-sandbox forwarder.
    pub socks_port: u16,
}

/// Unix-domain-socket creation policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UnixSocketPolicy {
    /// Allow unrestricted Unix-socket creation.
    #[serde(default = "default_true")]
    pub allow_all: bool,

    /// Restrict socket bind/connect to these paths. Only enforceable by the
    /// Seatbelt engine; on Linux this degrades to a warning.
    #[serde(default)]
    pub allow_paths: Vec<PathBuf>,
}

impl Default for UnixSocketPolicy {
    fn default() -> Self {
        Self {
            allow_all: true,
            allow_paths: Vec::new(),
        }
    }
}

/// Location of the external file-index scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RipgrepConfig {
    /// Explicit path to the `rg` binary. Falls back to a `PATH` lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_mandatory_deny_search_depth() -> usize {
    3
}
