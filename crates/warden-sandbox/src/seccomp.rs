//! Runtime construction of the Unix-socket-blocking seccomp filter.
//!
//! The Seatbelt engine can express "no `AF_UNIX` sockets" directly; the
//! Linux side needs a BPF program. We build one at runtime with
//! `seccompiler`: default-allow, with `socket(2)` and `socketpair(2)`
//! returning `EPERM` when the domain argument is `AF_UNIX`. The serialized
//! program is written to a temporary file that the composite command opens
//! on an inherited descriptor; every generated file is registered for
//! teardown on error and at process exit.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex, PoisonError};

use rustc_hash::FxHashSet;
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use tracing::debug;

static GENERATED_FILTERS: LazyLock<Mutex<FxHashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(FxHashSet::default()));

/// Error constructing or persisting the syscall filter.
#[derive(Debug, thiserror::Error)]
pub enum SeccompError {
    #[error("failed to build syscall filter")]
    Backend(#[from] seccompiler::BackendError),

    #[error("unsupported architecture `{0}` for syscall filtering")]
    UnsupportedArch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Build the filter, write it to a temporary file, and return the file's
/// path. The path is registered for cleanup.
pub(crate) fn generate_unix_socket_filter() -> Result<PathBuf, SeccompError> {
    let program = unix_socket_program()?;
    let bytes = serialize_program(&program);

    let mut file = tempfile::Builder::new()
        .prefix("warden-seccomp-")
        .suffix(".bpf")
        .tempfile()?;
    file.write_all(&bytes)?;
    let (_, path) = file.keep().map_err(|err| err.error)?;

    crate::reaper::install_exit_hook();
    GENERATED_FILTERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(path.clone());

    debug!("Generated syscall filter at {}", path.display());
    Ok(path)
}

/// Delete every generated filter file and clear the registry. Called on
/// compilation failure and again from the exit hook.
pub(crate) fn remove_generated_filters() {
    let drained: Vec<PathBuf> = {
        let mut registry = GENERATED_FILTERS
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registry.drain().collect()
    };
    for path in drained {
        if fs_err::remove_file(&path).is_ok() {
            debug!("Removed generated syscall filter {}", path.display());
        }
    }
}

/// Default-allow program that fails `AF_UNIX` socket creation with `EPERM`.
fn unix_socket_program() -> Result<BpfProgram, SeccompError> {
    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|_| SeccompError::UnsupportedArch(std::env::consts::ARCH.to_string()))?;

    let domain_is_unix = || -> Result<SeccompRule, seccompiler::BackendError> {
        SeccompRule::new(vec![SeccompCondition::new(
            0,
            SeccompCmpArgLen::Dword,
            SeccompCmpOp::Eq,
            u64::from(libc::AF_UNIX as u32),
        )?])
    };

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    rules.insert(libc::SYS_socket, vec![domain_is_unix()?]);
    rules.insert(libc::SYS_socketpair, vec![domain_is_unix()?]);

    let filter = SeccompFilter::new(
        rules,
        // Unmatched syscalls pass through untouched.
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        arch,
    )?;

    Ok(filter.try_into()?)
}

/// Serialize a BPF program into the flat `sock_filter` byte layout that
/// `bwrap --seccomp` and the applicator expect on their file descriptor.
fn serialize_program(program: &BpfProgram) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(program.len() * 8);
    for instruction in program {
        bytes.extend_from_slice(&instruction.code.to_ne_bytes());
        bytes.push(instruction.jt);
        bytes.push(instruction.jf);
        bytes.extend_from_slice(&instruction.k.to_ne_bytes());
    }
    bytes
}
