//! Syscall-filter applicator: `warden-apply <bpf-file> <program> [args…]`.
//!
//! Reads a serialized BPF program, sets `no_new_privs`, installs the filter,
//! and execs the wrapped program. Runs between the sandbox helper and the
//! user's shell so the filter applies to the command tree and nothing else.

use std::process::ExitCode;

use anyhow::{Context, Result, bail};

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("warden-apply: {err:#}");
            ExitCode::from(125)
        }
    }
}

#[cfg(target_os = "linux")]
fn run() -> Result<ExitCode> {
    use std::os::unix::process::CommandExt;

    let mut args = std::env::args_os().skip(1);
    let Some(filter_path) = args.next() else {
        bail!("usage: warden-apply <bpf-file> <program> [args...]");
    };
    let Some(program) = args.next() else {
        bail!("usage: warden-apply <bpf-file> <program> [args...]");
    };

    let bytes = std::fs::read(&filter_path)
        .with_context(|| format!("failed to read filter {}", filter_path.to_string_lossy()))?;
    let program_filter = parse_program(&bytes)?;

    set_no_new_privs()?;
    seccompiler::apply_filter(&program_filter).context("failed to install syscall filter")?;

    // Only reachable if exec fails.
    let err = std::process::Command::new(&program).args(args).exec();
    Err(err).with_context(|| format!("failed to exec {}", program.to_string_lossy()))
}

#[cfg(target_os = "linux")]
fn parse_program(bytes: &[u8]) -> Result<seccompiler::BpfProgram> {
    // The flat `sock_filter` layout: u16 code, u8 jt, u8 jf, u32 k.
    if bytes.is_empty() || bytes.len() % 8 != 0 {
        bail!("malformed BPF program: {} bytes", bytes.len());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| seccompiler::sock_filter {
            code: u16::from_ne_bytes([chunk[0], chunk[1]]),
            jt: chunk[2],
            jf: chunk[3],
            k: u32::from_ne_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        })
        .collect())
}

#[cfg(target_os = "linux")]
fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl with PR_SET_NO_NEW_PRIVS takes no pointers and cannot
    // leave the process in an invalid state.
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        bail!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run() -> Result<ExitCode> {
    bail!("warden-apply only works on Linux");
}
