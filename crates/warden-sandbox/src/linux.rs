//! Linux policy compilation: an ordered bubblewrap argument vector.
//!
//! Ordering is load-bearing throughout. bwrap applies directives left to
//! right and later binds override earlier ones on overlapping paths, so the
//! stages run: root bind, write allows, write denies, read denies, device
//! and PID isolation, network, payload. A deny emitted before its enclosing
//! allow would be silently undone by it.
//!
//! Per-path problems never fail compilation: the policy lists are statements
//! of intent over a filesystem that may have changed since they were
//! written, and dropping a stale entry (with a debug line) beats refusing to
//! run the command. Hard errors are reserved for a missing sandbox helper,
//! missing bridge sockets, and an unconstructible syscall filter.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use warden_fs::PathKind;

use crate::pattern::PathPattern;
use crate::settings::{NetworkBridge, NetworkPolicy, SandboxPolicy};
use crate::{CommandContext, SandboxError, env};

const DEV_NULL: &str = "/dev/null";

/// Read-denied regardless of policy: host SSH client configuration drop-ins.
const IMPLICIT_READ_DENIES: &[&str] = &["/etc/ssh/ssh_config.d"];

/// File descriptor on which the nested sandbox inherits the BPF program.
const SECCOMP_FD: u32 = 200;

/// Compile `policy` into a composite bwrap invocation around `command`.
pub(crate) fn compile_command(
    command: &str,
    policy: &SandboxPolicy,
    mandatory_denies: &[PathBuf],
    ctx: &CommandContext,
) -> Result<String, SandboxError> {
    let bwrap = which::which("bwrap").map_err(|_| SandboxError::ToolNotFound("bwrap"))?;
    let shell = warden_shell::resolve_shell(ctx.bin_shell.as_deref())?;

    let mut args: Vec<String> = vec![
        bwrap.to_string_lossy().into_owned(),
        "--new-session".to_string(),
        "--die-with-parent".to_string(),
    ];

    let plan = filesystem_args(policy, mandatory_denies, &ctx.cwd)?;
    args.extend(plan.args.iter().cloned());

    // Device tree and PID isolation must follow every filesystem bind: a
    // `--proc` emitted earlier would be shadowed by a later overlapping bind.
    push(&mut args, ["--dev", "/dev", "--unshare-pid"]);
    if policy.enable_weaker_nested_sandbox {
        debug!("Skipping fresh /proc for nested-sandbox compatibility");
    } else {
        push(&mut args, ["--proc", "/proc"]);
    }

    network_args(&policy.network, &mut args)?;
    payload_args(command, policy, &bwrap, &plan.writable_binds, &shell, &mut args)?;

    Ok(warden_shell::join(&args))
}

/// The filesystem stage output: bwrap arguments plus the writable binds that
/// a nested inner sandbox must replay.
#[derive(Debug, Default)]
struct FilesystemPlan {
    args: Vec<String>,
    writable_binds: Vec<PathBuf>,
    /// First-missing components already covered by a deny artifact. Several
    /// deny paths can share one (`.claude/commands` and `.claude/agents`
    /// both stop at a missing `.claude`).
    artifact_targets: FxHashSet<PathBuf>,
}

fn filesystem_args(
    policy: &SandboxPolicy,
    mandatory_denies: &[PathBuf],
    cwd: &Path,
) -> Result<FilesystemPlan, SandboxError> {
    let mut plan = FilesystemPlan::default();

    if policy.write.is_some() {
        push(&mut plan.args, ["--ro-bind", "/", "/"]);
    } else {
        push(&mut plan.args, ["--bind", "/", "/"]);
    }

    let mut allowed_roots: Vec<PathBuf> = Vec::new();

    if let Some(write) = &policy.write {
        for entry in &write.allow_only {
            if let Some(root) = write_allow_bind(entry, cwd, &mut plan) {
                allowed_roots.push(root);
            }
        }

        let mut deny_paths: BTreeSet<PathBuf> = BTreeSet::new();
        for entry in &write.deny_within_allow {
            deny_paths.extend(PathPattern::parse(entry, cwd).expand());
        }
        deny_paths.extend(mandatory_denies.iter().cloned());

        for path in &deny_paths {
            write_deny_bind(path, &allowed_roots, &mut plan)?;
        }
    }

    if policy.read.is_some() || policy.write.is_some() {
        read_deny_args(policy, cwd, &mut plan.args);
    }

    Ok(plan)
}

/// Stage 2: one write-allow entry. Returns the allowed-write root on
/// success, `None` when the entry was skipped.
fn write_allow_bind(entry: &str, cwd: &Path, plan: &mut FilesystemPlan) -> Option<PathBuf> {
    let input = warden_fs::absolutize(Path::new(entry), cwd);

    if is_under_dev(&input) {
        // `--dev /dev` provides the device tree; binding over it breaks it.
        debug!("Skipping write-allow path {}: under /dev", input.display());
        return None;
    }
    if warden_fs::classify(&input) == PathKind::Missing {
        debug!("Skipping missing write-allow path {}", input.display());
        return None;
    }
    let resolved = match warden_fs::resolve(&input) {
        Ok(resolved) => resolved,
        Err(err) => {
            debug!("Skipping unresolvable write-allow path {}: {err}", input.display());
            return None;
        }
    };
    if warden_fs::symlink_widens(&input, &resolved) {
        debug!(
            "Skipping write-allow path {}: resolution to {} widens scope",
            input.display(),
            resolved.display()
        );
        return None;
    }

    let rendered = resolved.to_string_lossy().into_owned();
    push(&mut plan.args, ["--bind", rendered.as_str(), rendered.as_str()]);
    plan.writable_binds.push(resolved.clone());
    Some(resolved)
}

/// Stage 3: one write-deny path (caller-supplied or mandatory).
fn write_deny_bind(
    path: &Path,
    allowed_roots: &[PathBuf],
    plan: &mut FilesystemPlan,
) -> Result<(), SandboxError> {
    if is_under_dev(path) {
        debug!("Skipping write-deny path {}: under /dev", path.display());
        return Ok(());
    }

    // A symlink component inside a writable root could be deleted and
    // rebuilt as a real directory, re-rooting the denied subtree somewhere
    // writable. Clobber the component itself; the mount captures whatever
    // sits there at sandbox start, so a swap after compile still loses.
    if let Some(link) = warden_fs::find_symlink_in_path(path, allowed_roots) {
        let rendered = link.to_string_lossy().into_owned();
        push(&mut plan.args, ["--ro-bind", DEV_NULL, rendered.as_str()]);
        debug!("Clobbering symlink component {} of write-deny path", link.display());
        return Ok(());
    }

    if warden_fs::classify(path) == PathKind::Missing {
        return plan_deny_artifact(path, allowed_roots, plan);
    }

    if is_under_any(path, allowed_roots) {
        let rendered = path.to_string_lossy().into_owned();
        push(&mut plan.args, ["--ro-bind", rendered.as_str(), rendered.as_str()]);
    } else {
        debug!(
            "Skipping write-deny path {}: outside every allowed-write root",
            path.display()
        );
    }
    Ok(())
}

/// A non-existent deny path inside a writable subtree could be created by
/// the sandboxed command (`mkdir -p` its way in). Bind something unwritable
/// over the first missing component so nothing can appear beneath it, and
/// register the component with the reaper since the sandbox helper will
/// materialize it on the host.
fn plan_deny_artifact(
    path: &Path,
    allowed_roots: &[PathBuf],
    plan: &mut FilesystemPlan,
) -> Result<(), SandboxError> {
    if warden_fs::has_file_ancestor(path) {
        // No mkdir sequence can reach the path, and a mount point cannot be
        // created under a file. The git-worktree shape lands here.
        debug!("Skipping write-deny path {}: an ancestor is a file", path.display());
        return Ok(());
    }

    let Some(ancestor) = warden_fs::nearest_existing_ancestor(path) else {
        debug!("Skipping write-deny path {}: no existing ancestor", path.display());
        return Ok(());
    };
    if !is_under_any(&ancestor, allowed_roots) {
        // The root ro-bind already covers it.
        debug!(
            "Skipping non-existent write-deny path {}: ancestor {} is read-only",
            path.display(),
            ancestor.display()
        );
        return Ok(());
    }

    let Some(first_missing) = warden_fs::first_nonexistent(path) else {
        debug!("Write-deny path {} appeared mid-compilation; skipping", path.display());
        return Ok(());
    };
    if !plan.artifact_targets.insert(first_missing.clone()) {
        debug!(
            "Write-deny path {} already covered by the artifact at {}",
            path.display(),
            first_missing.display()
        );
        return Ok(());
    }

    let rendered = first_missing.to_string_lossy().into_owned();
    if first_missing == path {
        push(&mut plan.args, ["--ro-bind", DEV_NULL, rendered.as_str()]);
    } else {
        // An intermediate component must stay a directory for tools that
        // stat their way down the path; an empty read-only tempdir blocks
        // subtree creation while preserving directory-ness.
        let staging = tempfile::tempdir()?.keep();
        crate::reaper::register_mount_point(staging.clone());
        let staging_rendered = staging.to_string_lossy().into_owned();
        push(&mut plan.args, ["--ro-bind", staging_rendered.as_str(), rendered.as_str()]);
    }
    crate::reaper::register_mount_point(first_missing);
    Ok(())
}

/// Stage 4: read denies, including the fixed implicit set.
fn read_deny_args(policy: &SandboxPolicy, cwd: &Path, args: &mut Vec<String>) {
    let mut paths: BTreeSet<PathBuf> = BTreeSet::new();
    if let Some(read) = &policy.read {
        for entry in &read.deny_only {
            paths.extend(PathPattern::parse(entry, cwd).expand());
        }
    }
    paths.extend(IMPLICIT_READ_DENIES.iter().map(PathBuf::from));

    for path in &paths {
        let rendered = path.to_string_lossy().into_owned();
        match warden_fs::classify(path) {
            PathKind::Dir => push(args, ["--tmpfs", rendered.as_str()]),
            PathKind::File | PathKind::Symlink => {
                push(args, ["--ro-bind", DEV_NULL, rendered.as_str()]);
            }
            PathKind::Missing => {
                debug!("Skipping missing read-deny path {}", path.display());
            }
        }
    }
}

/// Stage 6: network isolation and bridge plumbing.
fn network_args(network: &NetworkPolicy, args: &mut Vec<String>) -> Result<(), SandboxError> {
    if !network.restricted {
        return Ok(());
    }
    args.push("--unshare-net".to_string());

    let Some(bridge) = &network.bridge else {
        return Ok(());
    };

    for socket in [&bridge.http_socket_path, &bridge.socks_socket_path] {
        // A missing socket means the bridge supervisor is gone; proceeding
        // would hand the command a black-hole network.
        if !socket.exists() {
            return Err(SandboxError::BridgeSocketMissing(socket.clone()));
        }
        let rendered = socket.to_string_lossy().into_owned();
        push(args, ["--bind", rendered.as_str(), rendered.as_str()]);
    }

    for (key, value) in env::bridge_env(bridge) {
        push(args, ["--setenv", key, value.as_str()]);
    }
    Ok(())
}

/// Stage 7: resolve the payload shape.
///
/// Three cases, by what must wrap the user command:
///
/// - no syscall filter: the shell, directly;
/// - filter without a bridge: the applicator binary loads the filter and
///   execs the shell;
/// - filter plus bridge: a nested sandbox. The socat forwarders that bridge
///   the isolated network namespace must create Unix sockets themselves, so
///   the filter cannot apply to the outer stage; the outer shell starts the
///   forwarders, opens the BPF program on an inherited descriptor, and execs
///   an inner sandbox that applies the filter to the user command alone.
fn payload_args(
    command: &str,
    policy: &SandboxPolicy,
    bwrap: &Path,
    writable_binds: &[PathBuf],
    shell: &Path,
    args: &mut Vec<String>,
) -> Result<(), SandboxError> {
    if !policy.unix_sockets.allow_paths.is_empty() {
        warn!("unix-socket allow-paths cannot be enforced by the user-namespace sandbox; ignoring");
    }

    let shell_rendered = shell.to_string_lossy().into_owned();

    if !policy.needs_syscall_filter() {
        push(args, ["--"]);
        push(args, [shell_rendered.as_str(), "-c", command]);
        return Ok(());
    }

    let filter = crate::seccomp::generate_unix_socket_filter()?;

    match &policy.network.bridge {
        Some(bridge) if policy.network.restricted => {
            let script = nested_script(command, bridge, bwrap, writable_binds, shell, &filter);
            push(args, ["--"]);
            push(args, [shell_rendered.as_str(), "-c", script.as_str()]);
        }
        _ => {
            let apply = which::which("warden-apply")
                .map_err(|_| SandboxError::ToolNotFound("warden-apply"))?;
            push(args, ["--"]);
            push(
                args,
                [
                    apply.to_string_lossy().as_ref(),
                    filter.to_string_lossy().as_ref(),
                    shell_rendered.as_str(),
                    "-c",
                    command,
                ],
            );
        }
    }
    Ok(())
}

/// The outer-stage script for the two-stage nested sandbox.
fn nested_script(
    command: &str,
    bridge: &NetworkBridge,
    bwrap: &Path,
    writable_binds: &[PathBuf],
    shell: &Path,
    filter: &Path,
) -> String {
    let mut inner: Vec<String> = vec![
        bwrap.to_string_lossy().into_owned(),
        "--unshare-all".to_string(),
        "--share-net".to_string(),
        "--die-with-parent".to_string(),
    ];
    push(&mut inner, ["--ro-bind", "/", "/"]);

    // Replay the outer stage's writable binds so writes land on the shared
    // underlying filesystem instead of the inner read-only root.
    for bind in writable_binds {
        if is_under_dev(bind) {
            continue;
        }
        let rendered = bind.to_string_lossy().into_owned();
        push(&mut inner, ["--bind", rendered.as_str(), rendered.as_str()]);
    }

    push(&mut inner, ["--dev", "/dev"]);
    let fd = SECCOMP_FD.to_string();
    push(&mut inner, ["--seccomp", fd.as_str(), "--"]);
    push(&mut inner, [shell.to_string_lossy().as_ref(), "-c", command]);
    let inner_command = warden_shell::join(&inner);

    let http_socket = warden_shell::quote(&bridge.http_socket_path.to_string_lossy());
    let socks_socket = warden_shell::quote(&bridge.socks_socket_path.to_string_lossy());
    let filter_file = warden_shell::quote(&filter.to_string_lossy());

    format!(
        "socat TCP-LISTEN:{http_port},fork,reuseaddr,bind=127.0.0.1 UNIX-CONNECT:{http_socket} &\n\
         socat TCP-LISTEN:{socks_port},fork,reuseaddr,bind=127.0.0.1 UNIX-CONNECT:{socks_socket} &\n\
         sleep 0.1\n\
         exec {inner_command} {fd}< {filter_file}",
        http_port = bridge.http_port,
        socks_port = bridge.socks_port,
        fd = SECCOMP_FD,
    )
}

fn is_under_dev(path: &Path) -> bool {
    path.starts_with("/dev")
}

fn is_under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

fn push<'a>(args: &mut Vec<String>, words: impl IntoIterator<Item = &'a str>) {
    args.extend(words.into_iter().map(str::to_string));
}
