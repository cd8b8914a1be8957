//! The built-in write-deny list.
//!
//! Independently of whatever the caller denies, a sandboxed command must not
//! be able to plant persistence in shell rc files, editor configuration, or
//! git hooks inside its own writable area. This module produces those paths
//! for a working directory: the fixed dotfile names directly under it, the
//! same names nested below it up to a bounded depth (found with one ripgrep
//! file-index pass), and the version-control internals when `.git` actually
//! is a directory.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warden_fs::PathKind;

use crate::settings::SandboxPolicy;

/// Dotfiles a sandboxed command must never write, relative to any directory
/// it can write to. Shell rc files and tool configuration that gets executed
/// or trusted outside the sandbox.
pub const DANGEROUS_FILES: &[&str] = &[
    ".bashrc",
    ".bash_profile",
    ".zshrc",
    ".zprofile",
    ".profile",
    ".gitconfig",
    ".gitmodules",
    ".ripgreprc",
    ".mcp.json",
    ".claude.json",
    ".clauderc",
    ".codex.json",
    ".cursorrules",
    ".aider.conf.yml",
];

/// Directories whose contents are executed or auto-loaded by editors and
/// agents outside the sandbox.
pub const DANGEROUS_DIRECTORIES: &[&str] =
    &[".vscode", ".idea", ".claude/commands", ".claude/agents"];

/// Produce the deduplicated mandatory write-deny set for `cwd`.
///
/// Best-effort by design: the fixed `cwd`-local entries are always present,
/// while the nested scan degrades to nothing if the scanner is missing,
/// fails, or the caller cancels mid-scan.
pub(crate) async fn enumerate_mandatory_denies(
    policy: &SandboxPolicy,
    cwd: &Path,
    cancel: &CancellationToken,
) -> Vec<PathBuf> {
    let mut denies = BTreeSet::new();

    for name in DANGEROUS_FILES.iter().chain(DANGEROUS_DIRECTORIES) {
        denies.insert(cwd.join(name));
    }

    insert_git_denies(cwd, policy.allow_git_config, &mut denies);

    if policy.mandatory_deny_search_depth > 0 {
        scan_nested_denies(policy, cwd, cancel, &mut denies).await;
    }

    denies.into_iter().collect()
}

/// Add `.git/hooks` (always) and `.git/config` (unless permitted) under
/// `git_dir`'s parent — but only when `.git` exists *and is a directory*.
///
/// A `.git` regular file is a worktree pointer: denying paths beneath it
/// would ask the Linux compiler to mount under a file, and a missing `.git`
/// must stay creatable so `git init` keeps working.
fn insert_git_denies(parent: &Path, allow_git_config: bool, denies: &mut BTreeSet<PathBuf>) {
    let git_dir = parent.join(".git");
    match warden_fs::classify(&git_dir) {
        PathKind::Dir => {
            denies.insert(git_dir.join("hooks"));
            if !allow_git_config {
                denies.insert(git_dir.join("config"));
            }
        }
        kind => {
            debug!(
                "Not denying under {}: {kind:?} is not a directory",
                git_dir.display()
            );
        }
    }
}

/// One bounded-depth file-index pass over `cwd`, mapping each hit back to
/// the deny path it implies.
async fn scan_nested_denies(
    policy: &SandboxPolicy,
    cwd: &Path,
    cancel: &CancellationToken,
    denies: &mut BTreeSet<PathBuf>,
) {
    let ripgrep = match &policy.ripgrep.path {
        Some(path) => path.clone(),
        None => match which::which("rg") {
            Ok(path) => path,
            Err(_) => {
                warn!("File-index scanner not found; mandatory denies limited to the working directory");
                return;
            }
        },
    };

    let mut command = tokio::process::Command::new(&ripgrep);
    command
        .arg("--files")
        .arg("--hidden")
        .arg("--no-ignore")
        .arg("--max-depth")
        // The listed entries sit one level below the directories we search for.
        .arg((policy.mandatory_deny_search_depth + 1).to_string())
        .args(["--glob", "!**/node_modules/**"]);
    for name in DANGEROUS_FILES {
        command.arg("--glob").arg(format!("**/{name}"));
    }
    for name in DANGEROUS_DIRECTORIES {
        command.arg("--glob").arg(format!("**/{name}/**"));
    }
    command.args(["--glob", "**/.git/config", "--glob", "**/.git/hooks/**"]);
    command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(
                "Failed to start file-index scanner {}: {err}",
                ripgrep.display()
            );
            return;
        }
    };

    let output = tokio::select! {
        () = cancel.cancelled() => {
            debug!("Mandatory-deny scan cancelled; keeping partial results");
            return;
        }
        output = child.wait_with_output() => match output {
            Ok(output) => output,
            Err(err) => {
                warn!("File-index scanner failed: {err}");
                return;
            }
        },
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let relative = Path::new(line.trim());
        if relative.as_os_str().is_empty() {
            continue;
        }
        collect_denies_for_hit(cwd, relative, policy.allow_git_config, denies);
    }
}

/// Map one scanner hit (a file path relative to `cwd`) onto deny entries.
fn collect_denies_for_hit(
    cwd: &Path,
    relative: &Path,
    allow_git_config: bool,
    denies: &mut BTreeSet<PathBuf>,
) {
    let components: Vec<&OsStr> = relative.iter().collect();
    if components.is_empty() {
        return;
    }
    let last = components.len() - 1;

    // The hit itself, when it is one of the dangerous dotfiles.
    if DANGEROUS_FILES
        .iter()
        .any(|name| OsStr::new(name) == components[last])
    {
        denies.insert(cwd.join(relative));
    }

    for (index, component) in components.iter().enumerate() {
        // A dangerous directory appearing as a strict ancestor of the hit.
        if index < last {
            for entry in DANGEROUS_DIRECTORIES {
                let parts: Vec<&str> = entry.split('/').collect();
                let end = index + parts.len();
                if end <= last
                    && parts
                        .iter()
                        .zip(&components[index..end])
                        .all(|(part, component)| OsStr::new(part) == *component)
                {
                    denies.insert(cwd.join(join_components(&components[..end])));
                }
            }
        }

        // A nested repository: apply the same layout rules as the top level.
        if *component == OsStr::new(".git") && index < last {
            let git_dir = cwd.join(join_components(&components[..=index]));
            insert_git_denies(
                git_dir.parent().unwrap_or(cwd),
                allow_git_config,
                denies,
            );
        }
    }
}

fn join_components(components: &[&OsStr]) -> PathBuf {
    components.iter().collect()
}
