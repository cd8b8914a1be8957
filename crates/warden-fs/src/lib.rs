//! Path-safety primitives for the warden sandbox.
//!
//! The policy compilers never trust a caller-supplied path at face value:
//! a path can be a symlink that resolves somewhere broader than it appears,
//! an intermediate component can be a symlink that the sandboxed process
//! could swap for a real directory, or the path may not exist at all. The
//! predicates in this crate classify those shapes so the compilers can
//! decide whether to mount, clobber, or skip.

use std::path::{Component, Path, PathBuf};

pub use crate::path::{absolutize, normalize_path, strip_trailing_slash};

mod path;

/// Host-specific alias pairs that canonicalization may substitute without
/// widening scope. On macOS, `/tmp` and `/var` are symlinks into `/private`.
const HOST_ALIASES: &[(&str, &str)] = &[("/tmp", "/private/tmp"), ("/var", "/private/var")];

/// What the leaf of a path is, without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// A regular file (or anything that is neither a directory nor a symlink).
    File,
    /// A directory.
    Dir,
    /// A symbolic link, regardless of what it points to.
    Symlink,
    /// The path does not exist.
    Missing,
}

/// Classify the leaf of `path` via `lstat`, never following a symlink.
pub fn classify(path: &Path) -> PathKind {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.file_type().is_symlink() => PathKind::Symlink,
        Ok(metadata) if metadata.is_dir() => PathKind::Dir,
        Ok(_) => PathKind::File,
        Err(_) => PathKind::Missing,
    }
}

/// Resolve a path to its canonical form, eagerly following every symlink
/// component. Fails if the path does not exist.
pub fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    dunce::canonicalize(path)
}

/// Whether following a symlink from `input` to `resolved` would admit more
/// of the filesystem than `input` literally names.
///
/// Returns `true` iff any of the following hold, and no [`HOST_ALIASES`]
/// pair makes the two paths equivalent:
///
/// - `resolved` is the filesystem root;
/// - `resolved` is a strict ancestor of `input` (mounting it would expose
///   every sibling of the original path);
/// - `resolved` is at most four bytes long (a heuristic against very short
///   targets; see the design notes in `DESIGN.md`);
/// - `resolved` escapes the subtree of `input`'s parent directory.
///
/// Resolutions that stay beside or beneath the original path are always
/// permitted; a symlink in `/work/area` may point anywhere under
/// `/work/area`, but not at `/work/protected` next door.
pub fn symlink_widens(input: &Path, resolved: &Path) -> bool {
    let input = strip_trailing_slash(input);
    let resolved = strip_trailing_slash(resolved);

    if input == resolved {
        return false;
    }

    // `/tmp/x` resolving to `/private/tmp/x` (and vice versa) is the host
    // being itself, not an escape.
    let input_aliased = apply_host_aliases(input);
    let resolved_aliased = apply_host_aliases(resolved);
    if input_aliased == resolved_aliased {
        return false;
    }

    if resolved == Path::new("/") {
        return true;
    }

    if input_aliased.starts_with(&resolved_aliased) {
        return true;
    }

    if resolved.as_os_str().len() <= 4 {
        return true;
    }

    let scope = input_aliased.parent().unwrap_or(Path::new("/"));
    !resolved_aliased.starts_with(scope)
}

/// Rewrite a path through the host alias table, so aliased spellings of the
/// same location compare equal.
fn apply_host_aliases(path: &Path) -> PathBuf {
    for (short, long) in HOST_ALIASES {
        if let Ok(suffix) = path.strip_prefix(short) {
            return Path::new(long).join(suffix);
        }
    }
    path.to_path_buf()
}

/// Walk `target` component-by-component and return the first component that
/// is a symbolic link *and* lies inside one of `allowed_write_roots`.
///
/// A sandboxed process with write access to a directory can delete a symlink
/// component of a protected path and recreate it as a real directory,
/// re-rooting the protected subtree somewhere writable. The compiler mounts
/// `/dev/null` over the component returned here, so the swap has nothing to
/// attach to.
pub fn find_symlink_in_path(target: &Path, allowed_write_roots: &[PathBuf]) -> Option<PathBuf> {
    let mut current = PathBuf::new();

    for component in target.components() {
        match component {
            Component::RootDir => {
                current.push(Component::RootDir);
                continue;
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                current.pop();
                continue;
            }
            Component::Normal(part) => current.push(part),
            Component::Prefix(_) => continue,
        }

        let Ok(metadata) = current.symlink_metadata() else {
            // Nothing past a missing component can be a symlink.
            break;
        };

        if metadata.file_type().is_symlink()
            && allowed_write_roots
                .iter()
                .any(|root| current.starts_with(root))
        {
            return Some(current);
        }
    }

    None
}

/// Whether some existing strict prefix of `target` is a regular file.
///
/// When this holds, no `mkdir` sequence can ever materialize `target`, so a
/// deny directive for it is both unnecessary and (as a mount point) invalid.
/// The common shape is a git worktree, where `.git` is a file containing a
/// `gitdir:` pointer.
pub fn has_file_ancestor(target: &Path) -> bool {
    for ancestor in target.ancestors().skip(1) {
        match ancestor.symlink_metadata() {
            Ok(metadata) if !metadata.is_dir() => return true,
            Ok(_) => return false,
            Err(_) => continue,
        }
    }
    false
}

/// The shortest prefix of `target` that does not exist, or `None` when the
/// whole path exists.
pub fn first_nonexistent(target: &Path) -> Option<PathBuf> {
    let mut current = PathBuf::new();

    for component in target.components() {
        match component {
            Component::RootDir => {
                current.push(Component::RootDir);
                continue;
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                current.pop();
                continue;
            }
            Component::Normal(part) => current.push(part),
            Component::Prefix(_) => continue,
        }

        if current.symlink_metadata().is_err() {
            return Some(current);
        }
    }

    None
}

/// The deepest existing ancestor of `target` (which may be `target` itself).
pub fn nearest_existing_ancestor(target: &Path) -> Option<PathBuf> {
    target
        .ancestors()
        .find(|ancestor| ancestor.symlink_metadata().is_ok())
        .map(Path::to_path_buf)
}
