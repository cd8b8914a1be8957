//! Path patterns: literal paths and globs, and the symlink boundary check
//! both rule emitters share.
//!
//! A policy entry is a glob when it contains an unescaped `*` or `?`. The
//! glob's *base* is the longest prefix with no wildcard, cut at a component
//! boundary; the base is what existence and symlink checks run against,
//! since the wildcard tail names nothing concrete on disk.

use std::path::{Path, PathBuf};

use tracing::debug;

use warden_fs::{normalize_path, symlink_widens};

/// A policy path entry, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathPattern {
    /// A literal absolute path.
    Literal(PathBuf),
    /// A glob, split into its wildcard-free base and the full pattern text.
    Glob { base: PathBuf, pattern: String },
}

impl PathPattern {
    /// Parse a policy entry, absolutizing it against `cwd`.
    pub(crate) fn parse(entry: &str, cwd: &Path) -> Self {
        if let Some(split) = wildcard_offset(entry) {
            // Cut the base at the last separator before the first wildcard.
            let base_end = entry[..split].rfind('/').unwrap_or(0);
            let raw_base = if base_end == 0 {
                if entry.starts_with('/') { "/" } else { "." }
            } else {
                &entry[..base_end]
            };

            let base = warden_fs::absolutize(Path::new(raw_base), cwd);
            let pattern = if Path::new(entry).is_absolute() {
                normalize_path(Path::new(entry)).to_string_lossy().into_owned()
            } else {
                // Re-anchor a relative glob under the (absolute) base.
                format!("{}/{}", base.display(), &entry[base_end..].trim_start_matches('/'))
            };
            Self::Glob { base, pattern }
        } else {
            Self::Literal(warden_fs::absolutize(Path::new(entry), cwd))
        }
    }

    /// The concrete filesystem anchor of this pattern.
    pub(crate) fn base(&self) -> &Path {
        match self {
            Self::Literal(path) => path,
            Self::Glob { base, .. } => base,
        }
    }

    /// Expand to existing filesystem matches. A literal expands to itself
    /// whether or not it exists (the compiler handles missing paths); a glob
    /// expands to whatever currently matches, which may be nothing.
    pub(crate) fn expand(&self) -> Vec<PathBuf> {
        match self {
            Self::Literal(path) => vec![path.clone()],
            Self::Glob { pattern, .. } => match glob::glob(pattern) {
                Ok(matches) => matches.filter_map(Result::ok).collect(),
                Err(err) => {
                    debug!("Ignoring malformed glob `{pattern}`: {err}");
                    Vec::new()
                }
            },
        }
    }

    /// Resolve symlinks through the shared boundary check.
    ///
    /// The canonical form is used only when resolution does not widen scope;
    /// otherwise the original spelling is kept, so a scope-widening symlink
    /// never smuggles its target into a rule. For a glob, the check runs on
    /// the base and the wildcard tail is re-anchored under the resolved base.
    pub(crate) fn resolved_within_scope(&self) -> Self {
        match self {
            Self::Literal(path) => match warden_fs::resolve(path) {
                Ok(resolved) if !symlink_widens(path, &resolved) => Self::Literal(resolved),
                _ => self.clone(),
            },
            Self::Glob { base, pattern } => match warden_fs::resolve(base) {
                Ok(resolved) if !symlink_widens(base, &resolved) => {
                    let tail = pattern
                        .strip_prefix(&base.display().to_string())
                        .unwrap_or("")
                        .trim_start_matches('/');
                    let rebased = if tail.is_empty() {
                        resolved.display().to_string()
                    } else {
                        format!("{}/{tail}", resolved.display())
                    };
                    Self::Glob {
                        base: resolved,
                        pattern: rebased,
                    }
                }
                _ => self.clone(),
            },
        }
    }

    /// Translate a glob into an anchored regex for a Seatbelt `regex` filter.
    ///
    /// `*` matches within one component, `**` crosses separators, `?`
    /// matches one non-separator character; everything else is escaped.
    pub(crate) fn to_profile_regex(&self) -> Option<String> {
        let Self::Glob { pattern, .. } = self else {
            return None;
        };

        let mut regex = String::with_capacity(pattern.len() + 8);
        regex.push('^');
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        regex.push_str(".*");
                    } else {
                        regex.push_str("[^/]*");
                    }
                }
                '?' => regex.push_str("[^/]"),
                '\\' => {
                    // An escaped wildcard is a literal character.
                    if let Some(next) = chars.next() {
                        push_escaped(&mut regex, next);
                    }
                }
                other => push_escaped(&mut regex, other),
            }
        }
        regex.push('$');
        Some(regex)
    }
}

/// Byte offset of the first unescaped `*` or `?`, if any.
fn wildcard_offset(entry: &str) -> Option<usize> {
    let mut escaped = false;
    for (offset, c) in entry.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '*' | '?' if !escaped => return Some(offset),
            _ => escaped = false,
        }
    }
    None
}

fn push_escaped(regex: &mut String, c: char) {
    if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-') {
        regex.push(c);
    } else {
        regex.push('\\');
        regex.push(c);
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;

    use super::*;

    #[test]
    fn literal_entries_are_absolutized() {
        let pattern = PathPattern::parse("src/config", Path::new("/work"));
        assert_eq!(pattern, PathPattern::Literal(PathBuf::from("/work/src/config")));
    }

    #[test]
    fn glob_base_stops_before_first_wildcard() {
        let pattern = PathPattern::parse("/srv/data/*.key", Path::new("/work"));
        let PathPattern::Glob { base, pattern } = pattern else {
            panic!("expected a glob");
        };
        assert_eq!(base, PathBuf::from("/srv/data"));
        assert_eq!(pattern, "/srv/data/*.key");
    }

    #[test]
    fn wildcard_in_middle_component_splits_at_separator() {
        let pattern = PathPattern::parse("/srv/da*a/file", Path::new("/"));
        assert_eq!(pattern.base(), Path::new("/srv"));
    }

    #[test]
    fn escaped_wildcard_is_literal() {
        let pattern = PathPattern::parse(r"/srv/\*literal", Path::new("/"));
        assert!(matches!(pattern, PathPattern::Literal(_)));
    }

    #[test]
    fn question_mark_is_a_wildcard() {
        let pattern = PathPattern::parse("/srv/file?.txt", Path::new("/"));
        assert!(matches!(pattern, PathPattern::Glob { .. }));
    }

    #[test]
    fn relative_glob_is_anchored_under_cwd() {
        let pattern = PathPattern::parse("build/*.o", Path::new("/work"));
        let PathPattern::Glob { base, pattern } = pattern else {
            panic!("expected a glob");
        };
        assert_eq!(base, PathBuf::from("/work/build"));
        assert_eq!(pattern, "/work/build/*.o");
    }

    #[test]
    fn expand_glob_matches_existing_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("a.env").touch().unwrap();
        temp.child("b.env").touch().unwrap();
        temp.child("c.txt").touch().unwrap();

        let entry = format!("{}/*.env", temp.path().display());
        let mut matches = PathPattern::parse(&entry, Path::new("/")).expand();
        matches.sort();

        assert_eq!(
            matches,
            vec![
                temp.child("a.env").path().to_path_buf(),
                temp.child("b.env").path().to_path_buf(),
            ]
        );
    }

    #[test]
    fn resolved_within_scope_keeps_widening_glob_base() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("wide").create_dir_all().unwrap();
        temp.child("wide/inner/link-home").create_dir_all().unwrap();
        // A base that resolves to an ancestor of itself.
        temp.child("wide/inner/up")
            .symlink_to_dir(temp.child("wide").path())
            .unwrap();

        let entry = format!("{}/wide/inner/up/*.key", temp.path().display());
        let pattern = PathPattern::parse(&entry, Path::new("/"));
        let resolved = pattern.resolved_within_scope();

        // The widening resolution must not replace the original pattern.
        assert_eq!(resolved, pattern);
    }

    #[test]
    fn resolved_within_scope_rebases_safe_glob() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("real/deep").create_dir_all().unwrap();
        temp.child("alias")
            .symlink_to_dir(temp.child("real/deep").path())
            .unwrap();

        let entry = format!("{}/alias/*.log", temp.path().display());
        let pattern = PathPattern::parse(&entry, Path::new("/"));

        let PathPattern::Glob { base, pattern } = pattern.resolved_within_scope() else {
            panic!("expected a glob");
        };
        assert!(base.ends_with("real/deep"));
        assert!(pattern.ends_with("real/deep/*.log"));
    }

    #[test]
    fn profile_regex_translation() {
        let pattern = PathPattern::parse("/srv/data/*.key", Path::new("/"));
        assert_eq!(
            pattern.to_profile_regex().unwrap(),
            r"^/srv/data/[^/]*\.key$"
        );

        let pattern = PathPattern::parse("/srv/**/secret?", Path::new("/"));
        assert_eq!(
            pattern.to_profile_regex().unwrap(),
            r"^/srv/.*/secret[^/]$"
        );

        let literal = PathPattern::parse("/srv/data", Path::new("/"));
        assert_eq!(literal.to_profile_regex(), None);
    }
}
