//! macOS policy compilation: a Seatbelt (SBPL) profile around `sandbox-exec`.
//!
//! The profile engine evaluates rules last-match-wins, so each family is
//! emitted as a blanket default followed by carve-ins, and deny rules follow
//! the allows they override.
//!
//! Two defenses here have no Linux analogue. Renaming a read-denied path
//! into readable territory is a *write* operation checked against the
//! source's ancestor chain, so every read deny is accompanied by
//! `file-write-unlink` denies on the path and each ancestor up to `/`. And
//! Unix-socket *creation* is a `system-socket` operation that carries no
//! path, so it can only be permitted with a socket-domain predicate; the
//! path-shaped rules apply to bind and connect.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use warden_fs::PathKind;

use crate::pattern::PathPattern;
use crate::settings::SandboxPolicy;
use crate::{CommandContext, SandboxError, env};

/// The profile-engine invoker shipped with macOS.
const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

const PREAMBLE: &str = "\
(version 1)
(allow default)

; Blanket denies; rule families below carve access back in. The engine
; applies the last matching rule.
(deny network*)
(deny system-socket)
(deny mach-lookup)

; Process lifecycle and enumeration.
(allow process-fork)
(allow process-exec)
(allow signal (target others))
(allow sysctl-read
  (sysctl-name \"kern.proc.all\")
  (sysctl-name-prefix \"kern.proc.pid.\"))
";

/// Compile `policy` into a composite `sandbox-exec` invocation.
pub(crate) fn compile_command(
    command: &str,
    policy: &SandboxPolicy,
    mandatory_denies: &[PathBuf],
    ctx: &CommandContext,
) -> Result<String, SandboxError> {
    if !Path::new(SANDBOX_EXEC).exists() {
        return Err(SandboxError::ToolNotFound("sandbox-exec"));
    }
    let shell = warden_shell::resolve_shell(ctx.bin_shell.as_deref())?;
    let profile = build_profile(policy, mandatory_denies, &ctx.cwd)?;

    let mut words: Vec<String> = Vec::new();
    if let Some(bridge) = policy.network.bridge.as_ref().filter(|_| policy.network.restricted) {
        // No mount namespace to carry `setenv` directives; prefix with env(1).
        words.push("/usr/bin/env".to_string());
        for (key, value) in env::bridge_env(bridge) {
            words.push(format!("{key}={value}"));
        }
    }
    words.push(SANDBOX_EXEC.to_string());
    words.push("-p".to_string());
    words.push(profile);
    words.push(shell.to_string_lossy().into_owned());
    words.push("-c".to_string());
    words.push(command.to_string());

    Ok(warden_shell::join(&words))
}

/// Generate the SBPL profile text for `policy`.
pub(crate) fn build_profile(
    policy: &SandboxPolicy,
    mandatory_denies: &[PathBuf],
    cwd: &Path,
) -> Result<String, SandboxError> {
    let mut buffer: Vec<u8> = PREAMBLE.as_bytes().to_vec();

    write_filesystem_rules(&mut buffer, policy, mandatory_denies, cwd)?;
    write_network_rules(&mut buffer, policy)?;
    write_unix_socket_rules(&mut buffer, policy)?;

    if policy.allow_pty {
        buffer.write_all(
            b"\n; Pseudo-terminal allocation.\n\
              (allow pseudo-tty)\n\
              (allow file-read* file-write*\n  \
                (literal \"/dev/ptmx\")\n  \
                (regex #\"^/dev/ttys[0-9]+$\"))\n",
        )?;
    }

    String::from_utf8(buffer)
        .map_err(|_| SandboxError::UnrepresentablePath(PathBuf::from("<profile>")))
}

fn write_filesystem_rules(
    buffer: &mut Vec<u8>,
    policy: &SandboxPolicy,
    mandatory_denies: &[PathBuf],
    cwd: &Path,
) -> Result<(), SandboxError> {
    let Some(write) = &policy.write else {
        buffer.write_all(b"\n; Writes are unrestricted by this policy.\n(allow file-write*)\n")?;
        write_read_deny_rules(buffer, policy, cwd)?;
        return Ok(());
    };

    buffer.write_all(b"\n; Writes: denied by default, allowed per path below.\n")?;
    writeln!(buffer, "(deny file-write* (subpath \"/\"))")?;
    write_device_rules(buffer)?;

    for entry in &write.allow_only {
        let pattern = PathPattern::parse(entry, cwd).resolved_within_scope();
        match &pattern {
            PathPattern::Literal(path) => {
                let escaped = escape_profile_path(path)?;
                let filter = path_filter(path);
                writeln!(buffer, "(allow file-write* ({filter} {escaped}))")?;
            }
            PathPattern::Glob { .. } => {
                let regex = profile_regex(&pattern)?;
                writeln!(buffer, "(allow file-write* (regex {regex}))")?;
            }
        }
    }

    buffer.write_all(b"\n; Write denies override the allows above.\n")?;
    for entry in &write.deny_within_allow {
        let pattern = PathPattern::parse(entry, cwd).resolved_within_scope();
        write_deny_family(buffer, "file-write*", &pattern)?;
    }
    for path in mandatory_denies {
        let pattern = PathPattern::Literal(path.clone()).resolved_within_scope();
        write_deny_family(buffer, "file-write*", &pattern)?;
    }

    write_read_deny_rules(buffer, policy, cwd)?;
    Ok(())
}

fn write_read_deny_rules(
    buffer: &mut Vec<u8>,
    policy: &SandboxPolicy,
    cwd: &Path,
) -> Result<(), SandboxError> {
    let Some(read) = &policy.read else {
        return Ok(());
    };
    if read.deny_only.is_empty() {
        return Ok(());
    }

    buffer.write_all(b"\n; Read denies, with rename-blocking on each ancestor chain.\n")?;
    for entry in &read.deny_only {
        let pattern = PathPattern::parse(entry, cwd).resolved_within_scope();
        write_deny_family(buffer, "file-read*", &pattern)?;
    }
    Ok(())
}

/// Emit the deny rules for one path or glob: the operation deny itself plus
/// `file-write-unlink` denies covering the path and every ancestor up to
/// `/`. Without the ancestor chain, `mv denied/ elsewhere/` re-parents the
/// protected subtree into readable or writable territory.
fn write_deny_family(
    buffer: &mut Vec<u8>,
    operation: &str,
    pattern: &PathPattern,
) -> Result<(), SandboxError> {
    match pattern {
        PathPattern::Literal(path) => {
            let escaped = escape_profile_path(path)?;
            // Both filters: a path can change type between compile and
            // sandbox start, and the stricter reading is the safe one.
            writeln!(buffer, "(deny {operation} (subpath {escaped}))")?;
            writeln!(buffer, "(deny {operation} (literal {escaped}))")?;
            write_unlink_chain(buffer, path)?;
        }
        PathPattern::Glob { .. } => {
            let regex = profile_regex(pattern)?;
            writeln!(buffer, "(deny {operation} (regex {regex}))")?;
            writeln!(buffer, "(deny file-write-unlink (regex {regex}))")?;
            // The wildcard tail names no concrete ancestors; the chain runs
            // from the pattern's literal base.
            write_unlink_chain(buffer, pattern.base())?;
        }
    }
    Ok(())
}

fn write_unlink_chain(buffer: &mut Vec<u8>, path: &Path) -> Result<(), SandboxError> {
    for ancestor in path.ancestors() {
        let escaped = escape_profile_path(ancestor)?;
        writeln!(buffer, "(deny file-write-unlink (literal {escaped}))")?;
    }
    Ok(())
}

/// Device nodes that must stay usable under the blanket write deny.
fn write_device_rules(buffer: &mut Vec<u8>) -> Result<(), SandboxError> {
    buffer.write_all(
        b"\
; Standard devices stay usable under the blanket write deny.
(allow file-write* file-write-data
  (literal \"/dev/null\")
  (literal \"/dev/zero\")
  (literal \"/dev/stdout\")
  (literal \"/dev/stderr\")
  (literal \"/dev/tty\"))
(allow file-ioctl
  (literal \"/dev/null\")
  (literal \"/dev/zero\")
  (literal \"/dev/tty\"))
",
    )?;
    Ok(())
}

fn write_network_rules(buffer: &mut Vec<u8>, policy: &SandboxPolicy) -> Result<(), SandboxError> {
    let network = &policy.network;
    if !network.restricted {
        buffer.write_all(
            b"\n; Network unrestricted.\n\
              (allow network*)\n\
              (allow system-socket)\n\
              (allow mach-lookup (global-name \"com.apple.dnssd.service\"))\n",
        )?;
        return Ok(());
    }

    if let Some(bridge) = &network.bridge {
        buffer.write_all(b"\n; Network restricted to the bridge proxies and DNS.\n")?;
        writeln!(
            buffer,
            "(allow network-outbound (remote tcp \"localhost:{}\"))",
            bridge.http_port
        )?;
        writeln!(
            buffer,
            "(allow network-outbound (remote tcp \"localhost:{}\"))",
            bridge.socks_port
        )?;
        buffer.write_all(
            b"(allow network-outbound (remote udp \"localhost:53\"))\n\
              (allow mach-lookup (global-name \"com.apple.dnssd.service\"))\n",
        )?;
    } else {
        buffer.write_all(b"\n; Network fully blocked.\n")?;
    }

    if policy.allow_local_binding {
        // The IPv4-mapped form is what dual-stack runtimes actually bind.
        buffer.write_all(
            b"(allow network-bind network-inbound\n  \
                (local ip \"127.0.0.1:*\")\n  \
                (local ip \"[::1]:*\")\n  \
                (local ip \"[::ffff:127.0.0.1]:*\"))\n",
        )?;
    }
    Ok(())
}

fn write_unix_socket_rules(
    buffer: &mut Vec<u8>,
    policy: &SandboxPolicy,
) -> Result<(), SandboxError> {
    let sockets = &policy.unix_sockets;
    if sockets.allow_all {
        buffer.write_all(
            b"\n; Unix sockets unrestricted.\n\
              (allow system-socket (socket-domain AF_UNIX))\n\
              (allow network-bind network-inbound (local unix-socket))\n\
              (allow network-outbound (remote unix-socket))\n",
        )?;
        return Ok(());
    }

    // The unrestricted-network family above re-allows sockets wholesale, so
    // the restriction must be restated here, after it.
    buffer.write_all(
        b"\n; Unix sockets restricted.\n\
          (deny network-bind (local unix-socket))\n\
          (deny network-inbound (local unix-socket))\n\
          (deny network-outbound (remote unix-socket))\n",
    )?;

    if sockets.allow_paths.is_empty() {
        writeln!(buffer, "(deny system-socket (socket-domain AF_UNIX))")?;
        return Ok(());
    }

    // Creation carries no path, so the domain is allowed wholesale and only
    // bind/connect are path-constrained.
    writeln!(buffer, "(allow system-socket (socket-domain AF_UNIX))")?;
    for path in &sockets.allow_paths {
        let escaped = escape_profile_path(path)?;
        let filter = path_filter(path);
        writeln!(
            buffer,
            "(allow network-bind network-inbound (local unix-socket ({filter} {escaped})))"
        )?;
        writeln!(
            buffer,
            "(allow network-outbound (remote unix-socket ({filter} {escaped})))"
        )?;
    }
    Ok(())
}

/// `subpath` for directories (and paths that may yet be created), `literal`
/// for existing files.
fn path_filter(path: &Path) -> &'static str {
    match warden_fs::classify(path) {
        PathKind::File | PathKind::Symlink => "literal",
        PathKind::Dir => "subpath",
        PathKind::Missing => {
            debug!(
                "Profile rule for missing path {}; defaulting to subpath",
                path.display()
            );
            "subpath"
        }
    }
}

/// Escape and quote a path for an SBPL string literal.
///
/// Rejects bytes that could terminate or extend the surrounding expression:
/// newlines and NUL would inject rules, parentheses delimit expressions, and
/// semicolons start comments. Failing closed here beats emitting a profile
/// that reads differently than the policy.
fn escape_profile_path(path: &Path) -> Result<String, SandboxError> {
    let Some(text) = path.to_str() else {
        return Err(SandboxError::UnrepresentablePath(path.to_path_buf()));
    };
    let trimmed = text.trim_end_matches('/');
    let trimmed = if trimmed.is_empty() { "/" } else { trimmed };

    if trimmed
        .bytes()
        .any(|b| matches!(b, b'\n' | b'\r' | b'\0' | b'(' | b')' | b';'))
    {
        return Err(SandboxError::UnrepresentablePath(path.to_path_buf()));
    }

    let escaped = trimmed.replace('\\', r"\\").replace('"', r#"\""#);
    Ok(format!("\"{escaped}\""))
}

/// Render a glob as an SBPL `regex` literal, with the same injection checks.
fn profile_regex(pattern: &PathPattern) -> Result<String, SandboxError> {
    let Some(regex) = pattern.to_profile_regex() else {
        return Err(SandboxError::UnrepresentablePath(pattern.base().to_path_buf()));
    };
    if regex
        .bytes()
        .any(|b| matches!(b, b'\n' | b'\r' | b'\0' | b'"' | b';'))
    {
        return Err(SandboxError::UnrepresentablePath(pattern.base().to_path_buf()));
    }
    Ok(format!("#\"{regex}\""))
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;

    use crate::settings::{
        NetworkBridge, NetworkPolicy, ReadPolicy, UnixSocketPolicy, WritePolicy,
    };

    use super::*;

    fn profile(policy: &SandboxPolicy) -> String {
        build_profile(policy, &[], Path::new("/work")).unwrap()
    }

    fn read_deny_policy(paths: &[&str]) -> SandboxPolicy {
        SandboxPolicy {
            read: Some(ReadPolicy {
                deny_only: paths.iter().map(ToString::to_string).collect(),
            }),
            ..SandboxPolicy::default()
        }
    }

    #[test]
    fn preamble_denies_network_and_sockets_by_default() {
        let text = profile(&read_deny_policy(&["/srv/secret"]));
        assert!(text.starts_with("(version 1)\n(allow default)\n"));
        assert!(text.contains("(deny network*)"));
        assert!(text.contains("(deny system-socket)"));
        assert!(text.contains("(deny mach-lookup)"));
        assert!(text.contains("(sysctl-name \"kern.proc.all\")"));
    }

    #[test]
    fn read_deny_blocks_rename_on_every_ancestor() {
        let text = profile(&read_deny_policy(&["/tmp/T/denied"]));

        assert!(text.contains("(deny file-read* (subpath \"/tmp/T/denied\"))"));
        assert!(text.contains("(deny file-read* (literal \"/tmp/T/denied\"))"));
        for ancestor in ["/tmp/T/denied", "/tmp/T", "/tmp", "/"] {
            assert!(
                text.contains(&format!("(deny file-write-unlink (literal \"{ancestor}\"))")),
                "missing unlink protection for {ancestor}"
            );
        }
    }

    #[test]
    fn glob_read_deny_uses_regex_and_base_ancestors() {
        let text = profile(&read_deny_policy(&["/srv/data/*.key"]));

        assert!(text.contains(r#"(deny file-read* (regex #"^/srv/data/[^/]*\.key$"))"#));
        assert!(text.contains(r#"(deny file-write-unlink (regex #"^/srv/data/[^/]*\.key$"))"#));
        for ancestor in ["/srv/data", "/srv", "/"] {
            assert!(
                text.contains(&format!("(deny file-write-unlink (literal \"{ancestor}\"))")),
                "missing unlink protection for {ancestor}"
            );
        }
    }

    #[test]
    fn unrestricted_writes_stay_open() {
        let text = profile(&read_deny_policy(&["/srv/secret"]));
        assert!(text.contains("(allow file-write*)"));
        assert!(!text.contains("(deny file-write* (subpath \"/\"))"));
    }

    #[test]
    fn restricted_writes_deny_by_default_and_carve_in() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("area").create_dir_all().unwrap();
        let area = warden_fs::resolve(temp.child("area").path()).unwrap();

        let policy = SandboxPolicy {
            write: Some(WritePolicy {
                allow_only: vec![area.to_string_lossy().into_owned()],
                deny_within_allow: vec![format!("{}/.env", area.display())],
            }),
            ..SandboxPolicy::default()
        };
        let text = profile(&policy);

        assert!(text.contains("(deny file-write* (subpath \"/\"))"));
        let allow = format!("(allow file-write* (subpath \"{}\"))", area.display());
        assert!(text.contains(&allow));
        let deny = format!("(deny file-write* (subpath \"{}/.env\"))", area.display());
        assert!(text.contains(&deny));
        // Denies must come after the allow they override.
        assert!(text.find(&allow).unwrap() < text.find(&deny).unwrap());
        // Devices stay writable.
        assert!(text.contains("(literal \"/dev/null\")"));
    }

    #[test]
    fn widening_symlink_keeps_original_write_allow_path() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("user_area").create_dir_all().unwrap();
        temp.child("protected").create_dir_all().unwrap();
        temp.child("user_area/evil")
            .symlink_to_dir(temp.child("protected").path())
            .unwrap();

        let evil = temp.child("user_area/evil").path().to_path_buf();
        let policy = SandboxPolicy {
            write: Some(WritePolicy {
                allow_only: vec![evil.to_string_lossy().into_owned()],
                deny_within_allow: Vec::new(),
            }),
            ..SandboxPolicy::default()
        };
        let text = profile(&policy);

        // The rule must name the original path, not the widened resolution;
        // a symlink kept in its original spelling is a `literal` target.
        assert!(text.contains(&format!("(allow file-write* (literal \"{}\"))", evil.display())));
        let resolved = warden_fs::resolve(&evil).unwrap();
        assert!(!text.contains(&format!("(allow file-write* (subpath \"{}\"))", resolved.display())));
    }

    #[test]
    fn widening_glob_base_keeps_original_pattern() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("wide").create_dir_all().unwrap();
        temp.child("wide/inner").create_dir_all().unwrap();
        temp.child("wide/inner/up")
            .symlink_to_dir(temp.child("wide").path())
            .unwrap();

        let pattern = format!("{}/wide/inner/up/*.key", temp.path().display());
        let text = profile(&read_deny_policy(&[pattern.as_str()]));

        // The emitted regex still spells the original base.
        assert!(text.contains("/wide/inner/up/"));
    }

    #[test]
    fn mandatory_denies_are_rendered_with_unlink_chains() {
        let policy = SandboxPolicy {
            write: Some(WritePolicy {
                allow_only: vec!["/work".to_string()],
                deny_within_allow: Vec::new(),
            }),
            ..SandboxPolicy::default()
        };
        let text =
            build_profile(&policy, &[PathBuf::from("/work/.bashrc")], Path::new("/work")).unwrap();

        assert!(text.contains("(deny file-write* (literal \"/work/.bashrc\"))"));
        assert!(text.contains("(deny file-write-unlink (literal \"/work/.bashrc\"))"));
        assert!(text.contains("(deny file-write-unlink (literal \"/work\"))"));
        assert!(text.contains("(deny file-write-unlink (literal \"/\"))"));
    }

    #[test]
    fn unrestricted_network_allows_wildcard() {
        let text = profile(&read_deny_policy(&["/srv/secret"]));
        assert!(text.contains("(allow network*)"));
    }

    #[test]
    fn bridged_network_allows_only_proxies_and_dns() {
        let policy = SandboxPolicy {
            read: Some(ReadPolicy {
                deny_only: vec!["/srv/secret".to_string()],
            }),
            network: NetworkPolicy {
                restricted: true,
                bridge: Some(NetworkBridge {
                    http_socket_path: PathBuf::from("/run/warden/http.sock"),
                    socks_socket_path: PathBuf::from("/run/warden/socks.sock"),
                    http_port: 18080,
                    socks_port: 18081,
                }),
            },
            ..SandboxPolicy::default()
        };
        let text = profile(&policy);

        assert!(!text.contains("(allow network*)"));
        assert!(text.contains("(allow network-outbound (remote tcp \"localhost:18080\"))"));
        assert!(text.contains("(allow network-outbound (remote tcp \"localhost:18081\"))"));
        assert!(text.contains("(allow network-outbound (remote udp \"localhost:53\"))"));
        assert!(text.contains("com.apple.dnssd.service"));
    }

    #[test]
    fn local_binding_covers_mapped_ipv6_form() {
        let policy = SandboxPolicy {
            network: NetworkPolicy {
                restricted: true,
                bridge: None,
            },
            allow_local_binding: true,
            ..SandboxPolicy::default()
        };
        let text = profile(&policy);

        assert!(text.contains("(local ip \"127.0.0.1:*\")"));
        assert!(text.contains("(local ip \"[::1]:*\")"));
        assert!(text.contains("(local ip \"[::ffff:127.0.0.1]:*\")"));
    }

    #[test]
    fn unix_sockets_allow_all_permits_domain_and_paths() {
        let policy = SandboxPolicy {
            network: NetworkPolicy {
                restricted: true,
                bridge: None,
            },
            ..SandboxPolicy::default()
        };
        let text = profile(&policy);

        // Socket policy is independent of network policy.
        assert!(text.contains("(allow system-socket (socket-domain AF_UNIX))"));
        assert!(text.contains("(allow network-bind network-inbound (local unix-socket))"));
        assert!(text.contains("(allow network-outbound (remote unix-socket))"));
    }

    #[test]
    fn unix_socket_allow_paths_constrain_bind_and_connect() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("sockets").create_dir_all().unwrap();
        let dir = temp.child("sockets").path().to_path_buf();

        let policy = SandboxPolicy {
            unix_sockets: UnixSocketPolicy {
                allow_all: false,
                allow_paths: vec![dir.clone()],
            },
            ..SandboxPolicy::default()
        };
        let text = profile(&policy);

        // Creation is domain-wide; only bind/connect carry the path filter.
        assert!(text.contains("(allow system-socket (socket-domain AF_UNIX))"));
        assert!(text.contains(&format!(
            "(allow network-bind network-inbound (local unix-socket (subpath \"{}\")))",
            dir.display()
        )));
        assert!(text.contains(&format!(
            "(allow network-outbound (remote unix-socket (subpath \"{}\")))",
            dir.display()
        )));
        // The unscoped deny precedes the scoped allows.
        assert!(
            text.find("(deny network-bind (local unix-socket))").unwrap()
                < text.find("(allow network-bind network-inbound").unwrap()
        );
    }

    #[test]
    fn unix_sockets_denied_when_nothing_is_allowed() {
        let policy = SandboxPolicy {
            unix_sockets: UnixSocketPolicy {
                allow_all: false,
                allow_paths: Vec::new(),
            },
            ..SandboxPolicy::default()
        };
        let text = profile(&policy);

        assert!(text.contains("(deny system-socket (socket-domain AF_UNIX))"));
        assert!(!text.contains("(allow system-socket (socket-domain AF_UNIX))"));
    }

    #[test]
    fn pty_rules_are_opt_in() {
        let base = profile(&read_deny_policy(&["/srv/secret"]));
        assert!(!base.contains("pseudo-tty"));

        let policy = SandboxPolicy {
            allow_pty: true,
            ..read_deny_policy(&["/srv/secret"])
        };
        let text = profile(&policy);
        assert!(text.contains("(allow pseudo-tty)"));
        assert!(text.contains("/dev/ptmx"));
    }

    #[test]
    fn injection_shaped_paths_are_rejected() {
        let err = build_profile(
            &read_deny_policy(&["/tmp/evil\n(allow network*)"]),
            &[],
            Path::new("/work"),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::UnrepresentablePath(_)));

        let err = build_profile(
            &read_deny_policy(&["/tmp/evil;comment"]),
            &[],
            Path::new("/work"),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::UnrepresentablePath(_)));
    }

    #[test]
    fn trailing_slash_renders_identically() {
        let with = profile(&read_deny_policy(&["/srv/secret/"]));
        let without = profile(&read_deny_policy(&["/srv/secret"]));
        assert_eq!(with, without);
    }
}
