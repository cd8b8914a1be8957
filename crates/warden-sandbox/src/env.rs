//! Environment variables injected into the sandbox.

use crate::settings::NetworkBridge;

/// Host-side HTTP proxy port, informational.
pub const WARDEN_HOST_HTTP_PORT: &str = "WARDEN_HOST_HTTP_PORT";

/// Host-side SOCKS proxy port, informational.
pub const WARDEN_HOST_SOCKS_PORT: &str = "WARDEN_HOST_SOCKS_PORT";

/// Proxy environment for a bridged sandbox: standard proxy variables
/// pointing at the in-sandbox forwarders, plus the informational host ports.
pub(crate) fn bridge_env(bridge: &NetworkBridge) -> Vec<(&'static str, String)> {
    let http = format!("http://127.0.0.1:{}", bridge.http_port);
    let socks = format!("socks5://127.0.0.1:{}", bridge.socks_port);
    vec![
        ("HTTP_PROXY", http.clone()),
        ("HTTPS_PROXY", http),
        ("ALL_PROXY", socks),
        (WARDEN_HOST_HTTP_PORT, bridge.http_port.to_string()),
        (WARDEN_HOST_SOCKS_PORT, bridge.socks_port.to_string()),
    ]
}
