//! Relay address normalization and local auto-discovery.

use crate::config::ConnectionConfig;
use crate::relay::Connector;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hosts that are tunnels by construction and work from a secure context.
const TUNNEL_HOST_MARKERS: [&str; 2] = ["ngrok", "cloudflare"];

fn strip_scheme<'a>(raw: &'a str, scheme: &str) -> Option<&'a str> {
    let head = raw.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme)
        .then(|| &raw[scheme.len()..])
}

/// Rewrite a configured address into the socket URL that is actually dialed.
///
/// - `https://` becomes `wss://`, `http://` becomes `ws://`
/// - a bare `host[:port][/path]` gets `wss://` in a secure context, else `ws://`
/// - `ws://` is upgraded to `wss://` in a secure context
///
/// Pure and idempotent. An empty (or blank) address stays empty.
#[must_use]
pub fn normalize_endpoint(raw: &str, secure_context: bool) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let insecure = if secure_context { "wss://" } else { "ws://" };

    if let Some(rest) = strip_scheme(raw, "https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = strip_scheme(raw, "wss://") {
        format!("wss://{rest}")
    } else if let Some(rest) = strip_scheme(raw, "http://") {
        format!("{insecure}{rest}")
    } else if let Some(rest) = strip_scheme(raw, "ws://") {
        format!("{insecure}{rest}")
    } else {
        format!("{insecure}{raw}")
    }
}

/// True when a direct (unproxied) address is configured from a secure
/// context and does not look like a tunnel; such links often fail.
#[must_use]
pub fn needs_tunnel_hint(config: &ConnectionConfig, secure_context: bool) -> bool {
    secure_context
        && config.proxy_url.is_empty()
        && !config.endpoint_url.is_empty()
        && !TUNNEL_HOST_MARKERS
            .iter()
            .any(|m| config.endpoint_url.contains(m))
}

/// Log the tunnel hint if it applies.
pub fn warn_if_direct_from_secure(config: &ConnectionConfig, secure_context: bool) {
    if needs_tunnel_hint(config, secure_context) {
        warn!(
            endpoint = %config.endpoint_url,
            "direct relay address from a secure context; configure a proxy/tunnel URL if the link fails"
        );
    }
}

/// Probe `localhost` on each port in order and return the first address that
/// accepts a socket connection within `probe_timeout`. The probe connection
/// is closed before returning.
pub async fn discover<C: Connector>(
    connector: &C,
    ports: &[u16],
    secure_context: bool,
    probe_timeout: Duration,
) -> Option<String> {
    let scheme = if secure_context { "wss" } else { "ws" };
    for port in ports {
        let url = format!("{scheme}://localhost:{port}");
        debug!(url = %url, "probing for local relay");
        match tokio::time::timeout(probe_timeout, connector.connect(&url)).await {
            Ok(Ok(mut probe)) => {
                let _ = tokio::time::timeout(probe_timeout, probe.close(None)).await;
                info!(url = %url, "discovered local relay");
                return Some(url);
            }
            Ok(Err(e)) => debug!(url = %url, error = %e, "probe refused"),
            Err(_) => debug!(url = %url, "probe timed out"),
        }
    }
    None
}
