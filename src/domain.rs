use std::net::IpAddr;
use std::time::Duration;

use tracing::debug;

/// Upper bound on a reverse DNS lookup during admission.
pub const REVERSE_DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolve the display name for a destination.
///
/// Destinations that already name a domain pass through untouched. Address
/// literals get a reverse lookup on a blocking thread, bounded by
/// [`REVERSE_DNS_TIMEOUT`]; any failure or timeout degrades to the literal
/// host.
pub async fn resolve_destination(destination: &str) -> String {
    let host = destination_host(destination);

    let ip: IpAddr = match host.parse() {
        Ok(ip) => ip,
        // Already a domain name.
        Err(_) => return host.to_string(),
    };

    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
    match tokio::time::timeout(REVERSE_DNS_TIMEOUT, lookup).await {
        Ok(Ok(Ok(name))) => name.trim_end_matches('.').to_string(),
        Ok(Ok(Err(e))) => {
            debug!(host, error = %e, "reverse DNS lookup failed");
            host.to_string()
        }
        Ok(Err(e)) => {
            debug!(host, error = %e, "reverse DNS task failed");
            host.to_string()
        }
        Err(_) => {
            debug!(host, "reverse DNS lookup timed out");
            host.to_string()
        }
    }
}

/// Extract the host part of a `host:port` destination. Bracketed IPv6
/// literals lose their brackets; a destination without a numeric port is
/// returned whole.
pub fn destination_host(destination: &str) -> &str {
    if let Some(rest) = destination.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match destination.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => destination,
    }
}
