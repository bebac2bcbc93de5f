use clap::Parser;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{ProxyError, ProxyResult};

/// Default port for client proxy traffic.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
/// Default port for the monitoring web interface.
pub const DEFAULT_MONITOR_PORT: u16 = 8082;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Protocol-sniffing HTTP/SOCKS5 proxy with live monitoring",
    long_about = "mixproxy accepts HTTP and SOCKS5 clients on a single port, dispatching on the\nfirst byte of each connection, and relays traffic to the requested upstream.\n\nFeatures:\n- IP allow-list admission (exact hosts or CIDR ranges, from a YAML file)\n- Per-connection bandwidth accounting with idle detection\n- Monitoring endpoints: GET /api/stats, WebSocket /ws, dashboard at /\n"
)]
pub struct Cli {
    /// Enable debug logging for connections
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Port for the monitoring web interface
    #[arg(short = 'm', long = "monitor-port")]
    pub monitor_port: Option<u16>,

    /// Proxy listen port (overrides the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// IP address to bind both listeners
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,
}

/// On-disk configuration. Two shapes are accepted: a flat `allowed_ips` list
/// of exact client hosts, or `ipv4`/`ipv6` CIDR lists with an optional `port`.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    ipv4: Option<Vec<String>>,
    #[serde(default)]
    ipv6: Option<Vec<String>>,
    #[serde(default)]
    port: Option<u16>,
}

/// Client admission policy, frozen at startup.
#[derive(Debug, Clone)]
pub enum AdmissionPolicy {
    /// Exact-match set of client host strings.
    Exact(HashSet<String>),
    /// IPv4 and IPv6 CIDR ranges.
    Ranges(Vec<IpNet>),
}

impl AdmissionPolicy {
    /// Check whether a client address is admitted.
    pub fn allows(&self, ip: IpAddr) -> bool {
        match self {
            AdmissionPolicy::Exact(hosts) => hosts.contains(&ip.to_string()),
            AdmissionPolicy::Ranges(nets) => nets.iter().any(|net| net.contains(&ip)),
        }
    }

    /// Number of policy entries.
    pub fn len(&self) -> usize {
        match self {
            AdmissionPolicy::Exact(hosts) => hosts.len(),
            AdmissionPolicy::Ranges(nets) => nets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_file(file: &ConfigFile) -> ProxyResult<Self> {
        if let Some(hosts) = &file.allowed_ips {
            return Ok(AdmissionPolicy::Exact(hosts.iter().cloned().collect()));
        }

        if file.ipv4.is_none() && file.ipv6.is_none() {
            return Err(ProxyError::Config(
                "config must provide either 'allowed_ips' or 'ipv4'/'ipv6' CIDR lists".to_string(),
            ));
        }

        let mut nets: Vec<IpNet> = Vec::new();
        for cidr in file.ipv4.iter().flatten() {
            let net: Ipv4Net = cidr
                .parse()
                .map_err(|e| ProxyError::Config(format!("invalid IPv4 CIDR '{cidr}': {e}")))?;
            nets.push(net.into());
        }
        for cidr in file.ipv6.iter().flatten() {
            let net: Ipv6Net = cidr
                .parse()
                .map_err(|e| ProxyError::Config(format!("invalid IPv6 CIDR '{cidr}': {e}")))?;
            nets.push(net.into());
        }
        Ok(AdmissionPolicy::Ranges(nets))
    }
}

/// Proxy server configuration derived from CLI arguments and the config file
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub monitor_addr: SocketAddr,
    pub policy: AdmissionPolicy,
    pub debug: bool,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments, reading the YAML config file.
    pub fn load(args: &Cli) -> ProxyResult<Self> {
        let data = std::fs::read_to_string(&args.config).map_err(|e| {
            ProxyError::Config(format!(
                "could not read config file '{}': {e}",
                args.config.display()
            ))
        })?;
        Self::from_sources(args, &data)
    }

    fn from_sources(args: &Cli, data: &str) -> ProxyResult<Self> {
        let file: ConfigFile = serde_yaml::from_str(data)
            .map_err(|e| ProxyError::Config(format!("could not parse config file: {e}")))?;

        let policy = AdmissionPolicy::from_file(&file)?;

        let port = args.port.or(file.port).unwrap_or(DEFAULT_PROXY_PORT);
        let monitor_port = args.monitor_port.unwrap_or(DEFAULT_MONITOR_PORT);

        Ok(Self {
            listen_addr: SocketAddr::from((args.listen_ip, port)),
            monitor_addr: SocketAddr::from((args.listen_ip, monitor_port)),
            policy,
            debug: args.debug,
        })
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            debug: false,
            monitor_port: None,
            port: None,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config: PathBuf::from("config.yaml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_allowed_ips_config() {
        let yaml = "allowed_ips:\n  - 127.0.0.1\n  - 192.168.1.20\n";
        let cfg = ProxyConfig::from_sources(&Cli::default(), yaml).expect("valid config");

        assert!(cfg.policy.allows("127.0.0.1".parse().unwrap()));
        assert!(cfg.policy.allows("192.168.1.20".parse().unwrap()));
        assert!(!cfg.policy.allows("10.0.0.1".parse().unwrap()));
        assert_eq!(cfg.listen_addr.port(), DEFAULT_PROXY_PORT);
        assert_eq!(cfg.monitor_addr.port(), DEFAULT_MONITOR_PORT);
    }

    #[test]
    fn parse_cidr_config_with_port() {
        let yaml = "ipv4:\n  - 10.0.0.0/8\nipv6:\n  - fd00::/8\nport: 9090\n";
        let cfg = ProxyConfig::from_sources(&Cli::default(), yaml).expect("valid config");

        assert!(cfg.policy.allows("10.42.0.7".parse().unwrap()));
        assert!(cfg.policy.allows("fd00::1".parse().unwrap()));
        assert!(!cfg.policy.allows("192.168.1.1".parse().unwrap()));
        assert!(!cfg.policy.allows("2001:db8::1".parse().unwrap()));
        assert_eq!(cfg.listen_addr.port(), 9090);
    }

    #[test]
    fn cli_port_overrides_config_file() {
        let yaml = "ipv4:\n  - 0.0.0.0/0\nport: 9090\n";
        let args = Cli {
            port: Some(7070),
            monitor_port: Some(7072),
            ..Cli::default()
        };
        let cfg = ProxyConfig::from_sources(&args, yaml).expect("valid config");

        assert_eq!(cfg.listen_addr.port(), 7070);
        assert_eq!(cfg.monitor_addr.port(), 7072);
    }

    #[test]
    fn reject_config_without_policy() {
        let err = ProxyConfig::from_sources(&Cli::default(), "port: 9090\n").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn reject_invalid_cidr() {
        let yaml = "ipv4:\n  - 10.0.0.0/33\n";
        let err = ProxyConfig::from_sources(&Cli::default(), yaml).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));

        // An IPv6 range in the IPv4 list is rejected too.
        let yaml = "ipv4:\n  - fd00::/8\n";
        let err = ProxyConfig::from_sources(&Cli::default(), yaml).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn reject_unparseable_yaml() {
        let err =
            ProxyConfig::from_sources(&Cli::default(), "allowed_ips: [unterminated").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn exact_policy_is_exact() {
        let yaml = "allowed_ips:\n  - 192.168.1.0\n";
        let cfg = ProxyConfig::from_sources(&Cli::default(), yaml).expect("valid config");

        // No prefix semantics for exact entries.
        assert!(!cfg.policy.allows("192.168.1.1".parse().unwrap()));
        assert_eq!(cfg.policy.len(), 1);
    }
}
