//! Configuration module for `warden-dns`.
//!
//! Defines the structure and default values for the application's
//! configuration. Uses `serde` for deserialization and `toml` for the file
//! format. Upstream servers are written as `net:host[:port][/path]` strings
//! and parsed into [`Upstream`] values at load time.
//!
//! # Example Config
//! ```toml
//! host = "0.0.0.0"
//! port = 5300
//! upstream = ["udp:8.8.8.8", "tcp-tls:1.1.1.1:853"]
//!
//! [blocking]
//! block_type = "zeroIp"
//! [blocking.black_lists]
//! adblock = ["https://example.com/hosts.txt"]
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;

/// Main configuration struct holding all settings for the DNS server.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// The IP address to bind the DNS server to (e.g., "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// The port to listen on (e.g., 53 or 5300).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level / filter directives (e.g., "info", "warden_dns=debug").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// External DNS servers in `net:host[:port][/path]` notation.
    #[serde(default = "default_upstream")]
    pub upstream: Vec<Upstream>,

    /// Blocking configuration (lists, client groups, block type).
    #[serde(default)]
    pub blocking: BlockingConfig,

    /// CNAME rewrite configuration.
    #[serde(default)]
    pub cname: CnameConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Control HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,
}

/// Transport protocol of an upstream DNS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Net {
    Udp,
    Tcp,
    TcpTls,
    Https,
}

impl Net {
    pub fn as_str(self) -> &'static str {
        match self {
            Net::Udp => "udp",
            Net::Tcp => "tcp",
            Net::TcpTls => "tcp-tls",
            Net::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Net::Udp | Net::Tcp => 53,
            Net::TcpTls => 853,
            Net::Https => 443,
        }
    }
}

impl FromStr for Net {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp" => Ok(Net::Udp),
            "tcp" => Ok(Net::Tcp),
            "tcp-tls" => Ok(Net::TcpTls),
            "https" => Ok(Net::Https),
            other => bail!(
                "wrong configuration, couldn't parse net '{other}', please use one of: udp, tcp, tcp-tls, https"
            ),
        }
    }
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of an external DNS server.
///
/// `path` is only meaningful for `https` upstreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub net: Net,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl FromStr for Upstream {
    type Err = anyhow::Error;

    /// Parses an upstream from `net:host[:port][/path]` notation. The host
    /// may be a bracketed IPv6 literal; the port defaults per `net`.
    fn from_str(upstream: &str) -> Result<Self> {
        let s = upstream.trim();
        let (net_part, rest) = s.split_once(':').with_context(|| {
            format!("wrong configuration, couldn't parse input '{s}', please enter net:host[:port][/path]")
        })?;
        let net: Net = net_part.parse()?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        let (addr, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port_part) = if let Some(bracketed) = addr.strip_prefix('[') {
            let end = bracketed
                .find(']')
                .with_context(|| format!("unterminated IPv6 literal in '{s}'"))?;
            let after = &bracketed[end + 1..];
            if !after.is_empty() && !after.starts_with(':') {
                bail!("wrong configuration, couldn't parse input '{s}', please enter net:host[:port][/path]");
            }
            (&bracketed[..end], after.strip_prefix(':').unwrap_or(""))
        } else {
            match addr.rsplit_once(':') {
                Some((host, port)) => (host, port),
                None => (addr, ""),
            }
        };

        if host.is_empty() {
            bail!("wrong configuration, host wasn't specified in '{s}'");
        }

        let port = if port_part.is_empty() {
            net.default_port()
        } else {
            let port: u32 = port_part
                .trim()
                .parse()
                .with_context(|| format!("can't convert port '{port_part}' to number"))?;
            if !(1..=65535).contains(&port) {
                bail!("invalid port {port}");
            }
            port as u16
        };

        Ok(Upstream {
            net,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}:[{}]:{}{}", self.net, self.host, self.port, self.path)
        } else {
            write!(f, "{}:{}:{}{}", self.net, self.host, self.port, self.path)
        }
    }
}

impl<'de> Deserialize<'de> for Upstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: anyhow::Error| D::Error::custom(format!("{e:#}")))
    }
}

impl Serialize for Upstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Configuration of the blocking stage.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct BlockingConfig {
    /// Category name to blacklist sources (URLs or file paths).
    pub black_lists: HashMap<String, Vec<String>>,

    /// Category name to whitelist sources.
    pub white_lists: HashMap<String, Vec<String>>,

    /// Client identifier (MAC, client name, IP or "default") to categories.
    pub client_groups_block: HashMap<String, Vec<String>>,

    /// Administrator switch per category; masks EDNS0-derived opt-ins.
    pub global: HashMap<String, bool>,

    /// Per-domain override: `false` suppresses a list match for that domain.
    pub domain_overrides: HashMap<String, bool>,

    /// One of "zeroIp", "nxDomain" or a comma-separated IP list.
    pub block_type: String,

    /// List refresh period in minutes. 0 uses the default, negative disables.
    pub refresh_period: i64,
}

/// One CNAME rewrite group: the domains it captures and their target.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct CnameGroup {
    pub domains: Vec<String>,
    pub cname: String,
}

/// Configuration of the CNAME rewrite stage.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct CnameConfig {
    pub groups: HashMap<String, CnameGroup>,
    pub client_groups_block: HashMap<String, Vec<String>>,
}

/// Configuration for metrics collection.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enable: bool,
}

/// Configuration for the control HTTP API.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

// Defaults
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    53
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_api_port() -> u16 {
    4000
}
fn default_upstream() -> Vec<Upstream> {
    vec![Upstream {
        net: Net::Udp,
        host: "8.8.8.8".to_string(),
        port: 53,
        path: String::new(),
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            upstream: default_upstream(),
            blocking: BlockingConfig::default(),
            cname: CnameConfig::default(),
            metrics: MetricsConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Parses a go-style duration of the `300s` / `5m` / `5m30s` / `1h` shape.
/// A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0u64;
    let mut digits = String::new();
    let mut seen_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| anyhow!("invalid duration '{input}'"))?;
        digits.clear();
        let multiplier = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => bail!("invalid duration '{input}', please use e.g. 300s, 5m30s or 1h"),
        };
        total += value * multiplier;
        seen_unit = true;
    }

    if !digits.is_empty() || !seen_unit {
        bail!("invalid duration '{input}', please use e.g. 300s, 5m30s or 1h");
    }

    Ok(Duration::from_secs(total))
}

impl Config {
    /// Loads the configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or if the TOML parsing
    /// fails (including malformed upstream strings).
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config TOML")?;
        Ok(config)
    }
}
