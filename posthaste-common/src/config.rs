//! Process configuration, loaded from a TOML file.
//!
//! Everything here is plain data: the delivery crate turns zone tables into
//! live zones (with their shared runtime state) at startup.

use std::{net::IpAddr, path::Path};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub dkim: DkimConfig,

    #[serde(default)]
    pub srs: SrsConfig,

    #[serde(default)]
    pub bounces: BounceConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(default, rename = "zone")]
    pub zones: Vec<ZoneConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Where message bodies are fetched from.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_hostname")]
    pub hostname: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_hostname() -> String {
    String::from("127.0.0.1")
}

const fn default_api_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            hostname: default_api_hostname(),
            port: default_api_port(),
        }
    }
}

/// Where the queue authority listens.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_host")]
    pub host: String,

    #[serde(default = "default_queue_port")]
    pub port: u16,
}

fn default_queue_host() -> String {
    String::from("127.0.0.1")
}

const fn default_queue_port() -> u16 {
    5787
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: default_queue_host(),
            port: default_queue_port(),
        }
    }
}

/// Gate for DKIM signing of outbound messages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DkimConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Envelope-from rewriting policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SrsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Domain the rewritten envelope-from lands in.
    #[serde(default)]
    pub rewrite_domain: String,

    /// Domains whose senders are never rewritten.
    #[serde(default)]
    pub exclude_domains: Vec<String>,

    /// Secret mixed into the rewritten localpart hash.
    #[serde(default)]
    pub secret: String,
}

/// Bounce reporting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BounceConfig {
    /// Webhook target for permanent rejections. Absent disables the webhook.
    #[serde(default)]
    pub url: Option<String>,

    /// Gate for internal bounce-message emission through the queue.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default verbosity for SMTP session logging.
    #[serde(default = "default_mx_level")]
    pub mx: String,
}

fn default_mx_level() -> String {
    String::from("info")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            mx: default_mx_level(),
        }
    }
}

/// Timeout configuration for SMTP session steps. Every network operation in
/// a session is wrapped in one of these to keep a dead peer from wedging the
/// worker.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpTimeouts {
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    #[serde(default = "default_greeting_timeout")]
    pub greeting_secs: u64,

    #[serde(default = "default_ehlo_timeout")]
    pub ehlo_secs: u64,

    #[serde(default = "default_starttls_timeout")]
    pub starttls_secs: u64,

    #[serde(default = "default_auth_timeout")]
    pub auth_secs: u64,

    #[serde(default = "default_mail_timeout")]
    pub mail_secs: u64,

    #[serde(default = "default_rcpt_timeout")]
    pub rcpt_secs: u64,

    /// Longer than the rest to accommodate large messages.
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            greeting_secs: default_greeting_timeout(),
            ehlo_secs: default_ehlo_timeout(),
            starttls_secs: default_starttls_timeout(),
            auth_secs: default_auth_timeout(),
            mail_secs: default_mail_timeout(),
            rcpt_secs: default_rcpt_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_greeting_timeout() -> u64 {
    30
}

const fn default_ehlo_timeout() -> u64 {
    30
}

const fn default_starttls_timeout() -> u64 {
    30
}

const fn default_auth_timeout() -> u64 {
    30
}

const fn default_mail_timeout() -> u64 {
    30
}

const fn default_rcpt_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

/// Which address families a zone resolves and connects over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    #[default]
    Any,
}

impl AddressFamily {
    pub const fn permits(self, addr: &IpAddr) -> bool {
        match self {
            Self::Ipv4 => addr.is_ipv4(),
            Self::Ipv6 => addr.is_ipv6(),
            Self::Any => true,
        }
    }
}

/// One outbound address with the HELO name presented from it.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolAddress {
    pub address: IpAddr,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Plain,
    Login,
}

/// Credentials a zone presents to its next hop.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub method: AuthMethod,
    pub user: String,
    pub pass: String,
}

/// Delivery rate cap for a zone.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    pub messages_per_second: f64,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

const fn default_burst() -> u32 {
    5
}

/// A named egress configuration, shared by every worker in the zone.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub name: String,

    /// Forced next hop. When set, MX resolution is skipped entirely.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Implicit TLS from the first byte.
    #[serde(default)]
    pub secure: bool,

    /// Never attempt STARTTLS. Also flipped at runtime when a server is
    /// observed to fail the upgrade.
    #[serde(default)]
    pub disable_starttls: bool,

    /// Abort instead of continuing in plaintext when TLS cannot be
    /// negotiated.
    #[serde(default)]
    pub require_tls: bool,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub family: AddressFamily,

    /// Outbound address pool. Empty means the OS picks the source address.
    #[serde(default)]
    pub pool: Vec<PoolAddress>,

    #[serde(default)]
    pub throttle: Option<ThrottleConfig>,

    /// Template for the prepended `Received` header value. Placeholders:
    /// `{helo}`, `{id}`, `{seq}`, `{from}`, `{zone}`, `{date}`.
    #[serde(default)]
    pub received_template: Option<String>,
}

const fn default_smtp_port() -> u16 {
    25
}
