//! Configuration types for the Gantry proxy.
//!
//! The core engine consumes a fully parsed [`Config`]; this crate owns
//! the serde types, the TOML loader and the validation pass. Keys follow
//! the TOML convention (kebab-case) while the Rust structs stay snake
//! case.

pub mod error;
pub mod loader;
pub mod validation;

pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use validation::validate;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

fn default_backlog() -> i32 {
    1024
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_connect() -> u64 {
    5_000
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub frontend: Vec<FrontendConfig>,
    #[serde(default)]
    pub backend: Vec<BackendConfig>,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct GlobalConfig {
    /// Hard cap on concurrent sessions across all frontends. Zero means
    /// unlimited.
    #[serde(default)]
    pub maxconn: u32,
    /// Grace period granted to live sessions on soft stop, ms.
    #[serde(default)]
    pub grace: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            maxconn: 0,
            grace: 0,
        }
    }
}

/// One frontend: listening addresses plus accept-side policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FrontendConfig {
    pub name: String,
    /// Listening addresses.
    pub bind: Vec<SocketAddr>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub maxconn: u32,
    /// Sessions per second; zero disables the limit.
    #[serde(default)]
    pub rate_limit_sessions: u32,
    pub default_backend: Option<String>,
    /// Client inactivity timeout, ms. Zero means none.
    #[serde(default)]
    pub timeout_client: u64,
    /// Tarpit hold time, ms.
    #[serde(default)]
    pub timeout_tarpit: u64,
    /// Content-inspection delay, ms. Zero evaluates content rules once.
    #[serde(default)]
    pub inspect_delay: u64,
    #[serde(default)]
    pub nodelay: bool,
    /// Per-frontend grace override on soft stop, ms.
    pub grace: Option<u64>,
    /// Layer-4 rules evaluated at accept time.
    #[serde(default)]
    pub tcp_request_connection: Vec<RuleConfig>,
    /// Content rules evaluated against buffered payload.
    #[serde(default)]
    pub tcp_request_content: Vec<RuleConfig>,
    /// Content-switching rules, first match wins.
    #[serde(default)]
    pub use_backend: Vec<SwitchConfig>,
}

/// One backend: a server pool and its balancing/timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub balance: BalanceConfig,
    /// Backend load at which per-server dynamic maxconn reaches its
    /// ceiling. Zero disables the ramp.
    #[serde(default)]
    pub fullconn: u32,
    #[serde(default = "default_timeout_connect")]
    pub timeout_connect: u64,
    /// Server inactivity timeout, ms. Zero means none.
    #[serde(default)]
    pub timeout_server: u64,
    /// Maximum queue wait, ms. Zero means unbounded.
    #[serde(default)]
    pub timeout_queue: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Rebalance to another server on the final retry.
    #[serde(default)]
    pub redispatch: bool,
    /// Abort the server side as soon as the client disappears.
    #[serde(default)]
    pub abortonclose: bool,
    /// Use every usable backup instead of the first one.
    #[serde(default)]
    pub allbackups: bool,
    /// Do not let write activity refresh read timeouts.
    #[serde(default)]
    pub independent_streams: bool,
    #[serde(default)]
    pub server: Vec<ServerConfig>,
}

/// Load-balancing discipline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "algorithm")]
pub enum BalanceConfig {
    /// Smooth weighted round robin.
    #[default]
    Roundrobin,
    /// Weighted least connections.
    Leastconn,
    /// Weight-expanded static round robin.
    StaticRr,
    /// Consistent hash of the client source address.
    Source,
    /// Consistent hash of the request path.
    Uri,
    /// Consistent hash of one query-string parameter.
    UrlParam { param: String },
    /// Consistent hash of one request header.
    Hdr { header: String },
    /// Consistent hash of one RDP connection-request cookie.
    RdpCookie { cookie: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub name: String,
    pub addr: SocketAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Concurrent-connection cap; zero means unlimited.
    #[serde(default)]
    pub maxconn: u32,
    #[serde(default)]
    pub backup: bool,
    /// Start in maintenance.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub check: Option<CheckConfig>,
}

fn default_weight() -> u32 {
    1
}

/// Health-check parameters, stored for the external prober.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CheckConfig {
    #[serde(default)]
    pub enabled: bool,
    pub addr: Option<SocketAddr>,
    pub port: Option<u16>,
    /// Probe interval, ms.
    #[serde(default)]
    pub inter: u64,
    #[serde(default)]
    pub rise: u32,
    #[serde(default)]
    pub fall: u32,
}

/// An inspection rule: a condition and what to do when it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RuleConfig {
    pub action: RuleActionConfig,
    #[serde(default)]
    pub cond: CondConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleActionConfig {
    Accept,
    Reject,
    Tarpit,
}

/// Rule condition, shared between inspection and switching rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "match")]
pub enum CondConfig {
    /// Matches everything.
    #[default]
    Always,
    /// Source address in any of the CIDR blocks.
    SrcIp { blocks: Vec<String> },
    /// At least this many request bytes buffered.
    PayloadLen { at_least: usize },
    /// Request payload starts with these bytes (UTF-8).
    PayloadPrefix { prefix: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SwitchConfig {
    pub backend: String,
    #[serde(default)]
    pub cond: CondConfig,
}

/// Where the admin applet listens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AdminConfig {
    /// Unix socket path.
    pub socket: Option<PathBuf>,
    /// TCP listening address (useful behind a management network).
    pub tcp: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document() {
        let cfg: Config = toml::from_str(
            r#"
            [[frontend]]
            name = "web"
            bind = ["127.0.0.1:8080"]
            default-backend = "pool"

            [[backend]]
            name = "pool"

            [[backend.server]]
            name = "s1"
            addr = "127.0.0.1:9000"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.frontend.len(), 1);
        assert_eq!(cfg.backend[0].server[0].weight, 1);
        assert_eq!(cfg.backend[0].retries, 3);
        assert_eq!(cfg.backend[0].timeout_connect, 5_000);
        assert_eq!(cfg.backend[0].balance, BalanceConfig::Roundrobin);
    }

    #[test]
    fn test_balance_variants() {
        let cfg: Config = toml::from_str(
            r#"
            [[backend]]
            name = "a"
            balance = { algorithm = "leastconn" }

            [[backend]]
            name = "b"
            balance = { algorithm = "url-param", param = "sid" }

            [[backend]]
            name = "c"
            balance = { algorithm = "rdp-cookie", cookie = "mstshash" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backend[0].balance, BalanceConfig::Leastconn);
        assert_eq!(
            cfg.backend[1].balance,
            BalanceConfig::UrlParam {
                param: "sid".into()
            }
        );
        assert_eq!(
            cfg.backend[2].balance,
            BalanceConfig::RdpCookie {
                cookie: "mstshash".into()
            }
        );
    }

    #[test]
    fn test_rules_parse() {
        let cfg: Config = toml::from_str(
            r#"
            [[frontend]]
            name = "web"
            bind = ["0.0.0.0:8080"]

            [[frontend.tcp-request-connection]]
            action = "reject"
            cond = { match = "src-ip", blocks = ["192.0.2.0/24"] }

            [[frontend.tcp-request-content]]
            action = "accept"
            cond = { match = "payload-prefix", prefix = "PING" }
            "#,
        )
        .unwrap();
        let fe = &cfg.frontend[0];
        assert_eq!(fe.tcp_request_connection.len(), 1);
        assert_eq!(fe.tcp_request_connection[0].action, RuleActionConfig::Reject);
        assert!(matches!(
            fe.tcp_request_content[0].cond,
            CondConfig::PayloadPrefix { .. }
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let res: std::result::Result<Config, _> = toml::from_str(
            r#"
            [[frontend]]
            name = "web"
            bind = ["0.0.0.0:8080"]
            no-such-key = 1
            "#,
        );
        assert!(res.is_err());
    }
}
