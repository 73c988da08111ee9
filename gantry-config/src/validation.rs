//! Configuration validation.
//!
//! Runs after parsing and before the core builds its runtime state, so
//! every reference the engine later indexes by position is known to
//! resolve. The first violation is reported; a config with one mistake
//! usually has the same mistake repeated, so itemising all of them adds
//! noise for little value.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::{ConfigError, Result};
use crate::{CondConfig, Config};

const WEIGHT_MAX: u32 = 256;

/// Check cross-references and value ranges.
pub fn validate(cfg: &Config) -> Result<()> {
    let mut backend_names = HashSet::new();
    for be in &cfg.backend {
        if !backend_names.insert(be.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                kind: "backend",
                name: be.name.clone(),
            });
        }
        let mut server_names = HashSet::new();
        for srv in &be.server {
            if !server_names.insert(srv.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "server",
                    name: format!("{}/{}", be.name, srv.name),
                });
            }
            if srv.weight > WEIGHT_MAX {
                return Err(ConfigError::InvalidValue {
                    key: format!("backend.{}.server.{}.weight", be.name, srv.name),
                    reason: format!("must be 0..={WEIGHT_MAX}"),
                });
            }
        }
    }

    let mut frontend_names = HashSet::new();
    for fe in &cfg.frontend {
        if !frontend_names.insert(fe.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                kind: "frontend",
                name: fe.name.clone(),
            });
        }
        if fe.bind.is_empty() {
            return Err(ConfigError::SectionError {
                section: "frontend",
                name: fe.name.clone(),
                reason: "at least one bind address is required".into(),
            });
        }
        if let Some(target) = &fe.default_backend {
            if !backend_names.contains(target.as_str()) {
                return Err(ConfigError::UnknownBackend {
                    frontend: fe.name.clone(),
                    backend: target.clone(),
                });
            }
        }
        for rule in &fe.use_backend {
            if !backend_names.contains(rule.backend.as_str()) {
                return Err(ConfigError::UnknownBackend {
                    frontend: fe.name.clone(),
                    backend: rule.backend.clone(),
                });
            }
        }
        for rule in fe
            .tcp_request_connection
            .iter()
            .chain(&fe.tcp_request_content)
        {
            validate_cond(&fe.name, &rule.cond)?;
        }
        for rule in &fe.use_backend {
            validate_cond(&fe.name, &rule.cond)?;
        }
        if !fe.tcp_request_content.is_empty()
            && fe.inspect_delay == 0
            && fe
                .tcp_request_content
                .iter()
                .any(|r| !matches!(r.cond, CondConfig::Always | CondConfig::SrcIp { .. }))
        {
            return Err(ConfigError::SectionError {
                section: "frontend",
                name: fe.name.clone(),
                reason: "content rules need an inspect-delay to wait for payload".into(),
            });
        }
    }
    Ok(())
}

fn validate_cond(frontend: &str, cond: &CondConfig) -> Result<()> {
    if let CondConfig::SrcIp { blocks } = cond {
        for block in blocks {
            parse_cidr(block).map_err(|reason| ConfigError::SectionError {
                section: "frontend",
                name: frontend.to_string(),
                reason: format!("bad CIDR '{block}': {reason}"),
            })?;
        }
    }
    Ok(())
}

/// Parse `addr` or `addr/prefix` into its parts.
pub fn parse_cidr(s: &str) -> std::result::Result<(IpAddr, u8), String> {
    let (addr, prefix) = match s.split_once('/') {
        Some((a, p)) => {
            let prefix: u8 = p.parse().map_err(|_| "prefix is not a number".to_string())?;
            (a, Some(prefix))
        }
        None => (s, None),
    };
    let ip: IpAddr = addr.parse().map_err(|_| "bad address".to_string())?;
    let max = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let prefix = prefix.unwrap_or(max);
    if prefix > max {
        return Err(format!("prefix must be 0..={max}"));
    }
    Ok((ip, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigLoader;

    #[test]
    fn test_duplicate_backend() {
        let err = ConfigLoader::load_str(
            r#"
            [[backend]]
            name = "pool"
            [[backend]]
            name = "pool"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { kind: "backend", .. }));
    }

    #[test]
    fn test_unknown_backend_reference() {
        let err = ConfigLoader::load_str(
            r#"
            [[frontend]]
            name = "web"
            bind = ["127.0.0.1:8080"]
            default-backend = "nope"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend { .. }));
    }

    #[test]
    fn test_weight_range() {
        let err = ConfigLoader::load_str(
            r#"
            [[backend]]
            name = "pool"
            [[backend.server]]
            name = "s1"
            addr = "127.0.0.1:9000"
            weight = 1000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_missing_bind() {
        let err = ConfigLoader::load_str(
            r#"
            [[frontend]]
            name = "web"
            bind = []
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SectionError { .. }));
    }

    #[test]
    fn test_content_rules_require_inspect_delay() {
        let err = ConfigLoader::load_str(
            r#"
            [[frontend]]
            name = "web"
            bind = ["127.0.0.1:8080"]
            [[frontend.tcp-request-content]]
            action = "reject"
            cond = { match = "payload-prefix", prefix = "X" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SectionError { .. }));
    }

    #[test]
    fn test_parse_cidr() {
        assert!(parse_cidr("10.0.0.0/8").is_ok());
        assert!(parse_cidr("10.0.0.1").is_ok());
        assert!(parse_cidr("2001:db8::/32").is_ok());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("not-an-ip").is_err());
        assert!(parse_cidr("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_bad_cidr_in_rule() {
        let err = ConfigLoader::load_str(
            r#"
            [[frontend]]
            name = "web"
            bind = ["127.0.0.1:8080"]
            [[frontend.tcp-request-connection]]
            action = "reject"
            cond = { match = "src-ip", blocks = ["999.0.0.0/8"] }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SectionError { .. }));
    }
}
