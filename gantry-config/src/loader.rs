//! Configuration file loading.

use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::Config;

/// Loads and validates configuration documents.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Read, parse and validate a TOML configuration file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(format!("{}: {e}", path.display())))?;
        Self::load_str(&text)
    }

    /// Parse and validate a TOML document from memory.
    pub fn load_str(text: &str) -> Result<Config> {
        let cfg: Config =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        crate::validation::validate(&cfg)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
        [global]
        grace = 1000

        [[frontend]]
        name = "web"
        bind = ["127.0.0.1:8080"]
        default-backend = "pool"

        [[backend]]
        name = "pool"

        [[backend.server]]
        name = "s1"
        addr = "127.0.0.1:9000"
    "#;

    #[test]
    fn test_load_str_ok() {
        let cfg = ConfigLoader::load_str(GOOD).unwrap();
        assert_eq!(cfg.global.grace, 1000);
        assert_eq!(cfg.frontend[0].default_backend.as_deref(), Some("pool"));
    }

    #[test]
    fn test_load_str_parse_error() {
        let err = ConfigLoader::load_str("not really toml [[[").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_file_missing() {
        let err = ConfigLoader::load_file("/nonexistent/gantry.toml").unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    fn test_load_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("gantry-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gantry.toml");
        std::fs::write(&path, GOOD).unwrap();
        let cfg = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(cfg.backend[0].server[0].name, "s1");
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }
}
