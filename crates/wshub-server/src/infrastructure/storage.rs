//! TOML configuration file loading.
//!
//! The file is optional: a missing file yields [`ServerConfig::default()`],
//! and missing fields fall back to their serde defaults (see
//! [`crate::domain::config`]).  A file that exists but cannot be read or
//! parsed is an error, because silently ignoring a typo in a limit would
//! leave the server running with settings the operator did not ask for.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::config::{InvalidConfig, ServerConfig};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] InvalidConfig),
}

/// Loads and validates the configuration at `path`, returning the defaults
/// if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed and
/// [`ConfigError::Invalid`] if validation fails.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let cfg = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<ServerConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServerConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("wshub-config-{}.toml", Uuid::new_v4()))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        // Arrange
        let path = temp_path();

        // Act
        let cfg = load_config(&path).expect("defaults");

        // Assert
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_file_values_override_defaults() {
        let path = temp_path();
        std::fs::write(
            &path,
            "log_level = \"debug\"\n\n[server]\nport = 9100\n\n[limits]\nmax_requests_per_minute = 100\n",
        )
        .unwrap();

        let cfg = load_config(&path).expect("load");
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.limits.max_requests_per_minute, Some(100));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let path = temp_path();
        std::fs::write(&path, "[server\nport = ").unwrap();

        let result = load_config(&path);
        std::fs::remove_file(&path).ok();

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_limit_is_invalid() {
        let path = temp_path();
        std::fs::write(&path, "[limits]\nmax_connections_per_ip = 0\n").unwrap();

        let result = load_config(&path);
        std::fs::remove_file(&path).ok();

        assert!(matches!(
            result,
            Err(ConfigError::Invalid(InvalidConfig::Zero("limits.max_connections_per_ip")))
        ));
    }

    #[test]
    fn test_directory_path_is_an_io_error() {
        let result = load_config(&std::env::temp_dir());
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
