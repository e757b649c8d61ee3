//! wshub: WebSocket application server, entry point.
//!
//! This binary loads the configuration, binds the listening socket and the
//! local IPC socket, registers the built-in applications and runs the event
//! loop until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! wshub [OPTIONS]
//!
//! Options:
//!   --config <PATH>                  TOML configuration file [default: wshub.toml]
//!   --host <HOST>                    Listen address
//!   --port <PORT>                    Listen port
//!   --ipc-socket <PATH>              IPC datagram socket path
//!   --no-ipc                         Do not open the IPC socket
//!   --max-clients <N>                Server-wide connection limit
//!   --max-connections-per-ip <N>     Per-address connection limit
//!   --max-requests-per-minute <N>    Per-connection message limit
//!   --check-origin                   Enforce the Origin allow-list
//!   --allowed-origin <ORIGIN>        Allowed origin (repeatable)
//!   --log-level <FILTER>             Log filter used when RUST_LOG is unset
//! ```
//!
//! # Precedence
//!
//! Command-line flag, then `WSHUB_*` environment variable, then the config
//! file, then the built-in default.
//!
//! | Variable                        | Flag                          |
//! |---------------------------------|-------------------------------|
//! | `WSHUB_CONFIG`                  | `--config`                    |
//! | `WSHUB_HOST`                    | `--host`                      |
//! | `WSHUB_PORT`                    | `--port`                      |
//! | `WSHUB_IPC_SOCKET`              | `--ipc-socket`                |
//! | `WSHUB_MAX_CLIENTS`             | `--max-clients`               |
//! | `WSHUB_MAX_CONNECTIONS_PER_IP`  | `--max-connections-per-ip`    |
//! | `WSHUB_MAX_REQUESTS_PER_MINUTE` | `--max-requests-per-minute`   |
//! | `WSHUB_CHECK_ORIGIN`            | `--check-origin`              |
//! | `WSHUB_ALLOWED_ORIGINS`         | `--allowed-origin` (comma separated) |
//! | `WSHUB_LOG_LEVEL`               | `--log-level`                 |
//!
//! # Endpoints
//!
//! ```text
//! ws://HOST:PORT/echo     demo echo application
//! ws://HOST:PORT/status   live server status feed
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wshub_server::application::{EchoApplication, StatusApplication};
use wshub_server::infrastructure::storage::load_config;
use wshub_server::{Server, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Single-process WebSocket server with pluggable applications.
///
/// Every option overrides the value read from the configuration file.
#[derive(Debug, Parser)]
#[command(
    name = "wshub",
    about = "WebSocket server with pluggable applications and a local IPC channel",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "wshub.toml", env = "WSHUB_CONFIG")]
    config: PathBuf,

    /// Address to listen on, e.g. `0.0.0.0` for every interface.
    #[arg(long, env = "WSHUB_HOST")]
    host: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "WSHUB_PORT")]
    port: Option<u16>,

    /// Filesystem path of the IPC datagram socket.
    #[arg(long, env = "WSHUB_IPC_SOCKET")]
    ipc_socket: Option<PathBuf>,

    /// Do not open the IPC socket.
    #[arg(long)]
    no_ipc: bool,

    #[arg(long, env = "WSHUB_MAX_CLIENTS")]
    max_clients: Option<usize>,

    #[arg(long, env = "WSHUB_MAX_CONNECTIONS_PER_IP")]
    max_connections_per_ip: Option<usize>,

    /// Messages one connection may send per minute before it is closed.
    #[arg(long, env = "WSHUB_MAX_REQUESTS_PER_MINUTE")]
    max_requests_per_minute: Option<u32>,

    /// Milliseconds a new socket may take to send its upgrade request.
    /// `0` disables the deadline.
    #[arg(long, env = "WSHUB_HANDSHAKE_TIMEOUT_MS")]
    handshake_timeout_ms: Option<u64>,

    /// Reject handshakes whose Origin host is not allowed.  A bare flag
    /// means `true`; `--check-origin false` turns a file setting off.
    #[arg(
        long,
        env = "WSHUB_CHECK_ORIGIN",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    check_origin: Option<bool>,

    /// Origin host accepted when origin checking is on.
    #[arg(
        long = "allowed-origin",
        env = "WSHUB_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    allowed_origins: Vec<String>,

    /// `tracing` filter used when `RUST_LOG` is not set.
    #[arg(long, env = "WSHUB_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the configuration file and applies the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged configuration is invalid.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("loading config from {}", self.config.display()))?;

        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = self.ipc_socket {
            config.ipc.socket_path = path;
        }
        if self.no_ipc {
            config.ipc.enabled = false;
        }
        if let Some(max) = self.max_clients {
            config.limits.max_clients = max;
        }
        if let Some(max) = self.max_connections_per_ip {
            config.limits.max_connections_per_ip = max;
        }
        if let Some(max) = self.max_requests_per_minute {
            config.limits.max_requests_per_minute = Some(max);
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config.limits.handshake_timeout_ms = ms;
        }
        if let Some(check) = self.check_origin {
            config.origin.check_origin = check;
        }
        if !self.allowed_origins.is_empty() {
            config.origin.allowed_origins = self.allowed_origins;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config
            .validate()
            .context("invalid command-line override")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed and merged over the config file.
/// 2. `tracing_subscriber` is initialised; `RUST_LOG` wins over the
///    configured `log_level`.
/// 3. The server binds its sockets and registers `status` and `echo`.
/// 4. A Ctrl+C handler clears the shared `running` flag.
/// 5. [`Server::run_until`] loops until the flag is cleared, then closes
///    every connection with 1001 (going away).
fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_server_config()?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "wshub starting: listen={}:{}, max_clients={}, max_connections_per_ip={}",
        config.server.host,
        config.server.port,
        config.limits.max_clients,
        config.limits.max_connections_per_ip
    );

    let mut server = Server::bind(config).context("starting server")?;
    server
        .register_status(StatusApplication::new())
        .context("registering status application")?;
    server
        .register_application("echo", Box::new(EchoApplication::new()))
        .context("registering echo application")?;

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("received Ctrl+C, shutting down");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    // ── Main server loop ──────────────────────────────────────────────────────
    server.run_until(&running)?;

    info!("wshub stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn missing_config() -> String {
        std::env::temp_dir()
            .join(format!("wshub-cli-{}.toml", Uuid::new_v4()))
            .display()
            .to_string()
    }

    #[test]
    fn test_cli_default_config_path() {
        // Arrange / Act
        let cli = Cli::parse_from(["wshub"]);

        // Assert
        assert_eq!(cli.config, PathBuf::from("wshub.toml"));
    }

    #[test]
    fn test_cli_without_overrides_keeps_file_defaults() {
        // Arrange
        let path = missing_config();
        let cli = Cli::parse_from(["wshub", "--config", &path]);

        // Act
        let config = cli.into_server_config().unwrap();

        // Assert
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_cli_port_and_host_override() {
        let path = missing_config();
        let cli = Cli::parse_from([
            "wshub", "--config", &path, "--host", "0.0.0.0", "--port", "9100",
        ]);

        let config = cli.into_server_config().unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn test_cli_limit_overrides() {
        let path = missing_config();
        let cli = Cli::parse_from([
            "wshub",
            "--config",
            &path,
            "--max-clients",
            "2",
            "--max-connections-per-ip",
            "1",
            "--max-requests-per-minute",
            "50",
        ]);

        let config = cli.into_server_config().unwrap();

        assert_eq!(config.limits.max_clients, 2);
        assert_eq!(config.limits.max_connections_per_ip, 1);
        assert_eq!(config.limits.max_requests_per_minute, Some(50));
    }

    #[test]
    fn test_cli_origin_overrides() {
        let path = missing_config();
        let cli = Cli::parse_from([
            "wshub",
            "--config",
            &path,
            "--check-origin",
            "--allowed-origin",
            "example.com",
            "--allowed-origin",
            "localhost",
        ]);

        let config = cli.into_server_config().unwrap();

        assert!(config.origin.check_origin);
        assert_eq!(config.origin.allowed_origins, vec!["example.com", "localhost"]);
    }

    #[test]
    fn test_cli_check_origin_false_overrides_file() {
        // Arrange: the file turns origin checking on
        let path = std::env::temp_dir().join(format!("wshub-cli-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "[origin]\ncheck_origin = true\n").unwrap();
        let path_arg = path.display().to_string();
        let cli = Cli::parse_from(["wshub", "--config", &path_arg, "--check-origin", "false"]);

        // Act
        let config = cli.into_server_config().unwrap();
        std::fs::remove_file(&path).ok();

        // Assert
        assert!(!config.origin.check_origin);
    }

    #[test]
    fn test_cli_without_check_origin_keeps_file_value() {
        let path = std::env::temp_dir().join(format!("wshub-cli-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "[origin]\ncheck_origin = true\n").unwrap();
        let path_arg = path.display().to_string();
        let cli = Cli::parse_from(["wshub", "--config", &path_arg]);

        let config = cli.into_server_config().unwrap();
        std::fs::remove_file(&path).ok();

        assert!(config.origin.check_origin);
    }

    #[test]
    fn test_cli_bare_check_origin_means_true() {
        let cli = Cli::parse_from(["wshub", "--check-origin"]);
        assert_eq!(cli.check_origin, Some(true));
    }

    #[test]
    fn test_cli_handshake_timeout_override() {
        let path = missing_config();
        let cli = Cli::parse_from(["wshub", "--config", &path, "--handshake-timeout-ms", "0"]);

        let config = cli.into_server_config().unwrap();

        assert_eq!(config.limits.handshake_timeout_ms, 0);
    }

    #[test]
    fn test_cli_ipc_overrides() {
        let path = missing_config();
        let cli = Cli::parse_from([
            "wshub",
            "--config",
            &path,
            "--ipc-socket",
            "/tmp/other.sock",
            "--no-ipc",
        ]);

        let config = cli.into_server_config().unwrap();

        assert_eq!(config.ipc.socket_path, PathBuf::from("/tmp/other.sock"));
        assert!(!config.ipc.enabled);
    }

    #[test]
    fn test_cli_zero_limit_is_an_error() {
        // Arrange: a limit of zero would refuse every client
        let path = missing_config();
        let cli = Cli::parse_from(["wshub", "--config", &path, "--max-clients", "0"]);

        // Act
        let result = cli.into_server_config();

        // Assert: must return an error, not panic
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_file_values_are_overridden() {
        // Arrange
        let path = std::env::temp_dir().join(format!("wshub-cli-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "[server]\nport = 7000\nhost = \"10.0.0.1\"\n").unwrap();
        let path_arg = path.display().to_string();
        let cli = Cli::parse_from(["wshub", "--config", &path_arg, "--port", "7001"]);

        // Act
        let config = cli.into_server_config().unwrap();
        std::fs::remove_file(&path).ok();

        // Assert
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.server.host, "10.0.0.1");
    }
}
