//! Local IPC datagram listener.
//!
//! Local processes inject messages into the running server by sending one
//! JSON envelope per datagram (see [`wshub_core::ipc`]).  On unix the
//! endpoint is a filesystem-path datagram socket; elsewhere it falls back to
//! a UDP socket bound to the loopback interface.
//!
//! The socket is non-blocking and polled by the event loop once per
//! iteration.  The socket file is removed when the channel is dropped.

use std::io::ErrorKind;
#[cfg(not(unix))]
use std::net::UdpSocket;
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};
use wshub_core::ipc::{IpcError, IpcMessage, MAX_DATAGRAM_SIZE};

use crate::domain::config::IpcConfig;

/// Errors raised by the IPC channel.
#[derive(Debug, Error)]
pub enum IpcChannelError {
    /// The socket could not be created or bound.
    #[error("failed to bind IPC socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The socket file's owner or mode could not be applied.
    #[error("failed to set permissions on IPC socket {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Receiving from the socket failed.
    #[error("IPC socket error: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram arrived but is not a valid envelope.
    #[error(transparent)]
    Decode(#[from] IpcError),
}

/// Non-blocking datagram endpoint for local control messages.
pub struct IpcChannel {
    #[cfg(unix)]
    socket: UnixDatagram,
    #[cfg(not(unix))]
    socket: UdpSocket,
    path: PathBuf,
    buffer: Box<[u8]>,
}

impl IpcChannel {
    /// Binds the endpoint described by `config`.
    ///
    /// A stale socket file left by a previous run is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`IpcChannelError::Bind`] or [`IpcChannelError::Permissions`].
    #[cfg(unix)]
    pub fn bind(config: &IpcConfig) -> Result<Self, IpcChannelError> {
        use std::os::unix::fs::PermissionsExt;

        let path = config.socket_path.clone();
        let bind_error = |source| IpcChannelError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed stale IPC socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(bind_error(e)),
        }

        let socket = UnixDatagram::bind(&path).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;

        // From here on `channel` owns the file and removes it on any error.
        let channel = Self {
            socket,
            path,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        };
        let permissions_error = |source| IpcChannelError::Permissions {
            path: channel.path.clone(),
            source,
        };

        if let Some(mode) = config.mode {
            std::fs::set_permissions(&channel.path, std::fs::Permissions::from_mode(mode))
                .map_err(permissions_error)?;
        }
        if config.owner.is_some() || config.group.is_some() {
            std::os::unix::fs::chown(&channel.path, config.owner, config.group)
                .map_err(permissions_error)?;
        }

        info!("IPC socket listening on {}", channel.path.display());
        Ok(channel)
    }

    /// Binds a loopback UDP socket on `config.loopback_port`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcChannelError::Bind`].
    #[cfg(not(unix))]
    pub fn bind(config: &IpcConfig) -> Result<Self, IpcChannelError> {
        let path = PathBuf::from(format!("127.0.0.1:{}", config.loopback_port));
        let bind_error = |source| IpcChannelError::Bind {
            path: path.clone(),
            source,
        };
        let socket = UdpSocket::bind(("127.0.0.1", config.loopback_port)).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        info!("IPC socket listening on {}", path.display());
        Ok(Self {
            socket,
            path,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    /// Socket path, or `ip:port` for the loopback fallback.
    #[cfg(unix)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receives and decodes one datagram, or returns `Ok(None)` when none is
    /// waiting.
    ///
    /// # Errors
    ///
    /// Returns [`IpcChannelError::Decode`] for a malformed envelope (the
    /// datagram is consumed) and [`IpcChannelError::Io`] for socket errors.
    pub fn receive(&mut self) -> Result<Option<IpcMessage>, IpcChannelError> {
        let received = self.recv();
        match received {
            Ok(len) => Ok(Some(IpcMessage::decode(&self.buffer[..len])?)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn recv(&mut self) -> std::io::Result<usize> {
        self.socket.recv(&mut self.buffer)
    }

    #[cfg(not(unix))]
    fn recv(&mut self) -> std::io::Result<usize> {
        self.socket.recv_from(&mut self.buffer).map(|(len, _)| len)
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!("could not remove IPC socket {}: {e}", self.path.display());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_config() -> IpcConfig {
        IpcConfig {
            socket_path: std::env::temp_dir().join(format!("wshub-{}.sock", Uuid::new_v4())),
            ..IpcConfig::default()
        }
    }

    fn send(path: &Path, bytes: &[u8]) {
        let sender = UnixDatagram::unbound().unwrap();
        sender.send_to(bytes, path).unwrap();
    }

    #[test]
    fn test_receive_decodes_application_data() {
        // Arrange
        let config = temp_config();
        let mut channel = IpcChannel::bind(&config).unwrap();
        send(
            channel.path(),
            br#"{"type":2,"action":"echo","data":{"action":"echo","data":"hi"}}"#,
        );

        // Act
        let message = channel.receive().unwrap();

        // Assert
        match message {
            Some(IpcMessage::ApplicationData { application, data }) => {
                assert_eq!(application, "echo");
                assert_eq!(data["data"], "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_socket_returns_none() {
        let mut channel = IpcChannel::bind(&temp_config()).unwrap();
        assert!(channel.receive().unwrap().is_none());
    }

    #[test]
    fn test_malformed_datagram_is_a_decode_error_and_is_consumed() {
        let mut channel = IpcChannel::bind(&temp_config()).unwrap();
        send(channel.path(), b"not json");

        let first = channel.receive();
        let second = channel.receive();

        assert!(matches!(first, Err(IpcChannelError::Decode(_))));
        assert!(matches!(second, Ok(None)));
    }

    #[test]
    fn test_stale_socket_file_is_replaced() {
        let config = temp_config();
        std::fs::write(&config.socket_path, b"stale").unwrap();

        let channel = IpcChannel::bind(&config);

        assert!(channel.is_ok());
    }

    #[test]
    fn test_mode_is_applied() {
        use std::os::unix::fs::PermissionsExt;

        let mut config = temp_config();
        config.mode = Some(0o600);

        let channel = IpcChannel::bind(&config).unwrap();

        let mode = std::fs::metadata(channel.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_drop_removes_socket_file() {
        let config = temp_config();
        let channel = IpcChannel::bind(&config).unwrap();
        assert!(config.socket_path.exists());

        drop(channel);

        assert!(!config.socket_path.exists());
    }
}
