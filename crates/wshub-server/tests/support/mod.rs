//! Shared harness for the integration tests: a server running its loop on a
//! background thread, and a minimal blocking WebSocket client built on the
//! `wshub-core` codec.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use wshub_core::ipc::IpcData;
use wshub_core::protocol::frame::{decode_frame, encode_frame, DecodeStatus, Frame, Opcode};
use wshub_server::application::{ApplicationError, Outbox};
use wshub_server::{Application, ClientInfo, Server, ServerConfig};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration on an ephemeral loopback port with IPC off.
pub fn local_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.ipc.enabled = false;
    config.status_refresh_secs = 0;
    config
}

// ── Background server ─────────────────────────────────────────────────────────

pub struct RunningServer {
    pub addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Server>>,
}

impl RunningServer {
    /// Moves `server` onto a thread that calls `run_once` until stopped.
    pub fn start(server: Server) -> Self {
        let addr = server.local_addr();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut server = server;
            while flag.load(Ordering::SeqCst) {
                server.run_once().expect("event loop iteration");
            }
            server
        });
        Self {
            addr,
            running,
            handle: Some(handle),
        }
    }

    /// Stops the loop and hands the server back for inspection.
    pub fn stop(mut self) -> Server {
        self.running.store(false, Ordering::SeqCst);
        self.handle
            .take()
            .expect("server thread")
            .join()
            .expect("server thread panicked")
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Polls `condition` until it holds or `IO_TIMEOUT` passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ── Counting application ──────────────────────────────────────────────────────

/// Callback counters shared between a test and a [`CountingApplication`].
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub connects: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
    pub messages: Arc<AtomicUsize>,
}

impl Counters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::SeqCst)
    }
}

/// Counts callbacks and replies `ack:<payload>` to every message.
pub struct CountingApplication {
    pub counters: Counters,
}

impl Application for CountingApplication {
    fn on_connect(
        &mut self,
        _client: &ClientInfo,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_disconnect(
        &mut self,
        _client: &ClientInfo,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_data(
        &mut self,
        payload: &str,
        client: &ClientInfo,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        self.counters.messages.fetch_add(1, Ordering::SeqCst);
        outbox.send(client.id, format!("ack:{payload}"));
        Ok(())
    }

    fn on_ipc_data(
        &mut self,
        _data: &IpcData,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        Ok(())
    }
}

// ── Blocking client ───────────────────────────────────────────────────────────

pub const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const EXPECTED_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

pub struct TestClient {
    pub stream: TcpStream,
    buffer: Vec<u8>,
}

impl TestClient {
    /// Opens a TCP connection without sending anything.
    pub fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Connects and completes the upgrade handshake for `path`.
    pub fn open(addr: SocketAddr, path: &str) -> Self {
        let mut client = Self::connect_raw(addr);
        let head = client.handshake(path);
        assert!(
            head.starts_with("HTTP/1.1 101"),
            "expected 101 for {path}, got {head:?}"
        );
        assert!(head.contains(EXPECTED_ACCEPT));
        client
    }

    /// Sends an upgrade request and returns the response head.
    pub fn handshake(&mut self, path: &str) -> String {
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {CLIENT_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        self.stream.write_all(request.as_bytes()).unwrap();
        self.read_head()
    }

    /// Reads the response head byte by byte so no frame bytes are consumed.
    fn read_head(&mut self) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match self.stream.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => head.push(byte[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => panic!("reading handshake response: {e}"),
            }
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Sends a masked text frame.
    pub fn send_text(&mut self, text: &str) {
        let bytes = encode_frame(text.as_bytes(), Opcode::Text, true);
        self.send_raw(&bytes);
    }

    /// Sends a masked close frame carrying `code`.
    pub fn send_close(&mut self, code: u16) {
        let bytes = encode_frame(&code.to_be_bytes(), Opcode::Close, true);
        self.send_raw(&bytes);
    }

    /// Reads until one full frame is available.  Panics on EOF or timeout.
    pub fn read_frame(&mut self) -> Frame {
        loop {
            if let DecodeStatus::Complete { frame, consumed } =
                decode_frame(&self.buffer).expect("server sent a malformed frame")
            {
                self.buffer.drain(..consumed);
                return frame;
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => panic!("connection closed while waiting for a frame"),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => panic!("reading frame: {e}"),
            }
        }
    }

    pub fn read_text(&mut self) -> String {
        let frame = self.read_frame();
        assert_eq!(frame.opcode, Opcode::Text, "unexpected frame {frame:?}");
        String::from_utf8(frame.payload).expect("utf-8 text frame")
    }

    pub fn read_json(&mut self) -> Value {
        serde_json::from_str(&self.read_text()).expect("json text frame")
    }

    /// Reads JSON frames until one satisfies `matches`.
    pub fn read_until(&mut self, what: &str, matches: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..16 {
            let value = self.read_json();
            if matches(&value) {
                return value;
            }
        }
        panic!("no {what} message received");
    }

    /// Reads JSON frames until one has `"action": action`.
    pub fn read_action(&mut self, action: &str) -> Value {
        self.read_until(action, |value| value["action"] == action)
    }

    /// `ip:port` of this client as the server sees it.
    pub fn key(&self) -> String {
        let local = self.stream.local_addr().unwrap();
        format!("{}:{}", local.ip(), local.port())
    }

    /// Reads the next frame, which must be a close frame, and returns its code.
    pub fn read_close_code(&mut self) -> u16 {
        let frame = self.read_frame();
        assert_eq!(frame.opcode, Opcode::Close, "unexpected frame {frame:?}");
        assert!(frame.payload.len() >= 2, "close frame without a status code");
        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
    }

    /// Asserts the server ends the connection without sending data.
    pub fn expect_disconnect(&mut self) {
        let mut chunk = [0u8; 256];
        match self.stream.read(&mut chunk) {
            Ok(0) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
                ) => {}
            other => panic!("expected the server to drop the connection, got {other:?}"),
        }
    }
}
