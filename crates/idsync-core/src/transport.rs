//! Request transport.
//!
//! One TCP connection per exchange: connect to the well-known port of the
//! recipient host, write one length-prefixed request frame, read one
//! response frame, close. Frames are a u32 big-endian length followed by
//! that many bytes.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::types::HostId;

pub trait Transport: Send + Sync {
    /// Deliver one encoded request and return the encoded response.
    fn exchange(&self, host: &HostId, request: &[u8]) -> SyncResult<Vec<u8>>;
}

/// Host-side counterpart: turns one request frame into one response frame.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, request: &[u8]) -> SyncResult<Vec<u8>>;
}

/// Write one frame.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> SyncResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| SyncError::Network(format!("frame of {} bytes is too large", payload.len())))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, refusing anything larger than `max_len`.
pub fn read_frame(reader: &mut impl Read, max_len: usize) -> SyncResult<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > max_len {
        return Err(SyncError::Network(format!(
            "frame of {} bytes exceeds limit {}",
            len, max_len
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Answer the single exchange of one accepted connection.
pub fn serve_connection(
    mut stream: TcpStream,
    handler: &dyn FrameHandler,
    max_len: usize,
) -> SyncResult<()> {
    let request = read_frame(&mut stream, max_len)?;
    let response = handler.handle_frame(&request)?;
    write_frame(&mut stream, &response)?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

pub struct TcpTransport {
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    max_frame: usize,
}

impl TcpTransport {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            port: config.host_port,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            io_timeout: Duration::from_millis(config.io_timeout_ms),
            max_frame: config.max_frame_bytes,
        }
    }

    fn connect(&self, host: &HostId) -> SyncResult<TcpStream> {
        let addrs = (host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| SyncError::Network(format!("cannot resolve {}: {}", host, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    trace!(%host, %addr, "Connected");
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => SyncError::Network(format!("cannot connect to {}: {}", host, e)),
            None => SyncError::Network(format!("{} resolved to no addresses", host)),
        })
    }
}

impl Transport for TcpTransport {
    fn exchange(&self, host: &HostId, request: &[u8]) -> SyncResult<Vec<u8>> {
        let mut stream = self.connect(host)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, request)?;
        let response = read_frame(&mut stream, self.max_frame)?;
        debug!(%host, sent = request.len(), received = response.len(), "Exchange complete");
        Ok(response)
    }
}

/// In-process transport routing requests straight to registered handlers.
#[derive(Default)]
pub struct LoopbackTransport {
    hosts: RwLock<HashMap<HostId, Arc<dyn FrameHandler>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: HostId, handler: Arc<dyn FrameHandler>) {
        self.hosts.write().insert(host, handler);
    }

    pub fn unregister(&self, host: &HostId) {
        self.hosts.write().remove(host);
    }
}

impl Transport for LoopbackTransport {
    fn exchange(&self, host: &HostId, request: &[u8]) -> SyncResult<Vec<u8>> {
        let handler = self
            .hosts
            .read()
            .get(host)
            .cloned()
            .ok_or_else(|| SyncError::Network(format!("no route to {}", host)))?;
        handler.handle_frame(request)
    }
}
