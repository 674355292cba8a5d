//! Per-socket connection state and the table that owns it.
//!
//! A [`Connection`] is owned by exactly one loop at a time: the main event
//! loop's [`ConnectionTable`], or the table of the match it was handed to.

use crate::selector::Interest;
use log::{debug, info, warn};
use shared::{Packet, PacketBuffer, PacketError};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Where a connection goes once its pending response is flushed, instead
/// of back to read interest.
pub type Handoff = mpsc::UnboundedSender<Connection>;

/// Largest single read, matching the size of the loop's read buffer.
const READ_CHUNK: usize = 512;

#[derive(Debug)]
pub enum ReadOutcome {
    Packet(Packet),
    /// Bytes arrived but the frame is not complete yet.
    Partial,
    /// The frame could not be decoded. The connection may still be usable
    /// unless [`PacketError::breaks_framing`] says otherwise.
    Invalid(PacketError),
    /// Readiness was spurious.
    WouldBlock,
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub interest: Interest,
    pub buffer: PacketBuffer,
    /// Nickname bound at login.
    pub user: Option<String>,
    /// Set while the connection is on its way to a match; such a connection
    /// is never read by the main loop again.
    pub handoff: Option<Handoff>,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            interest: Interest::Read,
            buffer: PacketBuffer::new(),
            user: None,
            handoff: None,
        }
    }

    /// Name used in log lines.
    pub fn label(&self) -> String {
        match &self.user {
            Some(user) => format!("{} ({})", self.id, user),
            None => format!("{} ({})", self.id, self.peer),
        }
    }

    /// Queues `packet` and switches to write interest.
    pub fn respond(&mut self, packet: &Packet) {
        debug!("-> {}: {:?}", self.label(), packet);
        match self.buffer.set_outbound(Some(packet)) {
            Ok(()) => self.interest = Interest::Write,
            Err(e) => {
                // Only an oversized packet can fail to encode
                warn!("Dropping response to {}: {}", self.label(), e);
                self.interest = Interest::Read;
            }
        }
    }

    /// Reads at most what the current frame still needs, so bytes of the
    /// next frame stay in the socket.
    pub fn read_packet(&mut self) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        let wanted = self.buffer.wanted().clamp(1, READ_CHUNK);

        let n = match self.stream.try_read(&mut chunk[..wanted]) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) => return Err(e),
        };

        match self.buffer.add_chunk(&chunk[..n]) {
            Ok(false) => Ok(ReadOutcome::Partial),
            Ok(true) => Ok(match self.buffer.build_packet() {
                Ok(packet) => ReadOutcome::Packet(packet),
                Err(e) => ReadOutcome::Invalid(e),
            }),
            Err(e) => Ok(ReadOutcome::Invalid(e)),
        }
    }

    /// Writes as much of the outbound frame as the socket takes. Returns
    /// `true` once nothing is left to write.
    pub fn flush(&mut self) -> io::Result<bool> {
        while let Some(pending) = self.buffer.pending_outbound() {
            match self.stream.try_write(pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    if self.buffer.advance_outbound(n) {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Connections owned by one loop, keyed by id.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
            max_connections,
        }
    }

    /// Registers a freshly accepted socket for reading.
    ///
    /// Returns `None` when the table is full; the socket is dropped.
    pub fn accept(&mut self, stream: TcpStream, peer: SocketAddr) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        info!("Connection {} accepted from {}", id, peer);
        self.connections.insert(id, Connection::new(id, stream, peer));
        Some(id)
    }

    /// Takes ownership of a connection coming from another loop. Never
    /// refused, whatever the capacity.
    pub fn adopt(&mut self, connection: Connection) {
        if let Some(previous) = self.connections.insert(connection.id, connection) {
            warn!("Connection {} was adopted twice", previous.id);
        }
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn find_by_user(&self, nickname: &str) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|c| c.user.as_deref() == Some(nickname))
            .map(|c| c.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Removes every connection.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
