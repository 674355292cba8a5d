//! Main event loop: accepts clients, reads and writes their packets, and
//! applies the registrations queued by dispatcher tasks and matches.

use crate::config::{ConfigError, ServerConfig};
use crate::connection::{Connection, ConnectionId, ConnectionTable, ReadOutcome};
use crate::dictionary::Dictionary;
use crate::dispatch::{self, Origin, Services};
use crate::notifier::NotifierService;
use crate::registration::{registration_queue, Registration, RegistrationQueue, SessionChange, Update};
use crate::selector::{self, Interest};
use crate::storage::UserDirectory;
use log::{debug, error, info, warn};
use shared::{Operation, Packet, PacketError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::SendError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
}

pub struct Server {
    listener: TcpListener,
    connections: ConnectionTable,
    queue: RegistrationQueue,
    services: Arc<Services>,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        directory: Arc<dyn UserDirectory>,
        dictionary: Arc<dyn Dictionary>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(config.tcp_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.tcp_addr,
                source,
            })?;
        let notifier = NotifierService::bind(config.udp_addr, config.challenge_request_timeout)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.udp_addr,
                source,
            })?;
        info!("Server listening on {}", listener.local_addr()?);

        let (registrations, queue) = registration_queue();
        let connections = ConnectionTable::new(config.max_connections);
        let services = Services {
            config,
            directory,
            dictionary,
            notifier,
            registrations,
        };

        Ok(Self {
            listener,
            connections,
            queue,
            services: Arc::new(services),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address challenge pushes come from.
    pub fn notifier_addr(&self) -> io::Result<SocketAddr> {
        self.services.notifier.local_addr()
    }

    /// Serves until the task is dropped. Per-connection faults are logged and
    /// only ever close the connection concerned.
    pub async fn run(mut self) -> Result<(), ServerError> {
        loop {
            for registration in self.queue.drain() {
                self.apply(registration);
            }

            tokio::select! {
                Some(registration) = self.queue.recv() => self.apply(registration),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => error!("Accept failed: {}", e),
                },
                ready = selector::select(&self.connections) => {
                    for (id, interest) in ready {
                        match interest {
                            Interest::Read => self.read(id),
                            Interest::Write => self.write(id),
                            Interest::Idle => {}
                        }
                    }
                }
            }
        }
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot disable Nagle for {}: {}", peer, e);
        }
        if self.connections.accept(stream, peer).is_none() {
            warn!(
                "Refusing {}: {} connections already open",
                peer,
                self.connections.len()
            );
        }
    }

    fn read(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };

        match connection.read_packet() {
            Ok(ReadOutcome::Packet(packet)) => {
                debug!("<- {}: {:?}", connection.label(), packet);
                connection.interest = Interest::Idle;
                let origin = Origin {
                    id,
                    user: connection.user.clone(),
                };
                dispatch::dispatch(&self.services, origin, packet);
            }
            Ok(ReadOutcome::Partial | ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Invalid(e)) => self.reject(id, e),
            Ok(ReadOutcome::Closed) => self.close(id),
            Err(e) => {
                error!("Read from connection {} failed: {}", id, e);
                self.close(id);
            }
        }
    }

    /// Answers an undecodable packet, or closes the connection when the
    /// stream cannot be trusted anymore.
    fn reject(&mut self, id: ConnectionId, e: PacketError) {
        match e.operation() {
            Some(operation) if !e.breaks_framing() => {
                warn!("Bad {:?} packet on connection {}: {}", operation, id, e);
                if let Some(connection) = self.connections.get_mut(id) {
                    connection.respond(&Packet::error(operation).with_message(e.to_string()));
                }
            }
            _ => {
                warn!("Closing connection {}: {}", id, e);
                self.close(id);
            }
        }
    }

    fn write(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };

        match connection.flush() {
            Ok(false) => {}
            Ok(true) => {
                if connection.handoff.is_none() {
                    connection.interest = Interest::Read;
                    return;
                }
                if let Some(connection) = self.connections.remove(id) {
                    self.hand_off(connection);
                }
            }
            Err(e) => {
                error!("Write to connection {} failed: {}", id, e);
                self.close(id);
            }
        }
    }

    /// Moves a connection into the match waiting for it.
    fn hand_off(&mut self, mut connection: Connection) {
        let Some(handoff) = connection.handoff.take() else {
            self.connections.adopt(connection);
            return;
        };
        debug!("Connection {} joins its challenge", connection.label());

        if let Err(SendError(mut connection)) = handoff.send(connection) {
            warn!(
                "Challenge of connection {} is already over",
                connection.label()
            );
            connection.respond(
                &Packet::error(Operation::StopChallenge).with_message("challenge aborted"),
            );
            self.connections.adopt(connection);
        }
    }

    fn apply(&mut self, registration: Registration) {
        match registration {
            Registration::Update(update) => self.apply_update(update),
            Registration::Register {
                mut connection,
                interest,
            } => {
                debug!("Connection {} is back from its challenge", connection.label());
                connection.interest = interest;
                self.connections.adopt(connection);
            }
            Registration::Release { connection } => {
                self.disconnect(connection);
            }
        }
    }

    fn apply_update(&mut self, update: Update) {
        let Some(connection) = self.connections.get_mut(update.id) else {
            warn!("Update for vanished connection {}", update.id);
            if let Some(SessionChange::Bind { nickname, .. }) = update.session {
                // Nobody holds this login anymore
                self.logout_later(nickname);
            }
            return;
        };

        match update.session {
            Some(SessionChange::Bind { nickname, udp_port }) => {
                info!("Connection {} logged in as {}", connection.id, nickname);
                self.services.notifier.add_connection(
                    &nickname,
                    SocketAddr::new(connection.peer.ip(), udp_port),
                );
                connection.user = Some(nickname);
            }
            Some(SessionChange::Unbind) => {
                if let Some(nickname) = connection.user.take() {
                    info!("Connection {} logged out from {}", connection.id, nickname);
                    self.services.notifier.remove_connection(&nickname);
                }
            }
            None => {}
        }

        if update.handoff.is_some() {
            connection.handoff = update.handoff;
        }
        match update.response {
            Some(packet) => connection.respond(&packet),
            None => connection.interest = update.interest,
        }
    }

    fn close(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.remove(id) {
            self.disconnect(connection);
        }
    }

    /// Cleanup for a closed socket: unbind its user everywhere and drop it.
    fn disconnect(&mut self, mut connection: Connection) {
        if let Some(nickname) = connection.user.take() {
            self.services.notifier.remove_connection(&nickname);
            self.logout_later(nickname);
        }
        info!("Connection {} closed", connection.id);
    }

    fn logout_later(&self, nickname: String) {
        let services = Arc::clone(&self.services);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = services.directory.logout(&nickname) {
                debug!("Logout of {} on disconnect: {}", nickname, e);
            }
        });
    }
}
