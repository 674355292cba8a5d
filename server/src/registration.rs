//! Deferred registration queue.
//!
//! Only the main event loop touches its connection table. Dispatcher tasks
//! and match loops describe the changes they want as [`Registration`]s and
//! push them through [`Registrations`]; the loop applies them before its
//! next readiness wait. The channel doubles as the loop's wakeup: the loop
//! waits on `recv` alongside socket readiness, so a sent registration is
//! applied without delay. Ordering across different connections is not
//! guaranteed.

use crate::connection::{Connection, ConnectionId, Handoff};
use crate::selector::Interest;
use log::warn;
use shared::Packet;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    /// Login succeeded: bind the nickname and its UDP push port.
    Bind { nickname: String, udp_port: u16 },
    Unbind,
}

/// Change to a connection the main loop already owns.
#[derive(Debug)]
pub struct Update {
    pub id: ConnectionId,
    pub interest: Interest,
    pub response: Option<Packet>,
    pub session: Option<SessionChange>,
    pub handoff: Option<Handoff>,
}

impl Update {
    /// Send `packet` to connection `id`.
    pub fn respond(id: ConnectionId, packet: Packet) -> Self {
        Self {
            id,
            interest: Interest::Write,
            response: Some(packet),
            session: None,
            handoff: None,
        }
    }

    pub fn bind(mut self, nickname: &str, udp_port: u16) -> Self {
        self.session = Some(SessionChange::Bind {
            nickname: nickname.to_string(),
            udp_port,
        });
        self
    }

    pub fn unbind(mut self) -> Self {
        self.session = Some(SessionChange::Unbind);
        self
    }

    /// Move the connection into a match once the response is flushed.
    pub fn handoff(mut self, handoff: Option<Handoff>) -> Self {
        self.handoff = handoff;
        self
    }
}

#[derive(Debug)]
pub enum Registration {
    Update(Update),
    /// A connection returning from a match.
    Register {
        connection: Connection,
        interest: Interest,
    },
    /// A connection a match saw close; the loop runs the usual cleanup.
    Release { connection: Connection },
}

/// Producer side, cloned into every task that may touch a connection.
#[derive(Debug, Clone)]
pub struct Registrations {
    sender: mpsc::UnboundedSender<Registration>,
}

impl Registrations {
    pub fn submit(&self, registration: Registration) {
        if let Err(e) = self.sender.send(registration) {
            // The loop is gone; dropping the registration closes any socket in it
            warn!("Event loop stopped, dropping {:?}", e.0);
        }
    }

    pub fn respond(&self, id: ConnectionId, packet: Packet) {
        self.submit(Registration::Update(Update::respond(id, packet)));
    }

    pub fn update(&self, update: Update) {
        self.submit(Registration::Update(update));
    }

    pub fn register(&self, connection: Connection, interest: Interest) {
        self.submit(Registration::Register {
            connection,
            interest,
        });
    }

    pub fn release(&self, connection: Connection) {
        self.submit(Registration::Release { connection });
    }
}

/// Consumer side, owned by the main event loop.
#[derive(Debug)]
pub struct RegistrationQueue {
    receiver: mpsc::UnboundedReceiver<Registration>,
}

impl RegistrationQueue {
    /// Waits for the next registration. Cancel safe.
    pub async fn recv(&mut self) -> Option<Registration> {
        self.receiver.recv().await
    }

    /// Everything queued so far, in submission order.
    pub fn drain(&mut self) -> Vec<Registration> {
        let mut drained = Vec::new();
        while let Ok(registration) = self.receiver.try_recv() {
            drained.push(registration);
        }
        drained
    }
}

pub fn registration_queue() -> (Registrations, RegistrationQueue) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Registrations { sender }, RegistrationQueue { receiver })
}
