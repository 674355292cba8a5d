//! Online-user registry and challenge notifications.
//!
//! A challenge request is pushed to its destination as a UDP datagram. The
//! requester then waits on a [`Resolution`] that is completed by whichever
//! comes first: the destination's answer, the request timeout, or one of the
//! two users going offline. A sender has at most one pending notification.

use crate::connection::Handoff;
use crate::resolution::Resolution;
use crate::utils::get_timestamp;
use log::{debug, info, warn};
use shared::{encode, Operation, Packet, PacketError};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("{0} is not online")]
    Offline(String),
    #[error("{0} already has a pending challenge request")]
    AlreadyPending(String),
    #[error("no pending challenge request from {0}")]
    NoPendingNotification(String),
    #[error("cannot encode push: {0}")]
    Encode(#[from] PacketError),
}

/// What the requester of a challenge eventually receives.
#[derive(Debug, Clone)]
pub struct ChallengeReply {
    pub packet: Packet,
    /// Present when the challenge was accepted: the requester's connection
    /// joins the match after this reply is flushed.
    pub handoff: Option<Handoff>,
}

impl ChallengeReply {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            handoff: None,
        }
    }
}

#[derive(Debug)]
struct PendingNotification {
    destination: String,
    deadline: Instant,
    result: Resolution<ChallengeReply>,
}

#[derive(Debug)]
pub struct NotifierService {
    socket: UdpSocket,
    request_timeout: Duration,
    /// Online users and where their pushes are sent.
    online: Mutex<HashMap<String, SocketAddr>>,
    pending: Mutex<HashMap<String, Arc<PendingNotification>>>,
}

impl NotifierService {
    pub async fn bind(addr: SocketAddr, request_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Challenge notifications sent from {}", socket.local_addr()?);
        Ok(Self {
            socket,
            request_timeout,
            online: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn add_connection(&self, nickname: &str, udp_addr: SocketAddr) {
        debug!("{} online, pushes go to {}", nickname, udp_addr);
        lock(&self.online).insert(nickname.to_string(), udp_addr);
    }

    /// Drops `nickname` from the registry. Their own pending request and any
    /// request aimed at them are resolved with an error right away.
    pub fn remove_connection(&self, nickname: &str) {
        if lock(&self.online).remove(nickname).is_none() {
            return;
        }
        debug!("{} offline", nickname);

        let pending = lock(&self.pending);
        for (sender, notification) in pending.iter() {
            if sender == nickname {
                notification.result.complete(ChallengeReply::new(
                    Packet::error(Operation::RequestChallenge)
                        .with_message("challenge cancelled"),
                ));
            } else if notification.destination == nickname
                && notification.result.complete(ChallengeReply::new(
                    Packet::error(Operation::RequestChallenge)
                        .with_message(format!("{} went offline", nickname)),
                ))
            {
                info!("Challenge from {} cancelled, {} went offline", sender, nickname);
            }
        }
    }

    pub fn is_online(&self, nickname: &str) -> bool {
        lock(&self.online).contains_key(nickname)
    }

    /// Pushes a challenge from `sender` to `destination` and arms the
    /// request timeout.
    ///
    /// The push itself is fire and forget: a lost datagram surfaces as a
    /// timeout.
    pub async fn notify_challenge_request(
        &self,
        destination: &str,
        sender: &str,
    ) -> Result<(), NotifierError> {
        if !self.is_online(sender) {
            return Err(NotifierError::Offline(sender.to_string()));
        }
        let udp_addr = lock(&self.online)
            .get(destination)
            .copied()
            .ok_or_else(|| NotifierError::Offline(destination.to_string()))?;

        let ttl = self.request_timeout.as_millis() as u64;
        let push = encode(&Packet::challenge_push(sender, ttl, get_timestamp()))?;

        let notification = {
            let mut pending = lock(&self.pending);
            if pending.contains_key(sender) {
                return Err(NotifierError::AlreadyPending(sender.to_string()));
            }
            let notification = Arc::new(PendingNotification {
                destination: destination.to_string(),
                deadline: Instant::now() + self.request_timeout,
                result: Resolution::new(),
            });
            pending.insert(sender.to_string(), Arc::clone(&notification));
            notification
        };

        match self.socket.send_to(&push, udp_addr).await {
            Ok(_) => info!("Challenge {} -> {} pushed to {}", sender, destination, udp_addr),
            Err(e) => warn!("Push to {} at {} failed: {}", destination, udp_addr, e),
        }

        let sender = sender.to_string();
        let destination = destination.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(notification.deadline).await;
            let expired = ChallengeReply::new(
                Packet::error(Operation::RequestChallenge).with_message(format!(
                    "{} did not answer within {} ms",
                    destination, ttl
                )),
            );
            if notification.result.complete(expired) {
                info!("Challenge {} -> {} timed out", sender, destination);
            }
        });
        Ok(())
    }

    /// Answers the pending request of `sender` on behalf of `responder`.
    ///
    /// Returns whether this answer won the race. Answers from anyone but the
    /// pushed user, or after the request was resolved, lose.
    pub fn set_notification_response(
        &self,
        sender: &str,
        responder: &str,
        reply: ChallengeReply,
    ) -> bool {
        let Some(notification) = lock(&self.pending).get(sender).cloned() else {
            return false;
        };
        if notification.destination != responder {
            warn!(
                "{} answered a challenge from {} meant for {}",
                responder, sender, notification.destination
            );
            return false;
        }
        notification.result.complete(reply)
    }

    /// Waits for the pending request of `requester` to resolve, then forgets
    /// it so a new request can be made.
    pub async fn get_response(&self, requester: &str) -> Result<ChallengeReply, NotifierError> {
        let notification = lock(&self.pending)
            .get(requester)
            .cloned()
            .ok_or_else(|| NotifierError::NoPendingNotification(requester.to_string()))?;

        let reply = notification.result.wait().await.clone();

        let mut pending = lock(&self.pending);
        if pending
            .get(requester)
            .map_or(false, |current| Arc::ptr_eq(current, &notification))
        {
            pending.remove(requester);
        }
        Ok(reply)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
