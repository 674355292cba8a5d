//! Routing of decoded client packets.
//!
//! The main loop hands every decoded packet to [`dispatch`] and parks the
//! connection until an [`Update`] for it comes back through the
//! registration queue. Cheap in-memory reads answer at once; everything
//! that may block runs on the blocking pool, and challenge requests wait
//! for their answer on a task of their own.

use crate::challenge::ChallengeHandler;
use crate::config::ServerConfig;
use crate::connection::ConnectionId;
use crate::dictionary::Dictionary;
use crate::notifier::{ChallengeReply, NotifierService};
use crate::registration::{Registrations, Update};
use crate::storage::{DirectoryError, UserDirectory};
use log::{debug, error, info, warn};
use shared::{Command, Operation, Packet, ResponseCode};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Process-wide services, built once and shared by handle.
pub struct Services {
    pub config: ServerConfig,
    pub directory: Arc<dyn UserDirectory>,
    pub dictionary: Arc<dyn Dictionary>,
    pub notifier: NotifierService,
    pub registrations: Registrations,
}

/// The connection a packet came from, as the main loop saw it.
#[derive(Debug, Clone)]
pub struct Origin {
    pub id: ConnectionId,
    pub user: Option<String>,
}

pub fn dispatch(services: &Arc<Services>, origin: Origin, packet: Packet) {
    let operation = packet.operation;
    let id = origin.id;
    let command = match packet.command() {
        Ok(command) => command,
        Err(e) => {
            warn!("Malformed packet from connection {}: {}", id, e);
            services
                .registrations
                .respond(id, Packet::error(operation).with_message(e.to_string()));
            return;
        }
    };

    match (command, origin.user) {
        (
            Command::Login {
                nickname,
                password,
                udp_port,
            },
            None,
        ) => offload(services, id, operation, move |services| {
            services.directory.authenticate(&nickname, &password)?;
            Ok(Update::respond(id, Packet::ok(Operation::Login)).bind(&nickname, udp_port))
        }),
        (Command::Login { .. }, Some(user)) => services.registrations.respond(
            id,
            Packet::error(operation).with_message(format!("already logged in as {}", user)),
        ),
        (_, None) => services
            .registrations
            .respond(id, Packet::error(operation).with_message("not logged in")),
        (Command::Logout, Some(user)) => offload(services, id, operation, move |services| {
            services.directory.logout(&user)?;
            Ok(Update::respond(id, Packet::ok(Operation::Logout)).unbind())
        }),
        (Command::AddFriend { friend }, Some(user)) => {
            offload(services, id, operation, move |services| {
                services.directory.add_friend(&user, &friend)?;
                info!("{} and {} are now friends", user, friend);
                Ok(Update::respond(
                    id,
                    Packet::ok(Operation::AddFriend).with_friend(&friend),
                ))
            })
        }
        (Command::GetFriends, Some(user)) => offload(services, id, operation, move |services| {
            let friends = services.directory.friends(&user)?;
            Ok(Update::respond(
                id,
                Packet::ok(Operation::GetFriends).with_friends(friends),
            ))
        }),
        (Command::GetScore, Some(user)) => {
            let response = match services.directory.score(&user) {
                Ok(score) => Packet::ok(operation).with_score(score),
                Err(e) => error_packet(operation, &e),
            };
            services.registrations.respond(id, response);
        }
        (Command::GetRanking, Some(user)) => offload(services, id, operation, move |services| {
            let ranking = services.directory.ranking(&user)?;
            Ok(Update::respond(
                id,
                Packet::ok(Operation::GetRanking).with_ranking(ranking),
            ))
        }),
        (Command::RequestChallenge { friend }, Some(user)) => {
            request_challenge(services, id, user, friend)
        }
        (
            Command::ChallengeAnswer {
                challenger,
                accepted,
            },
            Some(user),
        ) => answer_challenge(services, id, user, challenger, accepted),
        (Command::SetupAck | Command::WordAnswer { .. }, Some(_)) => services
            .registrations
            .respond(id, Packet::error(operation).with_message("no challenge in progress")),
    }
}

/// Runs a directory job on the blocking pool and queues its answer.
fn offload<F>(services: &Arc<Services>, id: ConnectionId, operation: Operation, job: F)
where
    F: FnOnce(&Services) -> Result<Update, DirectoryError> + Send + 'static,
{
    let services = Arc::clone(services);
    tokio::task::spawn_blocking(move || {
        let update = job(&services)
            .unwrap_or_else(|e| Update::respond(id, error_packet(operation, &e)));
        services.registrations.update(update);
    });
}

fn error_packet(operation: Operation, e: &DirectoryError) -> Packet {
    if e.is_internal() {
        error!("{:?} failed: {}", operation, e);
    } else {
        debug!("{:?} refused: {}", operation, e);
    }
    Packet::error(operation).with_message(e.wire_message())
}

fn request_challenge(services: &Arc<Services>, id: ConnectionId, user: String, friend: String) {
    if user == friend {
        services.registrations.respond(
            id,
            Packet::error(Operation::RequestChallenge).with_message("you cannot challenge yourself"),
        );
        return;
    }

    let services = Arc::clone(services);
    tokio::spawn(async move {
        let update = wait_for_challenge(&services, id, &user, &friend).await;
        services.registrations.update(update);
    });
}

async fn wait_for_challenge(
    services: &Arc<Services>,
    id: ConnectionId,
    user: &str,
    friend: &str,
) -> Update {
    let operation = Operation::RequestChallenge;
    let refuse = |message: String| Update::respond(id, Packet::error(operation).with_message(message));

    let friends = {
        let services = Arc::clone(services);
        let user = user.to_string();
        tokio::task::spawn_blocking(move || services.directory.friends(&user)).await
    };
    let friends = match friends {
        Ok(Ok(friends)) => friends,
        Ok(Err(e)) => return Update::respond(id, error_packet(operation, &e)),
        Err(e) => {
            error!("Friend lookup for {} failed: {}", user, e);
            return refuse("internal error".to_string());
        }
    };

    if !friends.contains(friend) {
        return refuse(format!("{} is not your friend", friend));
    }
    if !services.notifier.is_online(friend) {
        return refuse(format!("{} is not online", friend));
    }
    if let Err(e) = services.notifier.notify_challenge_request(friend, user).await {
        return refuse(e.to_string());
    }

    match services.notifier.get_response(user).await {
        Ok(reply) => {
            debug!("Challenge {} -> {} resolved: {:?}", user, friend, reply.packet.response);
            Update::respond(id, reply.packet).handoff(reply.handoff)
        }
        Err(e) => refuse(e.to_string()),
    }
}

fn answer_challenge(
    services: &Arc<Services>,
    id: ConnectionId,
    user: String,
    challenger: String,
    accepted: bool,
) {
    let expired = || {
        Packet::error(Operation::ForwardChallenge)
            .with_friend(&challenger)
            .with_message("challenge expired")
    };

    if !accepted {
        let refusal = Packet::response(Operation::RequestChallenge, ResponseCode::Discard)
            .with_friend(&user)
            .with_message(format!("{} declined the challenge", user));
        let ack = if services.notifier.set_notification_response(
            &challenger,
            &user,
            ChallengeReply::new(refusal),
        ) {
            info!("{} declined the challenge from {}", user, challenger);
            Packet::ok(Operation::ForwardChallenge).with_friend(&challenger)
        } else {
            expired()
        };
        services.registrations.respond(id, ack);
        return;
    }

    let (handoff, mailbox) = mpsc::unbounded_channel();
    let setup = Packet::ok(Operation::SetupChallenge).with_message(services.config.challenge_rules());
    let reply = ChallengeReply {
        packet: setup.clone(),
        handoff: Some(handoff.clone()),
    };
    if !services
        .notifier
        .set_notification_response(&challenger, &user, reply)
    {
        debug!("{} answered an expired challenge from {}", user, challenger);
        services.registrations.respond(id, expired());
        return;
    }

    info!("{} accepted the challenge from {}", user, challenger);
    ChallengeHandler::spawn(Arc::clone(services), [challenger, user], mailbox);
    services
        .registrations
        .update(Update::respond(id, setup).handoff(Some(handoff)));
}
