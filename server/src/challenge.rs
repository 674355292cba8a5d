//! Per-match event loop.
//!
//! Once a challenge is accepted, both players' connections leave the main
//! loop and are mailed to a [`ChallengeHandler`]. The handler runs its own
//! readiness loop over just those two sockets, waking at least every
//! `match_poll_interval` to check the match deadline, and finally mails the
//! connections back through the registration queue with the result.

use crate::config::MAX_POLL_INTERVAL;
use crate::connection::{Connection, ConnectionId, ConnectionTable, ReadOutcome};
use crate::dictionary::{DictionaryError, WordEntry};
use crate::dispatch::Services;
use crate::game::{FinalScore, Match, Progress};
use crate::selector::{self, Interest};
use crate::storage::{DirectoryError, UserDirectory};
use log::{debug, error, info, warn};
use shared::{Command, Operation, Packet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Setup,
    Running,
    Finished,
    Error,
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("could not build the word list: {0}")]
    Dictionary(#[from] DictionaryError),
    #[error("word list task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("players did not join within {0:?}")]
    SetupTimeout(Duration),
    #[error("{0} left the challenge")]
    Disconnected(String),
    #[error("unexpected packet from {player}: {reason}")]
    MalformedInput { player: String, reason: String },
    #[error("connection to {player} failed: {source}")]
    Io {
        player: String,
        #[source]
        source: io::Error,
    },
    #[error("could not record scores: {0}")]
    Persistence(#[from] DirectoryError),
}

impl ChallengeError {
    /// Text safe to send to the players.
    pub fn wire_message(&self) -> String {
        match self {
            ChallengeError::Dictionary(_)
            | ChallengeError::Task(_)
            | ChallengeError::Persistence(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub struct ChallengeHandler {
    services: Arc<Services>,
    players: [String; 2],
    state: ChallengeState,
    game: Option<Match>,
    connections: ConnectionTable,
    mailbox: mpsc::UnboundedReceiver<Connection>,
    error: Option<ChallengeError>,
}

impl ChallengeHandler {
    /// A handler whose word list could not be built starts in
    /// [`ChallengeState::Error`] and never opens its readiness loop.
    pub fn new(
        services: Arc<Services>,
        players: [String; 2],
        words: Result<Vec<WordEntry>, ChallengeError>,
        mailbox: mpsc::UnboundedReceiver<Connection>,
    ) -> Self {
        let (state, game, error) = match words {
            Ok(words) => {
                let game = Match::new(players.clone(), words, services.config.scoring());
                (ChallengeState::Setup, Some(game), None)
            }
            Err(e) => {
                error!("Challenge {} vs {} cannot start: {}", players[0], players[1], e);
                (ChallengeState::Error, None, Some(e))
            }
        };

        Self {
            services,
            players,
            state,
            game,
            connections: ConnectionTable::new(2),
            mailbox,
            error,
        }
    }

    /// Builds the word list on the blocking pool, then runs the match.
    pub fn spawn(
        services: Arc<Services>,
        players: [String; 2],
        mailbox: mpsc::UnboundedReceiver<Connection>,
    ) -> JoinHandle<ChallengeState> {
        tokio::spawn(async move {
            let dictionary = Arc::clone(&services.dictionary);
            let count = services.config.words_for_challenge;
            let words = match tokio::task::spawn_blocking(move || dictionary.dictionary(count)).await
            {
                Ok(words) => words.map_err(ChallengeError::from),
                Err(e) => Err(e.into()),
            };
            Self::new(services, players, words, mailbox).run().await
        })
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub async fn run(mut self) -> ChallengeState {
        if let Err(e) = self.gather().await {
            self.fail(e);
        }
        if self.state == ChallengeState::Setup {
            if let Err(e) = self.play().await {
                self.fail(e);
            }
        }

        if self.state == ChallengeState::Error {
            self.abort();
        } else {
            self.finish().await;
        }
        self.state
    }

    /// Collects both players' connections from the mailbox.
    async fn gather(&mut self) -> Result<(), ChallengeError> {
        let setup_timeout = self.services.config.challenge_setup_timeout;
        let deadline = tokio::time::Instant::now() + setup_timeout;

        while self.connections.len() < self.players.len() {
            let mut connection = match tokio::time::timeout_at(deadline, self.mailbox.recv()).await
            {
                Ok(Some(connection)) => connection,
                Ok(None) => return Err(ChallengeError::Disconnected(self.missing_player())),
                Err(_) => return Err(ChallengeError::SetupTimeout(setup_timeout)),
            };

            let is_player = connection
                .user
                .as_deref()
                .map_or(false, |user| self.players.iter().any(|p| p == user));
            if !is_player {
                warn!("Connection {} is not part of this challenge", connection.label());
                self.services.registrations.register(connection, Interest::Read);
                continue;
            }

            debug!("{} joined the challenge", connection.label());
            connection.handoff = None;
            connection.interest = Interest::Read;
            self.connections.adopt(connection);
        }
        Ok(())
    }

    async fn play(&mut self) -> Result<(), ChallengeError> {
        self.state = ChallengeState::Running;
        let poll_interval = self.services.config.match_poll_interval.min(MAX_POLL_INTERVAL);
        let deadline = Instant::now() + self.services.config.challenge_duration;
        info!("Challenge {} vs {} started", self.players[0], self.players[1]);

        loop {
            // The deadline check is authoritative: nothing read after it passes counts
            let now = Instant::now();
            if now >= deadline {
                info!("Challenge {} vs {}: time is up", self.players[0], self.players[1]);
                return Ok(());
            }
            if self.game.as_ref().map_or(true, Match::is_finished) {
                return Ok(());
            }

            let wait = poll_interval.min(deadline - now);
            let ready = match tokio::time::timeout(wait, selector::select(&self.connections)).await {
                Ok(ready) => ready,
                Err(_) => continue,
            };
            for (id, interest) in ready {
                match interest {
                    Interest::Read => self.read(id, deadline)?,
                    Interest::Write => self.write(id)?,
                    Interest::Idle => {}
                }
            }
        }
    }

    fn read(&mut self, id: ConnectionId, deadline: Instant) -> Result<(), ChallengeError> {
        let Some(connection) = self.connections.get_mut(id) else {
            return Ok(());
        };
        let player = connection.user.clone().unwrap_or_default();

        let packet = match connection.read_packet() {
            Ok(ReadOutcome::Packet(packet)) => packet,
            Ok(ReadOutcome::Partial | ReadOutcome::WouldBlock) => return Ok(()),
            Ok(ReadOutcome::Invalid(e)) => {
                return Err(ChallengeError::MalformedInput {
                    player,
                    reason: e.to_string(),
                })
            }
            Ok(ReadOutcome::Closed) => {
                self.release(id);
                return Err(ChallengeError::Disconnected(player));
            }
            Err(source) => {
                self.release(id);
                return Err(ChallengeError::Io { player, source });
            }
        };
        debug!("<- {} (challenge): {:?}", player, packet);

        let now = Instant::now();
        let Some(game) = self.game.as_mut() else {
            return Ok(());
        };
        let progress = match packet.command() {
            Ok(Command::SetupAck) => game.start(&player, now),
            Ok(Command::WordAnswer { word }) if now < deadline => game.answer(&player, &word, now),
            Ok(Command::WordAnswer { .. }) => {
                debug!("Late answer from {} ignored", player);
                Progress::Ignored
            }
            Ok(other) => {
                debug!("Ignoring {:?} from {} during a challenge", other, player);
                Progress::Ignored
            }
            Err(e) => {
                return Err(ChallengeError::MalformedInput {
                    player,
                    reason: e.to_string(),
                })
            }
        };

        if let Progress::Ask(word) = progress {
            if let Some(connection) = self.connections.get_mut(id) {
                connection.respond(&Packet::ask_word(&word));
            }
        }
        Ok(())
    }

    fn write(&mut self, id: ConnectionId) -> Result<(), ChallengeError> {
        let Some(connection) = self.connections.get_mut(id) else {
            return Ok(());
        };
        match connection.flush() {
            Ok(true) => {
                connection.interest = Interest::Read;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(source) => {
                let player = connection.user.clone().unwrap_or_default();
                self.release(id);
                Err(ChallengeError::Io { player, source })
            }
        }
    }

    /// Hands a dead connection back to the main loop for cleanup.
    fn release(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.remove(id) {
            self.services.registrations.release(connection);
        }
    }

    fn fail(&mut self, e: ChallengeError) {
        warn!(
            "Challenge {} vs {} failed: {}",
            self.players[0], self.players[1], e
        );
        self.state = ChallengeState::Error;
        self.error.get_or_insert(e);
    }

    /// Ranks the players, records their scores and sends each their result.
    async fn finish(&mut self) {
        let Some(outcome) = self.game.as_ref().map(Match::outcome) else {
            self.abort();
            return;
        };

        let directory = Arc::clone(&self.services.directory);
        let standings = outcome.standings.clone();
        let persisted =
            tokio::task::spawn_blocking(move || commit_scores(directory.as_ref(), &standings))
                .await;
        let persisted = match persisted {
            Ok(result) => result.map_err(ChallengeError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = persisted {
            error!("Scores of {} vs {} lost: {}", self.players[0], self.players[1], e);
            self.fail(e);
            self.abort();
            return;
        }

        self.state = ChallengeState::Finished;
        for connection in self.connections.drain() {
            let score = connection
                .user
                .as_deref()
                .and_then(|user| outcome.score_of(user))
                .unwrap_or(0);
            let result = Packet::ok(Operation::StopChallenge)
                .with_message(outcome.winner.clone())
                .with_score(score);
            self.return_connection(connection, result);
        }
    }

    /// Sends an error result to every player still connected.
    fn abort(&mut self) {
        self.state = ChallengeState::Error;
        let reason = self
            .error
            .as_ref()
            .map(ChallengeError::wire_message)
            .unwrap_or_else(|| "unexpected error".to_string());

        for connection in self.connections.drain() {
            let result = Packet::error(Operation::StopChallenge)
                .with_message(format!("challenge aborted: {}", reason));
            self.return_connection(connection, result);
        }
    }

    fn return_connection(&self, mut connection: Connection, result: Packet) {
        connection.respond(&result);
        self.services.registrations.register(connection, Interest::Write);
    }

    fn missing_player(&self) -> String {
        self.players
            .iter()
            .find(|p| self.connections.find_by_user(p).is_none())
            .cloned()
            .unwrap_or_default()
    }
}

/// Adds every final score to the directory. If one fails, the ones already
/// added are taken back out so the match counts for both players or neither.
fn commit_scores(
    directory: &dyn UserDirectory,
    standings: &[FinalScore],
) -> Result<(), DirectoryError> {
    for (committed, entry) in standings.iter().enumerate() {
        let Err(e) = directory.add_score(&entry.nickname, entry.score) else {
            continue;
        };
        for done in &standings[..committed] {
            match directory.add_score(&done.nickname, -done.score) {
                Ok(_) => warn!("Rolled back {} points of {}", done.score, done.nickname),
                Err(undo) => error!(
                    "Partial commit: {} keeps {} points ({})",
                    done.nickname, done.score, undo
                ),
            }
        }
        return Err(e);
    }
    Ok(())
}
