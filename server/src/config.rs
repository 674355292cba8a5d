//! Server configuration and the match rules derived from it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the match loop's readiness wait, so the deadline is
/// re-checked at least this often.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tcp_addr: SocketAddr,
    /// Local address of the socket challenge pushes are sent from.
    pub udp_addr: SocketAddr,
    pub max_connections: usize,
    pub challenge_request_timeout: Duration,
    pub challenge_duration: Duration,
    /// How long a match waits for both players to be handed over.
    pub challenge_setup_timeout: Duration,
    pub words_for_challenge: usize,
    pub word_bonus: i32,
    pub word_malus: i32,
    pub winner_extra_points: i32,
    pub match_poll_interval: Duration,
    pub users_file: Option<PathBuf>,
    pub dictionary_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: SocketAddr::from(([127, 0, 0, 1], 4242)),
            udp_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: 1024,
            challenge_request_timeout: Duration::from_millis(5000),
            challenge_duration: Duration::from_secs(60),
            challenge_setup_timeout: Duration::from_secs(10),
            words_for_challenge: 5,
            word_bonus: 2,
            word_malus: 1,
            winner_extra_points: 3,
            match_poll_interval: MAX_POLL_INTERVAL,
            users_file: None,
            dictionary_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.words_for_challenge == 0 {
            return Err(ConfigError("a challenge needs at least one word".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError("max_connections must be positive".into()));
        }
        for (name, value) in [
            ("challenge_request_timeout", self.challenge_request_timeout),
            ("challenge_duration", self.challenge_duration),
            ("challenge_setup_timeout", self.challenge_setup_timeout),
            ("match_poll_interval", self.match_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError(format!("{} must be positive", name)));
            }
        }
        if self.match_poll_interval > MAX_POLL_INTERVAL {
            return Err(ConfigError(format!(
                "match_poll_interval must not exceed {:?}",
                MAX_POLL_INTERVAL
            )));
        }
        Ok(())
    }

    /// Rules text sent to both players with `SETUP_CHALLENGE`.
    pub fn challenge_rules(&self) -> String {
        format!(
            "You and your opponent will have {} seconds to translate {} words.",
            self.challenge_duration.as_secs_f64(),
            self.words_for_challenge
        )
    }

    pub fn scoring(&self) -> Scoring {
        Scoring {
            word_bonus: self.word_bonus,
            word_malus: self.word_malus,
            winner_extra_points: self.winner_extra_points,
        }
    }
}

/// Points awarded during a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scoring {
    pub word_bonus: i32,
    pub word_malus: i32,
    pub winner_extra_points: i32,
}

impl Default for Scoring {
    fn default() -> Self {
        ServerConfig::default().scoring()
    }
}
