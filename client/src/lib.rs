//! # World Quizzle Client Library
//!
//! Protocol client for the World Quizzle server. A [`QuizzleClient`] owns the
//! TCP connection used for every request and response, and a UDP socket
//! whose port is advertised at login so the server can push challenge
//! requests to it.
//!
//! ## Flow of a match
//!
//! 1. Both players [`login`](QuizzleClient::login).
//! 2. The challenger calls [`request_challenge`](QuizzleClient::request_challenge),
//!    which resolves once the friend answers or the request expires.
//! 3. The friend receives the push with [`next_push`](QuizzleClient::next_push)
//!    and replies with [`answer_challenge`](QuizzleClient::answer_challenge).
//! 4. After accepting, each side sends [`ack_setup`](QuizzleClient::ack_setup)
//!    and then alternates [`next_event`](QuizzleClient::next_event) and
//!    [`answer_word`](QuizzleClient::answer_word) until
//!    [`MatchEvent::Finished`] or [`MatchEvent::Aborted`] arrives.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{MatchEvent, QuizzleClient};
//! use std::time::Duration;
//!
//! # async fn play() -> Result<(), client::ClientError> {
//! let mut alice = QuizzleClient::connect("127.0.0.1:4242").await?;
//! alice.login("alice", "secret").await?;
//! let rules = alice.request_challenge("bob").await?;
//! println!("{}", rules);
//!
//! alice.ack_setup().await?;
//! while let MatchEvent::Word(word) = alice.next_event(Duration::from_secs(60)).await? {
//!     alice.answer_word(&format!("translation of {}", word)).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod network;

pub use network::{ClientError, MatchEvent, QuizzleClient};
