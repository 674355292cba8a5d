//! # World Quizzle Server
//!
//! Server side of World Quizzle, a 1v1 vocabulary translation game: two
//! friends challenge each other and race to translate the same words
//! before the match deadline.
//!
//! ## Architecture
//!
//! ### Main Event Loop (`network`)
//! A single task owns every client connection. It waits on three things at
//! once: new TCP clients, socket readiness for the connections that declared
//! an interest (`selector`), and the registration queue (`registration`).
//! Decoded packets are handed to the dispatcher; nothing that can block ever
//! runs on the loop itself.
//!
//! ### Dispatcher (`dispatch`)
//! Turns each packet into a directory call on the blocking pool, or a
//! challenge request task, and queues the response as a registration.
//! The loop applies registrations before its next wait, so connection
//! state is never touched from another task.
//!
//! ### Challenge Notifications (`notifier`)
//! Online users are pushed challenge requests over UDP. The requester waits
//! on a single-assignment result (`resolution`) that the first of the
//! destination's answer, the request timeout or a disconnect completes.
//!
//! ### Matches (`challenge`, `game`)
//! An accepted challenge moves both connections into a dedicated task with
//! its own readiness loop and deadline. Scoring lives in `game`; results are
//! persisted through the directory and the connections are mailed back to
//! the main loop.
//!
//! ### Collaborators (`storage`, `dictionary`)
//! The user directory and the word source are traits, with a JSON file
//! backed user store and word list as the bundled implementations.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::dictionary::WordListDictionary;
//! use server::network::Server;
//! use server::storage::UserStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let users = UserStore::new();
//!     users.register("alice", "secret")?;
//!     let words = WordListDictionary::new(vec![("cat", vec!["gatto"])]);
//!
//!     let server = Server::bind(ServerConfig::default(), Arc::new(users), Arc::new(words)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod challenge;
pub mod config;
pub mod connection;
pub mod dictionary;
pub mod dispatch;
pub mod game;
pub mod network;
pub mod notifier;
pub mod registration;
pub mod resolution;
pub mod selector;
pub mod storage;
pub mod utils;
