//! User directory: credentials, friendships, scores and online status.
//!
//! The server only depends on the [`UserDirectory`] contract. [`UserStore`]
//! is the in-memory implementation, optionally backed by a JSON file.
//! Every call may block, so the event loop offloads them with
//! `spawn_blocking`.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::RankingEntry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("wrong password")]
    WrongPassword,
    #[error("{0} is already logged in")]
    AlreadyOnline(String),
    #[error("{0} is not logged in")]
    NotOnline(String),
    #[error("you cannot befriend yourself")]
    SelfFriendship,
    #[error("{0} is already your friend")]
    AlreadyFriends(String),
    #[error("{0} is already registered")]
    AlreadyRegistered(String),
    #[error("nickname and password must not be empty")]
    InvalidCredentials,
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage format failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error("user store lock poisoned")]
    Poisoned,
}

impl DirectoryError {
    /// Faults of the store itself rather than of the request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            DirectoryError::Io(_) | DirectoryError::Json(_) | DirectoryError::Poisoned
        )
    }

    /// Text safe to put in a response's `info` key.
    pub fn wire_message(&self) -> String {
        if self.is_internal() {
            "internal error".to_string()
        } else {
            self.to_string()
        }
    }
}

pub trait UserDirectory: Send + Sync {
    /// Checks credentials and marks the user online.
    fn authenticate(&self, nickname: &str, password: &str) -> Result<(), DirectoryError>;
    fn logout(&self, nickname: &str) -> Result<(), DirectoryError>;
    /// Makes `nickname` and `friend` friends of each other.
    fn add_friend(&self, nickname: &str, friend: &str) -> Result<(), DirectoryError>;
    fn friends(&self, nickname: &str) -> Result<BTreeSet<String>, DirectoryError>;
    fn score(&self, nickname: &str) -> Result<i32, DirectoryError>;
    /// The user and their friends, best score first.
    fn ranking(&self, nickname: &str) -> Result<Vec<RankingEntry>, DirectoryError>;
    /// Adds a match result to the user's total, returning the new total.
    fn add_score(&self, nickname: &str, points: i32) -> Result<i32, DirectoryError>;
    fn is_online(&self, nickname: &str) -> bool;
}

/// When a file-backed store writes its records back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistPolicy {
    #[default]
    Immediately,
    OnLogout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    #[serde(rename = "n")]
    nickname: String,
    #[serde(rename = "p")]
    password: String,
    #[serde(rename = "s", default)]
    score: i32,
    #[serde(rename = "f", default)]
    friends: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct UserStore {
    users: RwLock<HashMap<String, UserRecord>>,
    online: RwLock<HashSet<String>>,
    path: Option<PathBuf>,
    policy: PersistPolicy,
}

impl UserStore {
    /// Empty store living only in memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the users file, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>, policy: PersistPolicy) -> Result<Self, DirectoryError> {
        let path = path.as_ref().to_path_buf();
        let records: Vec<UserRecord> = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            Vec::new()
        };
        info!("Loaded {} users from {}", records.len(), path.display());

        let users = records
            .into_iter()
            .map(|record| (record.nickname.clone(), record))
            .collect();
        Ok(Self {
            users: RwLock::new(users),
            online: RwLock::new(HashSet::new()),
            path: Some(path),
            policy,
        })
    }

    /// Creates an account. Only used to seed the store.
    pub fn register(&self, nickname: &str, password: &str) -> Result<(), DirectoryError> {
        if nickname.is_empty() || password.is_empty() {
            return Err(DirectoryError::InvalidCredentials);
        }
        {
            let mut users = self.write_users()?;
            if users.contains_key(nickname) {
                return Err(DirectoryError::AlreadyRegistered(nickname.to_string()));
            }
            users.insert(
                nickname.to_string(),
                UserRecord {
                    nickname: nickname.to_string(),
                    password: password.to_string(),
                    score: 0,
                    friends: BTreeSet::new(),
                },
            );
        }
        self.persist(PersistPolicy::Immediately)
    }

    /// Writes every record to the backing file, if any.
    pub fn save(&self) -> Result<(), DirectoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut records: Vec<UserRecord> = self.read_users()?.values().cloned().collect();
        records.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        std::fs::write(path, serde_json::to_vec_pretty(&records)?)?;
        debug!("Saved {} users to {}", records.len(), path.display());
        Ok(())
    }

    fn persist(&self, trigger: PersistPolicy) -> Result<(), DirectoryError> {
        if self.policy == trigger {
            self.save()?;
        }
        Ok(())
    }

    fn read_users(&self) -> Result<RwLockReadGuard<'_, HashMap<String, UserRecord>>, DirectoryError> {
        self.users.read().map_err(|_| DirectoryError::Poisoned)
    }

    fn write_users(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, UserRecord>>, DirectoryError> {
        self.users.write().map_err(|_| DirectoryError::Poisoned)
    }

    fn write_online(&self) -> Result<RwLockWriteGuard<'_, HashSet<String>>, DirectoryError> {
        self.online.write().map_err(|_| DirectoryError::Poisoned)
    }
}

impl UserDirectory for UserStore {
    fn authenticate(&self, nickname: &str, password: &str) -> Result<(), DirectoryError> {
        let users = self.read_users()?;
        let record = users
            .get(nickname)
            .ok_or_else(|| DirectoryError::UnknownUser(nickname.to_string()))?;
        if record.password != password {
            return Err(DirectoryError::WrongPassword);
        }

        if !self.write_online()?.insert(nickname.to_string()) {
            return Err(DirectoryError::AlreadyOnline(nickname.to_string()));
        }
        info!("{} logged in", nickname);
        Ok(())
    }

    fn logout(&self, nickname: &str) -> Result<(), DirectoryError> {
        if !self.write_online()?.remove(nickname) {
            return Err(DirectoryError::NotOnline(nickname.to_string()));
        }
        info!("{} logged out", nickname);
        self.persist(PersistPolicy::OnLogout)
    }

    fn add_friend(&self, nickname: &str, friend: &str) -> Result<(), DirectoryError> {
        if nickname == friend {
            return Err(DirectoryError::SelfFriendship);
        }
        {
            let mut users = self.write_users()?;
            if !users.contains_key(friend) {
                return Err(DirectoryError::UnknownUser(friend.to_string()));
            }
            let record = users
                .get_mut(nickname)
                .ok_or_else(|| DirectoryError::UnknownUser(nickname.to_string()))?;
            if !record.friends.insert(friend.to_string()) {
                return Err(DirectoryError::AlreadyFriends(friend.to_string()));
            }
            if let Some(other) = users.get_mut(friend) {
                other.friends.insert(nickname.to_string());
            }
        }
        self.persist(PersistPolicy::Immediately)
    }

    fn friends(&self, nickname: &str) -> Result<BTreeSet<String>, DirectoryError> {
        self.read_users()?
            .get(nickname)
            .map(|record| record.friends.clone())
            .ok_or_else(|| DirectoryError::UnknownUser(nickname.to_string()))
    }

    fn score(&self, nickname: &str) -> Result<i32, DirectoryError> {
        self.read_users()?
            .get(nickname)
            .map(|record| record.score)
            .ok_or_else(|| DirectoryError::UnknownUser(nickname.to_string()))
    }

    fn ranking(&self, nickname: &str) -> Result<Vec<RankingEntry>, DirectoryError> {
        let users = self.read_users()?;
        let record = users
            .get(nickname)
            .ok_or_else(|| DirectoryError::UnknownUser(nickname.to_string()))?;

        let mut ranking: Vec<RankingEntry> = std::iter::once(record)
            .chain(record.friends.iter().filter_map(|friend| {
                let found = users.get(friend);
                if found.is_none() {
                    warn!("{} lists unknown friend {}", nickname, friend);
                }
                found
            }))
            .map(|user| RankingEntry::new(user.nickname.as_str(), user.score))
            .collect();
        ranking.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        Ok(ranking)
    }

    fn add_score(&self, nickname: &str, points: i32) -> Result<i32, DirectoryError> {
        let total = {
            let mut users = self.write_users()?;
            let record = users
                .get_mut(nickname)
                .ok_or_else(|| DirectoryError::UnknownUser(nickname.to_string()))?;
            record.score += points;
            record.score
        };
        self.persist(PersistPolicy::Immediately)?;
        Ok(total)
    }

    fn is_online(&self, nickname: &str) -> bool {
        self.online
            .read()
            .map(|online| online.contains(nickname))
            .unwrap_or(false)
    }
}
