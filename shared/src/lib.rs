//! Wire protocol shared by the World Quizzle server and clients.
//!
//! Every message is a [`Packet`]: a JSON object with short keys framed by a
//! 4-byte big-endian length header (see [`codec`]). Requests carry only an
//! operation tag and their parameters; responses repeat the operation and add
//! a [`ResponseCode`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub mod codec;
pub mod framing;

pub use codec::{decode, decode_frame, encode, PacketError, HEADER_LEN, MAX_PACKET_LEN};
pub use framing::{FrameState, PacketBuffer};

/// Operation tag carried in the `op` key of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Login,
    Logout,
    AddFriend,
    GetFriends,
    GetScore,
    GetRanking,
    RequestChallenge,
    ForwardChallenge,
    SetupChallenge,
    AskWord,
    StopChallenge,
}

/// Response code carried in the `rc` key. Present iff the packet is a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Error,
    Accept,
    Discard,
}

/// One row of a `GET_RANKING` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "s")]
    pub score: i32,
}

impl RankingEntry {
    pub fn new(name: impl Into<String>, score: i32) -> Self {
        Self {
            name: name.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "op")]
    pub operation: Operation,
    #[serde(rename = "rc", skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseCode>,
    #[serde(rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(rename = "ts", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(rename = "passw", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "port", skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
    /// Target nickname: friend to add, player to challenge, or challenger.
    #[serde(rename = "f", skip_serializing_if = "Option::is_none")]
    pub friend: Option<String>,
    #[serde(rename = "w", skip_serializing_if = "Option::is_none")]
    pub word: Option<String>,
    #[serde(rename = "info", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "rank", skip_serializing_if = "Option::is_none")]
    pub ranking: Option<Vec<RankingEntry>>,
    #[serde(rename = "fl", skip_serializing_if = "Option::is_none")]
    pub friends: Option<BTreeSet<String>>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub score: Option<i32>,
}

impl Packet {
    /// Bare request packet for `operation`.
    pub fn request(operation: Operation) -> Self {
        Self {
            operation,
            response: None,
            ttl: None,
            timestamp: None,
            nickname: None,
            password: None,
            udp_port: None,
            friend: None,
            word: None,
            message: None,
            ranking: None,
            friends: None,
            score: None,
        }
    }

    pub fn response(operation: Operation, code: ResponseCode) -> Self {
        Self {
            response: Some(code),
            ..Self::request(operation)
        }
    }

    pub fn ok(operation: Operation) -> Self {
        Self::response(operation, ResponseCode::Ok)
    }

    pub fn error(operation: Operation) -> Self {
        Self::response(operation, ResponseCode::Error)
    }

    pub fn login(nickname: &str, password: &str, udp_port: u16) -> Self {
        Self {
            nickname: Some(nickname.to_string()),
            password: Some(password.to_string()),
            udp_port: Some(udp_port),
            ..Self::request(Operation::Login)
        }
    }

    pub fn add_friend(friend: &str) -> Self {
        Self::request(Operation::AddFriend).with_friend(friend)
    }

    pub fn request_challenge(friend: &str) -> Self {
        Self::request(Operation::RequestChallenge).with_friend(friend)
    }

    /// Server push announcing a challenge from `challenger`, sent over UDP.
    pub fn challenge_push(challenger: &str, ttl: u64, timestamp: u64) -> Self {
        Self::request(Operation::ForwardChallenge)
            .with_friend(challenger)
            .with_ttl(ttl)
            .with_timestamp(timestamp)
    }

    /// The pushed user's answer, sent back over TCP with the same opcode.
    pub fn challenge_answer(challenger: &str, accepted: bool) -> Self {
        let code = if accepted {
            ResponseCode::Accept
        } else {
            ResponseCode::Discard
        };
        Self::response(Operation::ForwardChallenge, code).with_friend(challenger)
    }

    /// Acknowledges `SETUP_CHALLENGE`: the client is ready for the first word.
    pub fn setup_ack() -> Self {
        Self::ok(Operation::SetupChallenge)
    }

    /// A word to translate, sent by the server during a match.
    pub fn ask_word(word: &str) -> Self {
        Self::request(Operation::AskWord).with_word(word)
    }

    /// A player's translation of the last word asked.
    pub fn word_answer(translation: &str) -> Self {
        Self::ok(Operation::AskWord).with_word(translation)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_friend(mut self, friend: &str) -> Self {
        self.friend = Some(friend.to_string());
        self
    }

    pub fn with_word(mut self, word: &str) -> Self {
        self.word = Some(word.to_string());
        self
    }

    pub fn with_score(mut self, score: i32) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_friends(mut self, friends: BTreeSet<String>) -> Self {
        self.friends = Some(friends);
        self
    }

    pub fn with_ranking(mut self, ranking: Vec<RankingEntry>) -> Self {
        self.ranking = Some(ranking);
        self
    }

    pub fn is_request(&self) -> bool {
        self.response.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn is_ok(&self) -> bool {
        self.response == Some(ResponseCode::Ok)
    }

    /// Interprets a packet received by the server as a typed command.
    ///
    /// Fails with [`PacketError::Malformed`] when the fields present do not
    /// match what the operation requires, or when the packet travels in a
    /// direction clients never use (a pushed `FORWARD_CHALLENGE` request, an
    /// `ASK_WORD` request, ...).
    pub fn command(&self) -> Result<Command, PacketError> {
        let malformed = |reason: &'static str| PacketError::Malformed {
            operation: self.operation,
            reason,
        };

        match (self.operation, self.response) {
            (Operation::Login, None) => {
                let nickname = non_empty(&self.nickname).ok_or_else(|| malformed("missing name"))?;
                let password =
                    non_empty(&self.password).ok_or_else(|| malformed("missing password"))?;
                let udp_port = self.udp_port.ok_or_else(|| malformed("missing udp port"))?;
                Ok(Command::Login {
                    nickname,
                    password,
                    udp_port,
                })
            }
            (Operation::Logout, None) => Ok(Command::Logout),
            (Operation::AddFriend, None) => non_empty(&self.friend)
                .map(|friend| Command::AddFriend { friend })
                .ok_or_else(|| malformed("missing friend")),
            (Operation::GetFriends, None) => Ok(Command::GetFriends),
            (Operation::GetScore, None) => Ok(Command::GetScore),
            (Operation::GetRanking, None) => Ok(Command::GetRanking),
            (Operation::RequestChallenge, None) => non_empty(&self.friend)
                .map(|friend| Command::RequestChallenge { friend })
                .ok_or_else(|| malformed("missing friend")),
            (Operation::ForwardChallenge, Some(code)) => {
                let accepted = match code {
                    ResponseCode::Accept => true,
                    ResponseCode::Discard => false,
                    _ => return Err(malformed("answer must be ACCEPT or DISCARD")),
                };
                let challenger =
                    non_empty(&self.friend).ok_or_else(|| malformed("missing challenger"))?;
                Ok(Command::ChallengeAnswer {
                    challenger,
                    accepted,
                })
            }
            (Operation::SetupChallenge, Some(ResponseCode::Ok)) => Ok(Command::SetupAck),
            (Operation::AskWord, Some(ResponseCode::Ok)) => self
                .word
                .clone()
                .map(|word| Command::WordAnswer { word })
                .ok_or_else(|| malformed("missing word")),
            (_, None) => Err(malformed("not a client request")),
            (_, Some(_)) => Err(malformed("not a client response")),
        }
    }
}

fn non_empty(field: &Option<String>) -> Option<String> {
    field.as_ref().filter(|s| !s.is_empty()).cloned()
}

/// Typed view of everything a client may send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login {
        nickname: String,
        password: String,
        udp_port: u16,
    },
    Logout,
    AddFriend {
        friend: String,
    },
    GetFriends,
    GetScore,
    GetRanking,
    RequestChallenge {
        friend: String,
    },
    /// `FORWARD_CHALLENGE` response (ACCEPT/DISCARD) to an earlier push.
    ChallengeAnswer {
        challenger: String,
        accepted: bool,
    },
    SetupAck,
    WordAnswer {
        word: String,
    },
}

/// Typed view of the UDP challenge notification.
///
/// On the wire this is a `FORWARD_CHALLENGE` request, the same opcode the
/// pushed client later uses for its [`Command::ChallengeAnswer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePush {
    pub challenger: String,
    /// Milliseconds the challenger waits for an answer.
    pub ttl: u64,
    /// Unix time in milliseconds at which the push was sent.
    pub timestamp: u64,
}

impl ChallengePush {
    pub fn to_packet(&self) -> Packet {
        Packet::challenge_push(&self.challenger, self.ttl, self.timestamp)
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, PacketError> {
        let malformed = |reason: &'static str| PacketError::Malformed {
            operation: packet.operation,
            reason,
        };
        if packet.operation != Operation::ForwardChallenge || packet.is_response() {
            return Err(malformed("not a challenge push"));
        }
        Ok(Self {
            challenger: non_empty(&packet.friend).ok_or_else(|| malformed("missing challenger"))?,
            ttl: packet.ttl.ok_or_else(|| malformed("missing ttl"))?,
            timestamp: packet.timestamp.ok_or_else(|| malformed("missing timestamp"))?,
        })
    }

    /// Whether the push is still answerable at unix time `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) >= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_command() {
        let packet = Packet::login("alice", "secret", 40000);
        assert_eq!(
            packet.command().unwrap(),
            Command::Login {
                nickname: "alice".to_string(),
                password: "secret".to_string(),
                udp_port: 40000,
            }
        );
    }

    #[test]
    fn test_login_missing_port_is_malformed() {
        let mut packet = Packet::login("alice", "secret", 40000);
        packet.udp_port = None;

        match packet.command() {
            Err(PacketError::Malformed { operation, .. }) => {
                assert_eq!(operation, Operation::Login)
            }
            other => panic!("Expected malformed login, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_friend_is_malformed() {
        let packet = Packet::add_friend("");
        assert!(matches!(
            packet.command(),
            Err(PacketError::Malformed {
                operation: Operation::AddFriend,
                ..
            })
        ));
    }

    #[test]
    fn test_parameterless_requests() {
        assert_eq!(
            Packet::request(Operation::Logout).command().unwrap(),
            Command::Logout
        );
        assert_eq!(
            Packet::request(Operation::GetFriends).command().unwrap(),
            Command::GetFriends
        );
        assert_eq!(
            Packet::request(Operation::GetScore).command().unwrap(),
            Command::GetScore
        );
        assert_eq!(
            Packet::request(Operation::GetRanking).command().unwrap(),
            Command::GetRanking
        );
    }

    #[test]
    fn test_challenge_answer_and_push_share_opcode() {
        let push = Packet::challenge_push("alice", 5000, 1_700_000_000_000);
        let accept = Packet::challenge_answer("alice", true);
        let discard = Packet::challenge_answer("alice", false);

        assert_eq!(push.operation, Operation::ForwardChallenge);
        assert_eq!(accept.operation, Operation::ForwardChallenge);

        // A push is never a valid client command
        assert!(push.command().is_err());
        assert_eq!(
            accept.command().unwrap(),
            Command::ChallengeAnswer {
                challenger: "alice".to_string(),
                accepted: true
            }
        );
        assert_eq!(
            discard.command().unwrap(),
            Command::ChallengeAnswer {
                challenger: "alice".to_string(),
                accepted: false
            }
        );

        // and an answer is never a valid push
        assert!(ChallengePush::from_packet(&accept).is_err());
        let parsed = ChallengePush::from_packet(&push).unwrap();
        assert_eq!(parsed.challenger, "alice");
        assert_eq!(parsed.to_packet(), push);
    }

    #[test]
    fn test_challenge_answer_with_ok_code_is_malformed() {
        let packet = Packet::ok(Operation::ForwardChallenge).with_friend("alice");
        assert!(packet.command().is_err());
    }

    #[test]
    fn test_match_commands() {
        assert_eq!(Packet::setup_ack().command().unwrap(), Command::SetupAck);
        assert_eq!(
            Packet::word_answer("gatto").command().unwrap(),
            Command::WordAnswer {
                word: "gatto".to_string()
            }
        );
        // The server-side direction of ASK_WORD is not a command
        assert!(Packet::ask_word("cat").command().is_err());
        assert!(Packet::request(Operation::StopChallenge).command().is_err());
    }

    #[test]
    fn test_push_expiry() {
        let push = ChallengePush {
            challenger: "bob".to_string(),
            ttl: 1000,
            timestamp: 10_000,
        };
        assert!(!push.is_expired(10_500));
        assert!(push.is_expired(11_000));
        assert!(!push.is_expired(9_000));
    }

    #[test]
    fn test_response_flags() {
        let request = Packet::request(Operation::GetScore);
        assert!(request.is_request());
        assert!(!request.is_ok());

        let response = Packet::ok(Operation::GetScore).with_score(12);
        assert!(response.is_response());
        assert!(response.is_ok());
        assert!(!Packet::error(Operation::GetScore).is_ok());
    }
}
