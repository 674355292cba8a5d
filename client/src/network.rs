use log::{debug, info};
use shared::{
    decode_frame, ChallengePush, Operation, Packet, PacketBuffer, PacketError, RankingEntry,
};
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio::time::timeout;

const READ_CHUNK: usize = 512;
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network failure: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("server closed the connection")]
    Closed,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("expected a {expected:?} response, got {actual:?}")]
    UnexpectedResponse {
        expected: Operation,
        actual: Operation,
    },
    /// The server answered with an error code; carries its `info` text.
    #[error("server refused {operation:?}: {message}")]
    Refused {
        operation: Operation,
        message: String,
    },
    #[error("the challenge from {challenger} has expired")]
    Expired { challenger: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    Word(String),
    /// Winner's nickname and this player's match score.
    Finished { winner: String, score: i32 },
    Aborted(String),
}

/// A player's session: the TCP request channel plus the UDP socket the
/// server pushes challenge requests to.
pub struct QuizzleClient {
    stream: TcpStream,
    buffer: PacketBuffer,
    push_socket: UdpSocket,
}

impl QuizzleClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let push_socket = UdpSocket::bind("127.0.0.1:0").await?;
        info!(
            "Connected to {} (pushes on {})",
            stream.peer_addr()?,
            push_socket.local_addr()?
        );
        Ok(Self {
            stream,
            buffer: PacketBuffer::new(),
            push_socket,
        })
    }

    pub fn udp_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.push_socket.local_addr()?)
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        debug!("-> {:?}", packet);
        let frame = shared::encode(packet)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Writes raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Next packet from the server.
    pub async fn recv(&mut self) -> Result<Packet, ClientError> {
        // A previous read may already hold the next frame.
        if self.buffer.add_chunk(&[])? {
            return self.take_packet();
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            if self.buffer.add_chunk(&chunk[..n])? {
                return self.take_packet();
            }
        }
    }

    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<Packet, ClientError> {
        timeout(limit, self.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    fn take_packet(&mut self) -> Result<Packet, ClientError> {
        let packet = self.buffer.build_packet()?;
        debug!("<- {:?}", packet);
        Ok(packet)
    }

    /// Sends `packet` and waits for the matching successful response.
    pub async fn request(&mut self, packet: &Packet) -> Result<Packet, ClientError> {
        let operation = packet.operation;
        self.send(packet).await?;
        let response = self.recv().await?;
        expect_ok(operation, response)
    }

    pub async fn login(&mut self, nickname: &str, password: &str) -> Result<(), ClientError> {
        let port = self.udp_addr()?.port();
        self.request(&Packet::login(nickname, password, port)).await?;
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<(), ClientError> {
        self.request(&Packet::request(Operation::Logout)).await?;
        Ok(())
    }

    pub async fn add_friend(&mut self, friend: &str) -> Result<(), ClientError> {
        self.request(&Packet::add_friend(friend)).await?;
        Ok(())
    }

    pub async fn friends(&mut self) -> Result<BTreeSet<String>, ClientError> {
        let response = self.request(&Packet::request(Operation::GetFriends)).await?;
        Ok(response.friends.unwrap_or_default())
    }

    pub async fn score(&mut self) -> Result<i32, ClientError> {
        let response = self.request(&Packet::request(Operation::GetScore)).await?;
        Ok(response.score.unwrap_or_default())
    }

    pub async fn ranking(&mut self) -> Result<Vec<RankingEntry>, ClientError> {
        let response = self.request(&Packet::request(Operation::GetRanking)).await?;
        Ok(response.ranking.unwrap_or_default())
    }

    /// Challenges `friend` and waits until they answer or the request
    /// expires. Returns the rules text on acceptance.
    pub async fn request_challenge(&mut self, friend: &str) -> Result<String, ClientError> {
        self.send(&Packet::request_challenge(friend)).await?;
        let response = self.recv().await?;
        if response.operation == Operation::SetupChallenge {
            let setup = expect_ok(Operation::SetupChallenge, response)?;
            return Ok(setup.message.unwrap_or_default());
        }
        // Anything but a setup is a refusal: declined, timed out or not allowed.
        let response = expect_ok(Operation::RequestChallenge, response)?;
        Err(ClientError::UnexpectedResponse {
            expected: Operation::SetupChallenge,
            actual: response.operation,
        })
    }

    /// Answers a pushed challenge. Accepting returns the rules text.
    ///
    /// A push whose ttl has run out is refused without contacting the server.
    pub async fn answer_challenge(
        &mut self,
        push: &ChallengePush,
        accepted: bool,
    ) -> Result<Option<String>, ClientError> {
        if push.is_expired(now_ms()) {
            return Err(ClientError::Expired {
                challenger: push.challenger.clone(),
            });
        }
        self.send(&Packet::challenge_answer(&push.challenger, accepted))
            .await?;
        let response = self.recv().await?;
        let expected = if accepted {
            Operation::SetupChallenge
        } else {
            Operation::ForwardChallenge
        };
        let response = expect_ok(expected, response)?;
        Ok(accepted.then(|| response.message.unwrap_or_default()))
    }

    /// Tells the server this player is ready; the first word follows as a
    /// [`MatchEvent::Word`].
    pub async fn ack_setup(&mut self) -> Result<(), ClientError> {
        self.send(&Packet::setup_ack()).await
    }

    pub async fn answer_word(&mut self, translation: &str) -> Result<(), ClientError> {
        self.send(&Packet::word_answer(translation)).await
    }

    /// Next word or the end of the match.
    pub async fn next_event(&mut self, limit: Duration) -> Result<MatchEvent, ClientError> {
        let packet = self.recv_timeout(limit).await?;
        match packet.operation {
            Operation::AskWord => match packet.word {
                Some(word) => Ok(MatchEvent::Word(word)),
                None => Err(PacketError::Malformed {
                    operation: Operation::AskWord,
                    reason: "missing word",
                }
                .into()),
            },
            Operation::StopChallenge if packet.is_ok() => Ok(MatchEvent::Finished {
                winner: packet.message.unwrap_or_default(),
                score: packet.score.unwrap_or_default(),
            }),
            Operation::StopChallenge => {
                Ok(MatchEvent::Aborted(packet.message.unwrap_or_default()))
            }
            actual => Err(ClientError::UnexpectedResponse {
                expected: Operation::AskWord,
                actual,
            }),
        }
    }

    /// Waits for a challenge notification on the UDP socket.
    pub async fn next_push(&self, limit: Duration) -> Result<ChallengePush, ClientError> {
        let mut datagram = [0u8; MAX_DATAGRAM];
        let (n, from) = timeout(limit, self.push_socket.recv_from(&mut datagram))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let push = ChallengePush::from_packet(&decode_frame(&datagram[..n])?)?;
        info!("{} challenged us (via {})", push.challenger, from);
        Ok(push)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

fn expect_ok(expected: Operation, response: Packet) -> Result<Packet, ClientError> {
    // Errors come back under whichever operation failed, so check the code first
    if response.is_response() && !response.is_ok() {
        return Err(ClientError::Refused {
            operation: response.operation,
            message: response.message.unwrap_or_default(),
        });
    }
    if response.operation != expected || !response.is_ok() {
        return Err(ClientError::UnexpectedResponse {
            expected,
            actual: response.operation,
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ResponseCode;
    use tokio::net::TcpListener;

    async fn pair() -> (QuizzleClient, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(QuizzleClient::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_recv_reassembles_split_frames() {
        let (mut client, mut server) = pair().await;
        let mut bytes = shared::encode(&Packet::ok(Operation::GetScore).with_score(7)).unwrap();
        bytes.extend(shared::encode(&Packet::ok(Operation::Logout)).unwrap());

        server.write_all(&bytes[..3]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(&bytes[3..]).await.unwrap();

        assert_eq!(client.recv().await.unwrap().score, Some(7));
        assert_eq!(client.recv().await.unwrap().operation, Operation::Logout);
    }

    #[tokio::test]
    async fn test_error_response_is_refused() {
        let (mut client, mut server) = pair().await;
        let reply = shared::encode(
            &Packet::error(Operation::AddFriend).with_message("carol is already your friend"),
        )
        .unwrap();
        server.write_all(&reply).await.unwrap();

        match client.add_friend("carol").await {
            Err(ClientError::Refused { operation, message }) => {
                assert_eq!(operation, Operation::AddFriend);
                assert_eq!(message, "carol is already your friend");
            }
            other => panic!("Expected Refused, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (mut client, server) = pair().await;
        drop(server);
        assert!(matches!(client.recv().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_push_is_decoded() {
        let (client, _server) = pair().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let push = shared::encode(&Packet::challenge_push("alice", 5000, 1_700_000_000_000)).unwrap();
        sender
            .send_to(&push, client.udp_addr().unwrap())
            .await
            .unwrap();

        let push = client.next_push(Duration::from_secs(1)).await.unwrap();
        assert_eq!(push.challenger, "alice");
        assert_eq!(push.ttl, 5000);
    }

    #[tokio::test]
    async fn test_match_events() {
        let (mut client, mut server) = pair().await;
        let mut bytes = shared::encode(&Packet::ask_word("cat")).unwrap();
        bytes.extend(
            shared::encode(
                &Packet::ok(Operation::StopChallenge)
                    .with_message("alice")
                    .with_score(5),
            )
            .unwrap(),
        );
        server.write_all(&bytes).await.unwrap();

        let limit = Duration::from_secs(1);
        assert_eq!(
            client.next_event(limit).await.unwrap(),
            MatchEvent::Word("cat".to_string())
        );
        assert_eq!(
            client.next_event(limit).await.unwrap(),
            MatchEvent::Finished {
                winner: "alice".to_string(),
                score: 5
            }
        );
        assert!(matches!(
            client.next_event(Duration::from_millis(50)).await,
            Err(ClientError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_expired_push_refused_locally() {
        let (mut client, mut server) = pair().await;
        let push = ChallengePush {
            challenger: "alice".to_string(),
            ttl: 1000,
            timestamp: now_ms() - 5000,
        };

        match client.answer_challenge(&push, true).await {
            Err(ClientError::Expired { challenger }) => assert_eq!(challenger, "alice"),
            other => panic!("Expected Expired, got {:?}", other),
        }

        // Nothing reached the server
        drop(client);
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_live_push_is_answered() {
        let (mut client, mut server) = pair().await;
        let push = ChallengePush {
            challenger: "alice".to_string(),
            ttl: 60_000,
            timestamp: now_ms(),
        };
        let reply = shared::encode(&Packet::ok(Operation::ForwardChallenge)).unwrap();
        server.write_all(&reply).await.unwrap();

        assert_eq!(client.answer_challenge(&push, false).await.unwrap(), None);

        let expected = shared::encode(&Packet::challenge_answer("alice", false)).unwrap();
        let mut sent = vec![0u8; expected.len()];
        server.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_discard_is_not_ok() {
        let refusal = Packet::response(Operation::RequestChallenge, ResponseCode::Discard)
            .with_message("bob declined the challenge");
        assert!(matches!(
            expect_ok(Operation::RequestChallenge, refusal),
            Err(ClientError::Refused { .. })
        ));
    }
}
