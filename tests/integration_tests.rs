//! Integration tests for the World Quizzle server
//!
//! These tests run a real server on loopback and drive it through the client
//! library over TCP and UDP.

use client::{ClientError, MatchEvent, QuizzleClient};
use server::config::ServerConfig;
use server::dictionary::WordListDictionary;
use server::network::Server;
use server::storage::{UserDirectory, UserStore};
use shared::{encode, Operation, Packet, ResponseCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        tcp_addr: "127.0.0.1:0".parse().unwrap(),
        udp_addr: "127.0.0.1:0".parse().unwrap(),
        challenge_request_timeout: Duration::from_millis(300),
        challenge_duration: Duration::from_secs(10),
        challenge_setup_timeout: Duration::from_secs(2),
        words_for_challenge: 2,
        match_poll_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    }
}

/// Starts a server with alice, bob and carol (password "pw"); alice and bob
/// are friends.
async fn start_server(config: ServerConfig) -> (SocketAddr, Arc<UserStore>) {
    let store = Arc::new(UserStore::new());
    for name in ["alice", "bob", "carol"] {
        store.register(name, "pw").unwrap();
    }
    store.add_friend("alice", "bob").unwrap();

    let dictionary = WordListDictionary::new(vec![("cat", vec!["gatto"]), ("dog", vec!["cane"])]);
    let server = Server::bind(config, store.clone(), Arc::new(dictionary))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, store)
}

async fn logged_in(addr: SocketAddr, name: &str) -> QuizzleClient {
    let mut client = QuizzleClient::connect(addr).await.unwrap();
    client.login(name, "pw").await.unwrap();
    client
}

fn translate(word: &str) -> &'static str {
    match word {
        "cat" => "gatto",
        "dog" => "cane",
        _ => "?",
    }
}

/// Alice challenges bob and bob accepts. Returns both clients in the setup phase.
async fn accepted_challenge(addr: SocketAddr) -> (QuizzleClient, QuizzleClient) {
    let mut alice = logged_in(addr, "alice").await;
    let mut bob = logged_in(addr, "bob").await;

    let request = tokio::spawn(async move {
        let rules = alice.request_challenge("bob").await;
        (alice, rules)
    });

    let push = bob.next_push(WAIT).await.unwrap();
    assert_eq!(push.challenger, "alice");
    let rules = bob.answer_challenge(&push, true).await.unwrap();
    assert!(rules.unwrap().contains("2 words"));

    let (alice, rules) = request.await.unwrap();
    assert!(rules.unwrap().contains("2 words"));
    (alice, bob)
}

/// Plays until the match ends, answering each word with `answer(word)`.
async fn play(
    mut client: QuizzleClient,
    answer: fn(&str) -> &'static str,
) -> (QuizzleClient, MatchEvent) {
    client.ack_setup().await.unwrap();
    loop {
        match client.next_event(Duration::from_secs(15)).await.unwrap() {
            MatchEvent::Word(word) => client.answer_word(answer(&word)).await.unwrap(),
            end => return (client, end),
        }
    }
}

/// SESSION TESTS
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn login_friends_score_and_ranking() {
        let (addr, store) = start_server(test_config()).await;
        let mut alice = logged_in(addr, "alice").await;

        alice.add_friend("carol").await.unwrap();
        let friends = alice.friends().await.unwrap();
        assert!(friends.contains("bob"));
        assert!(friends.contains("carol"));
        assert_eq!(alice.score().await.unwrap(), 0);

        store.add_score("carol", 10).unwrap();
        let ranking = alice.ranking().await.unwrap();
        assert_eq!(ranking.len(), 3);
        assert_eq!(ranking[0].name, "carol");
        assert_eq!(ranking[0].score, 10);

        alice.logout().await.unwrap();
        assert!(!store.is_online("alice"));
    }

    #[tokio::test]
    async fn requests_before_login_are_refused() {
        let (addr, _store) = start_server(test_config()).await;
        let mut client = QuizzleClient::connect(addr).await.unwrap();

        match client.score().await {
            Err(ClientError::Refused { message, .. }) => assert_eq!(message, "not logged in"),
            other => panic!("Expected a refusal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn second_login_is_refused() {
        let (addr, _store) = start_server(test_config()).await;
        let _alice = logged_in(addr, "alice").await;
        let mut other = QuizzleClient::connect(addr).await.unwrap();

        assert!(matches!(
            other.login("alice", "pw").await,
            Err(ClientError::Refused { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_logs_the_user_out() {
        let (addr, store) = start_server(test_config()).await;
        let alice = logged_in(addr, "alice").await;
        assert!(store.is_online("alice"));
        drop(alice);

        let start = Instant::now();
        while store.is_online("alice") {
            assert!(start.elapsed() < WAIT, "alice still online");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        logged_in(addr, "alice").await;
    }
}

/// MALFORMED INPUT TESTS
mod malformed_tests {
    use super::*;

    #[tokio::test]
    async fn missing_field_gets_an_error_response() {
        let (addr, _store) = start_server(test_config()).await;
        let mut alice = logged_in(addr, "alice").await;

        alice
            .send(&Packet::request(Operation::AddFriend))
            .await
            .unwrap();
        let response = alice.recv_timeout(WAIT).await.unwrap();
        assert_eq!(response.operation, Operation::AddFriend);
        assert_eq!(response.response, Some(ResponseCode::Error));

        // The connection keeps working
        assert_eq!(alice.score().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_json_with_operation_gets_an_error_response() {
        let (addr, _store) = start_server(test_config()).await;
        let mut alice = logged_in(addr, "alice").await;

        let body = br#"{"op":"GET_SCORE","s":"not a number"}"#;
        let mut frame = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        alice.send_raw(&frame).await.unwrap();

        let response = alice.recv_timeout(WAIT).await.unwrap();
        assert_eq!(response.operation, Operation::GetScore);
        assert_eq!(response.response, Some(ResponseCode::Error));
    }

    #[tokio::test]
    async fn impossible_length_closes_the_connection() {
        let (addr, _store) = start_server(test_config()).await;
        let mut client = QuizzleClient::connect(addr).await.unwrap();

        client.send_raw(&2u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            client.recv_timeout(WAIT).await,
            Err(ClientError::Closed) | Err(ClientError::Io(_))
        ));
    }

    #[tokio::test]
    async fn split_frames_are_reassembled() {
        let (addr, _store) = start_server(test_config()).await;
        let mut alice = logged_in(addr, "alice").await;

        let mut bytes = encode(&Packet::request(Operation::GetScore)).unwrap();
        bytes.extend(encode(&Packet::request(Operation::GetFriends)).unwrap());
        for byte in &bytes {
            alice.send_raw(std::slice::from_ref(byte)).await.unwrap();
        }

        let first = alice.recv_timeout(WAIT).await.unwrap();
        let second = alice.recv_timeout(WAIT).await.unwrap();
        assert_eq!(first.operation, Operation::GetScore);
        assert_eq!(second.operation, Operation::GetFriends);
    }
}

/// CHALLENGE TESTS
mod challenge_tests {
    use super::*;

    #[tokio::test]
    async fn full_match_names_the_winner() {
        let (addr, store) = start_server(test_config()).await;
        let (alice, bob) = accepted_challenge(addr).await;

        let alice = tokio::spawn(play(alice, translate));
        let bob = tokio::spawn(play(bob, |_| "wrong"));
        let (mut alice, alice_result) = alice.await.unwrap();
        let (mut bob, bob_result) = bob.await.unwrap();

        // 2 words x 2 points, plus 3 for winning
        assert_eq!(
            alice_result,
            MatchEvent::Finished {
                winner: "alice".to_string(),
                score: 7
            }
        );
        assert_eq!(
            bob_result,
            MatchEvent::Finished {
                winner: "alice".to_string(),
                score: -2
            }
        );

        // Both connections are back on the main loop
        assert_eq!(alice.score().await.unwrap(), 7);
        assert_eq!(bob.score().await.unwrap(), -2);
        assert_eq!(store.score("alice").unwrap(), 7);
    }

    #[tokio::test]
    async fn match_ends_at_the_deadline() {
        let config = ServerConfig {
            challenge_duration: Duration::from_millis(500),
            ..test_config()
        };
        let (addr, _store) = start_server(config).await;
        let (mut alice, mut bob) = accepted_challenge(addr).await;

        alice.ack_setup().await.unwrap();
        bob.ack_setup().await.unwrap();
        assert!(matches!(alice.next_event(WAIT).await.unwrap(), MatchEvent::Word(_)));
        assert!(matches!(bob.next_event(WAIT).await.unwrap(), MatchEvent::Word(_)));

        // Nobody answers; a tie with no completions goes to the challenger
        match alice.next_event(WAIT).await.unwrap() {
            MatchEvent::Finished { winner, score } => {
                assert_eq!(winner, "alice");
                assert_eq!(score, 3);
            }
            other => panic!("Expected the match to finish, got {:?}", other),
        }
        assert!(matches!(
            bob.next_event(WAIT).await.unwrap(),
            MatchEvent::Finished { score: 0, .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_aborts_the_match_quickly() {
        let config = ServerConfig {
            challenge_duration: Duration::from_secs(30),
            ..test_config()
        };
        let (addr, _store) = start_server(config).await;
        let (mut alice, bob) = accepted_challenge(addr).await;

        alice.ack_setup().await.unwrap();
        let start = Instant::now();
        drop(bob);

        let aborted = loop {
            match alice.next_event(WAIT).await.unwrap() {
                MatchEvent::Word(_) => continue,
                MatchEvent::Aborted(message) => break message,
                other => panic!("Expected an abort, got {:?}", other),
            }
        };
        assert!(aborted.starts_with("challenge aborted"));
        assert!(start.elapsed() < Duration::from_secs(3));

        // Alice is back on the main loop with her score untouched
        assert_eq!(alice.score().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (addr, _store) = start_server(test_config()).await;
        let mut alice = logged_in(addr, "alice").await;
        let mut bob = logged_in(addr, "bob").await;

        let start = Instant::now();
        let request = tokio::spawn(async move {
            let result = alice.request_challenge("bob").await;
            (alice, result)
        });
        let stale = bob.next_push(WAIT).await.unwrap();

        let (mut alice, result) = request.await.unwrap();
        match result {
            Err(ClientError::Refused { message, .. }) => assert!(message.contains("did not answer")),
            other => panic!("Expected a timeout refusal, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(300));

        // Answering after the timeout is too late, locally and on the server
        assert!(matches!(
            bob.answer_challenge(&stale, true).await,
            Err(ClientError::Expired { .. })
        ));
        assert!(matches!(
            bob.request(&Packet::challenge_answer("alice", true)).await,
            Err(ClientError::Refused { .. })
        ));

        // A new request is accepted right away, and declined this time
        let request = tokio::spawn(async move { alice.request_challenge("bob").await });
        let push = bob.next_push(WAIT).await.unwrap();
        assert_eq!(push.challenger, "alice");
        assert_eq!(bob.answer_challenge(&push, false).await.unwrap(), None);
        match request.await.unwrap() {
            Err(ClientError::Refused { operation, message }) => {
                assert_eq!(operation, Operation::RequestChallenge);
                assert!(message.contains("declined"));
            }
            other => panic!("Expected a refusal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn challenges_need_an_online_friend() {
        let (addr, _store) = start_server(test_config()).await;
        let mut alice = logged_in(addr, "alice").await;

        let not_online = alice.request_challenge("bob").await;
        let not_friend = alice.request_challenge("carol").await;
        let yourself = alice.request_challenge("alice").await;

        for result in [not_online, not_friend, yourself] {
            assert!(matches!(result, Err(ClientError::Refused { .. })));
        }
    }
}
