use clap::Parser;
use log::{error, info, warn};
use server::config::ServerConfig;
use server::dictionary::WordListDictionary;
use server::network::Server;
use server::storage::{PersistPolicy, UserStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const BUNDLED_WORDS: &str = include_str!("../data/words.json");

/// Main-method of the application.
/// Parses command-line arguments, loads users and words, then runs the server until Ctrl-C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// TCP address clients connect to
        #[clap(short = 'a', long, default_value = "127.0.0.1:4242")]
        addr: SocketAddr,
        /// Local address challenge notifications are sent from
        #[clap(long, default_value = "0.0.0.0:0")]
        udp_addr: SocketAddr,
        /// Maximum number of simultaneous client connections
        #[clap(long, default_value = "1024")]
        max_connections: usize,
        /// How long a challenged friend has to answer, in milliseconds
        #[clap(long, default_value = "5000")]
        request_timeout_ms: u64,
        /// Length of a match, in seconds
        #[clap(short = 'd', long, default_value = "60")]
        duration_secs: u64,
        /// How long a match waits for both players to join, in seconds
        #[clap(long, default_value = "10")]
        setup_timeout_secs: u64,
        /// Words per match
        #[clap(short = 'w', long, default_value = "5")]
        words: usize,
        /// Points for a correct translation
        #[clap(long, default_value = "2")]
        word_bonus: i32,
        /// Points lost for a wrong translation
        #[clap(long, default_value = "1")]
        word_malus: i32,
        /// Extra points for the winner of a match
        #[clap(long, default_value = "3")]
        winner_points: i32,
        /// Users file; users are kept in memory only when omitted
        #[clap(short = 'u', long)]
        users: Option<PathBuf>,
        /// Write the users file on logout instead of after every change
        #[clap(long)]
        persist_on_logout: bool,
        /// Word list file; the bundled list is used when omitted
        #[clap(long)]
        dictionary: Option<PathBuf>,
        /// Accounts to create at startup, as name:password
        #[clap(short = 'r', long = "register")]
        register: Vec<String>,
    }

    env_logger::init();

    // Parse command line arguments
    let args = Args::parse();

    let config = ServerConfig {
        tcp_addr: args.addr,
        udp_addr: args.udp_addr,
        max_connections: args.max_connections,
        challenge_request_timeout: Duration::from_millis(args.request_timeout_ms),
        challenge_duration: Duration::from_secs(args.duration_secs),
        challenge_setup_timeout: Duration::from_secs(args.setup_timeout_secs),
        words_for_challenge: args.words,
        word_bonus: args.word_bonus,
        word_malus: args.word_malus,
        winner_extra_points: args.winner_points,
        users_file: args.users.clone(),
        dictionary_file: args.dictionary.clone(),
        ..ServerConfig::default()
    };

    let policy = if args.persist_on_logout {
        PersistPolicy::OnLogout
    } else {
        PersistPolicy::Immediately
    };
    let users = Arc::new(match &config.users_file {
        Some(path) => UserStore::open(path, policy)?,
        None => UserStore::new(),
    });
    for account in &args.register {
        match account.split_once(':') {
            Some((name, password)) => match users.register(name, password) {
                Ok(()) => info!("Registered user {}", name),
                Err(e) => warn!("Could not register {}: {}", name, e),
            },
            None => warn!("Ignoring --register {}, expected name:password", account),
        }
    }

    let words = match &config.dictionary_file {
        Some(path) => WordListDictionary::load(path)?,
        None => WordListDictionary::from_json(BUNDLED_WORDS)?,
    };
    info!("{} words available for matches", words.len());

    let server = Server::bind(config, users.clone(), Arc::new(words)).await?;
    info!(
        "Challenge notifications sent from {}",
        server.notifier_addr()?
    );

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    if args.users.is_some() {
        users.save()?;
    }

    Ok(())
}
