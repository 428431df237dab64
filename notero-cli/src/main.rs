//! notero: terminal board and relay for collaborative note voting.
//!
//! `notero serve` runs the relay; `notero join` opens a board and reads
//! commands from stdin, reprinting the board whenever it changes.

mod repl;

use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use notero_collab::{BoardSession, ServerConfig, SessionConfig, SyncServer};
use notero_core::{FileSessionStore, IdentityManager};
use repl::Command;

#[derive(Parser)]
#[command(name = "notero")]
#[command(about = "Collaborative sticky-note voting board", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "NOTERO_BIND", default_value = "127.0.0.1:9090")]
        bind: String,

        /// Maximum participants per board
        #[arg(long, env = "NOTERO_MAX_PEERS", default_value_t = 100)]
        max_peers: usize,
    },

    /// Join a board
    Join {
        /// Relay URL
        #[arg(short, long, env = "NOTERO_SERVER", default_value = "ws://127.0.0.1:9090")]
        server: String,

        /// Board id shared by all participants
        #[arg(short, long, env = "NOTERO_BOARD")]
        board: Uuid,

        /// Where this participant's identity is remembered
        #[arg(long, env = "NOTERO_SESSION_FILE", default_value = "notero-session.json")]
        session_file: PathBuf,

        /// Name shown to other peers on the relay
        #[arg(short, long, env = "NOTERO_NAME", default_value = "terminal")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, max_peers } => {
            let server = SyncServer::new(ServerConfig {
                bind_addr: bind,
                max_peers_per_room: max_peers,
                ..ServerConfig::default()
            });
            server.run().await
        }
        Commands::Join {
            server,
            board,
            session_file,
            name,
        } => {
            let config = SessionConfig {
                server_url: server,
                board_id: board,
                peer_name: name,
                ..SessionConfig::default()
            };
            join(config, session_file).await
        }
    }
}

async fn join(config: SessionConfig, session_file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut identity = IdentityManager::new(FileSessionStore::open(&session_file)?);
    info!("Joining board {} via {}", config.board_id, config.server_url);
    let session = BoardSession::open(config, &mut identity).await?;
    let engine = session.engine().clone();

    println!("You are {}. Type `help` for commands.", engine.current_user().name);
    print!("{}", repl::render_board(&repl::ordered(engine.aggregated_board())));

    let watcher = engine.clone();
    let _reprint = session.notifier().subscribe(move |_| {
        print!("{}", repl::render_board(&repl::ordered(watcher.aggregated_board())));
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match repl::parse(&line) {
            Ok(Command::Note(text)) => engine.create_note(&text),
            Ok(Command::Vote(n)) => {
                let board = repl::ordered(engine.aggregated_board());
                match board.get(n - 1) {
                    Some(entry) => engine.toggle_vote(&entry.note),
                    None => eprintln!("no note #{n}"),
                }
            }
            Ok(Command::Board) => {
                print!("{}", repl::render_board(&repl::ordered(engine.aggregated_board())))
            }
            Ok(Command::Users) => {
                print!("{}", repl::render_users(&engine.list_users(), engine.current_user()))
            }
            Ok(Command::WhoAmI) => {
                let me = engine.current_user();
                println!("{} ({})", me.name, me.id);
            }
            Ok(Command::Help) => println!("{}", repl::HELP),
            Ok(Command::Quit) => break,
            Err(e) => eprintln!("{e}"),
        }
    }

    let pending = session.unacknowledged().await;
    if pending > 0 {
        log::warn!("Leaving with {pending} unacknowledged writes");
    }
    session.close().await;
    Ok(())
}
