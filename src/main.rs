//! # sente — a Go (igo) game server
//!
//! sente is the backend for a two-player networked Go implementation.
//! Clients connect over WebSocket and exchange JSON messages to create
//! games, join by 10-character player keys, place stones, mark dead stones
//! during scoring, request takebacks, and chat.
//!
//! Any number of server processes may run behind a load balancer: game
//! state lives exclusively in a shared PostgreSQL database, which doubles
//! as the pub/sub transport (LISTEN/NOTIFY) carrying change notifications
//! between processes. Writes are optimistic, guarded by a per-game version
//! counter; concurrent writers resolve to exactly one winner.
//!
//! ## Usage
//!
//! ```bash
//! # Start a server process (requires DATABASE_URL)
//! sente serve --port 8080
//!
//! # Reclaim keys orphaned by a crashed process
//! sente cleanup --manager-id <64-char id>
//! ```
//!
//! ## Environment
//!
//! | Variable       | Meaning                                   |
//! |----------------|-------------------------------------------|
//! | `DATABASE_URL` | libpq-style connection URI (required)     |
//! | `PORT`         | listen port (default 8080; flag wins)     |
//! | `RUST_LOG`     | log filter (default `info`)               |

mod board;
mod game;
mod keys;
mod store;
mod types;
mod ws;

use actix::Actor;
use actix_web::{middleware, web, App, HttpServer};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::store::Store;
use crate::ws::ManagerId;

/// sente — Go game server backed by PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "sente")]
#[command(about = "Go (igo) game server backed by PostgreSQL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the WebSocket server.
    Serve {
        /// Port to listen on. Falls back to $PORT, then 8080.
        #[arg(short, long)]
        port: Option<u16>,

        /// Host address to bind to.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },

    /// Release every key held by a dead server process and tell the
    /// affected clients to refresh.
    Cleanup {
        /// The 64-character manager id of the process to reclaim.
        #[arg(long)]
        manager_id: String,
    },
}

fn invalid_input(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| invalid_input("DATABASE_URL must be set"))?;

    match cli.command {
        Commands::Serve { port, host } => run_server(&database_url, &host, port).await,
        Commands::Cleanup { manager_id } => run_cleanup(&database_url, &manager_id).await,
    }
}

/// Starts one server process: migrations, notification pump, router actor,
/// and the HTTP server exposing `/ws`.
async fn run_server(database_url: &str, host: &str, port_flag: Option<u16>) -> std::io::Result<()> {
    let port = match port_flag {
        Some(port) => port,
        None => match std::env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| invalid_input("PORT is not a valid port number"))?,
            Err(_) => 8080,
        },
    };

    // Store unavailability at startup is fatal (non-zero exit).
    let store = Store::connect(database_url)
        .await
        .map_err(std::io::Error::other)?;
    store.run_migrations().await.map_err(std::io::Error::other)?;

    let manager_id = keys::generate_manager_id();
    log::info!("manager id: {}", manager_id);

    let (listen_tx, listen_rx) = mpsc::unbounded_channel();
    let router = ws::Router::new(listen_tx).start();
    actix_web::rt::spawn(ws::run_listener(store.clone(), listen_rx, router.clone()));

    log::info!("Starting sente server on {}:{}", host, port);
    log::info!("WebSocket endpoint: ws://{}:{}/ws", host, port);

    let app_store = store.clone();
    let app_manager_id = manager_id.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(web::Data::new(app_store.clone()))
            .app_data(web::Data::new(router.clone()))
            .app_data(web::Data::new(ManagerId(app_manager_id.clone())))
            .route("/ws", web::get().to(ws::ws_connect))
    })
    .bind((host, port))?
    .run()
    .await;

    // Release every key this process still holds so the games stay
    // joinable; a crash skips this and `sente cleanup` picks up the tab.
    match store.cleanup(&manager_id).await {
        Ok(released) => log::info!("released {} key(s) on shutdown", released),
        Err(e) => log::error!("shutdown cleanup failed: {}", e),
    }

    result
}

/// Operator reclaim of keys orphaned by a crashed process.
async fn run_cleanup(database_url: &str, manager_id: &str) -> std::io::Result<()> {
    if !keys::is_valid_manager_id(manager_id) {
        return Err(invalid_input("manager id must be 64 alphanumeric characters"));
    }

    let store = Store::connect(database_url)
        .await
        .map_err(std::io::Error::other)?;

    let released = store
        .cleanup(manager_id)
        .await
        .map_err(std::io::Error::other)?;
    log::info!("released {} key(s) held by {}", released, manager_id);

    // Prompt every connected client to re-read state.
    store
        .trigger_update_all()
        .await
        .map_err(std::io::Error::other)?;

    Ok(())
}
