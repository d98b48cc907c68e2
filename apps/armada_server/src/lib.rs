pub mod leaderboard;
pub mod outbox;
pub mod registry;
mod ws;

use std::{
	net::{IpAddr, Ipv4Addr, SocketAddr},
	path::PathBuf,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use armada_protocol::LeaderboardEntry;
use axum::{extract::State, routing::get, Json, Router};
use color_eyre::{eyre::Context as _, Result};
use player_store::{PlayerStore, StoreHandle};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{outbox::Outbox, registry::SessionRegistry};

/// The registry as used by the server: each session's sink is its connection's
/// outbox.
pub type Registry = SessionRegistry<Outbox>;

/// How long to wait for the player store to finish outstanding writes on
/// shutdown.
const STORE_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Relay server for the naval prototype: keeps player progress and pushes
/// state to every connected client.
#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
	/// Port to listen on.
	#[arg(long, short, env, default_value = "3000")]
	pub port: u16,
	/// Address to bind to.
	#[arg(long, env, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
	pub bind: IpAddr,
	/// JSON file that player progress is kept in.
	#[arg(long, env, default_value = "playerdata.json")]
	pub db_path: PathBuf,
}

/// State shared by every request handler. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct ServerState {
	registry: Arc<Mutex<Registry>>,
	next_connection: Arc<AtomicU64>,
}

impl ServerState {
	pub fn new(store: StoreHandle) -> Self {
		Self {
			registry: Arc::new(Mutex::new(Registry::new(store))),
			next_connection: Arc::new(AtomicU64::new(0)),
		}
	}

	pub fn registry(&self) -> &Mutex<Registry> {
		&self.registry
	}

	fn next_connection_id(&self) -> u64 {
		self.next_connection.fetch_add(1, Ordering::Relaxed)
	}
}

pub fn router(state: ServerState) -> Router {
	Router::new()
		.route("/", get(root))
		.route("/ws", get(ws::ws_handler))
		.route("/status", get(status))
		.with_state(state)
		.layer(TraceLayer::new_for_http())
}

async fn root() -> &'static str {
	"armada relay server, connect a websocket to /ws"
}

#[derive(Debug, Serialize)]
struct Status {
	online: usize,
	leaderboard: Vec<LeaderboardEntry>,
}

async fn status(State(state): State<ServerState>) -> Json<Status> {
	let registry = state.registry.lock().await;
	Json(Status {
		online: registry.len(),
		leaderboard: registry.leaderboard(),
	})
}

pub async fn main(args: Args) -> Result<()> {
	let (store, store_task) = PlayerStore::spawn(&args.db_path);
	info!("keeping player progress in {}", args.db_path.display());
	let state = ServerState::new(store);

	let sock_addr = SocketAddr::new(args.bind, args.port);
	let listener = tokio::net::TcpListener::bind(sock_addr)
		.await
		.wrap_err_with(|| format!("failed to bind to {sock_addr}"))?;
	info!("listening on {}", listener.local_addr()?);

	axum::serve(listener, router(state.clone()))
		.with_graceful_shutdown(shutdown_signal())
		.await
		.wrap_err("err in http server")?;

	// Dropping every session closes their outboxes. Connections still holding
	// the state keep the store alive, so don't wait on them forever.
	state.registry.lock().await.clear();
	drop(state);
	match tokio::time::timeout(STORE_SHUTDOWN_GRACE, store_task).await {
		Ok(joined) => joined.wrap_err("player store task panicked")?,
		Err(_) => warn!("player store still in use after shutdown, exiting anyway"),
	}
	info!("shut down");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		error!("failed to listen for ctrl-c, shutting down: {err}");
	}
	info!("received shutdown signal");
}
