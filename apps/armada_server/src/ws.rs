//! WebSocket transport. One task per connection reads JSON frames and feeds them
//! to the registry; a second task drains the connection's [`Outbox`] into the
//! socket so a slow client never holds up the registry lock.

use armada_protocol::{Clientbound, RejectReason, Serverbound};
use axum::{
	extract::{
		ws::{Message, WebSocket},
		State, WebSocketUpgrade,
	},
	response::Response,
};
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, trace, warn, Instrument as _};

use crate::{
	outbox::{outbox, Outbox},
	registry::{RegistryError, StateSink as _},
	Registry, ServerState,
};

pub(crate) async fn ws_handler(
	ws: WebSocketUpgrade,
	State(state): State<ServerState>,
) -> Response {
	let id = state.next_connection_id();
	ws.on_upgrade(move |socket| {
		handle_socket(socket, state).instrument(info_span!("connection", id))
	})
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
	info!("client connected");
	let (mut socket_tx, mut socket_rx) = socket.split();
	let (tx, mut rx) = outbox();

	let writer = tokio::spawn(
		async move {
			while let Some(msg) = rx.recv().await {
				if let Err(err) = socket_tx.send(Message::Text(msg.to_json())).await {
					debug!("failed to write to socket: {err}");
					break;
				}
			}
		}
		.in_current_span(),
	);

	let mut conn = Connection::new(tx);
	while let Some(frame) = socket_rx.next().await {
		let text = match frame {
			Ok(Message::Text(text)) => text,
			Ok(Message::Close(_)) => break,
			Ok(_) => {
				trace!("ignoring non-text frame");
				continue;
			}
			Err(err) => {
				debug!("error while receiving frame: {err}");
				break;
			}
		};
		match Serverbound::from_json(&text) {
			Ok(msg) => conn.dispatch(&state.registry, msg).await,
			Err(err) => debug!("ignoring {text:?}: {err}"),
		}
	}

	conn.disconnect(&state.registry).await;
	writer.abort();
	info!("client disconnected");
}

/// Per-connection state: who this connection joined as, and where to send its
/// messages.
#[derive(Debug)]
pub(crate) struct Connection {
	identity: Option<String>,
	tx: Outbox,
}

impl Connection {
	pub(crate) fn new(tx: Outbox) -> Self {
		Self { identity: None, tx }
	}

	/// Applies one client message. Refused `join`s and purchases are answered
	/// with [`Clientbound::Rejected`]; everything else that fails is logged and
	/// dropped.
	pub(crate) async fn dispatch(&mut self, registry: &Mutex<Registry>, msg: Serverbound) {
		let mut registry = registry.lock().await;
		let joined_as = self.identity.clone();
		let result = match (msg, joined_as.as_deref()) {
			(Serverbound::Join { .. }, Some(identity)) => {
				debug!("{identity:?} tried to join twice");
				self.reject(RejectReason::AlreadyJoined);
				return;
			}
			(Serverbound::Join { username }, None) => registry
				.join(&username, self.tx.clone())
				.await
				.map(|record| self.identity = Some(record.username)),
			(msg, None) => {
				debug!("ignoring {msg:?} before join");
				return;
			}
			(Serverbound::Move { x, z }, Some(identity)) => {
				registry.move_to(identity, x, z).await.map(drop)
			}
			(Serverbound::Attack { weapon, .. }, Some(identity)) => {
				trace!("{identity:?} attacked with {weapon:?}");
				registry.record_hit(identity).await.map(drop)
			}
			(Serverbound::BuyShip { ship, .. }, Some(identity)) => {
				registry.purchase_ship(identity, &ship).await.map(drop)
			}
		};
		if let Err(err) = result {
			self.handle_err(err);
		}
	}

	/// Removes this connection's session, if it ever joined.
	pub(crate) async fn disconnect(&mut self, registry: &Mutex<Registry>) {
		let Some(identity) = self.identity.take() else {
			return;
		};
		if let Err(err) = registry.lock().await.leave(&identity) {
			debug!("session already gone: {err}");
		}
	}

	fn handle_err(&self, err: RegistryError) {
		match (&err, err.reject_reason()) {
			(RegistryError::Store(_), Some(reason)) => {
				warn!("request failed: {err}");
				self.reject(reason);
			}
			(_, Some(reason)) => {
				debug!("rejected: {err}");
				self.reject(reason);
			}
			(_, None) => debug!("ignored: {err}"),
		}
	}

	fn reject(&self, reason: RejectReason) {
		// Fails only once the writer is gone, at which point nobody is listening.
		let _ = self.tx.send(Clientbound::Rejected { reason });
	}
}
