//! Per-connection outbox.
//!
//! A snapshot always supersedes the one before it, so state goes through a
//! [`watch`] channel that only ever holds the latest. A client that stops
//! reading therefore costs one snapshot, however much the others play.
//! Rejections are answers to a specific request and can't be merged, so they
//! get a small bounded queue and are dropped once it is full.

use armada_protocol::{Clientbound, RejectReason, StateSnapshot};
use tokio::sync::{
	mpsc::{self, error::TrySendError},
	watch,
};
use tracing::debug;

use crate::registry::{SinkClosed, StateSink};

/// Rejections that may wait for a client before further ones are dropped.
pub const REJECTION_BUFFER: usize = 8;

/// Sending half, held by the registry and the connection. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Outbox {
	state: watch::Sender<Option<StateSnapshot>>,
	rejections: mpsc::Sender<RejectReason>,
}

/// Receiving half, drained by the connection's writer task.
#[derive(Debug)]
pub struct OutboxRx {
	state: watch::Receiver<Option<StateSnapshot>>,
	rejections: mpsc::Receiver<RejectReason>,
}

pub fn outbox() -> (Outbox, OutboxRx) {
	let (state_tx, state_rx) = watch::channel(None);
	let (rejections_tx, rejections_rx) = mpsc::channel(REJECTION_BUFFER);
	(
		Outbox {
			state: state_tx,
			rejections: rejections_tx,
		},
		OutboxRx {
			state: state_rx,
			rejections: rejections_rx,
		},
	)
}

impl StateSink for Outbox {
	fn send(&self, msg: Clientbound) -> Result<(), SinkClosed> {
		match msg {
			Clientbound::State(snapshot) => {
				self.state.send(Some(snapshot)).map_err(|_| SinkClosed)
			}
			Clientbound::Rejected { reason } => {
				match self.rejections.try_send(reason) {
					Ok(()) => Ok(()),
					Err(TrySendError::Full(reason)) => {
						debug!("client is not reading, dropping rejection {reason:?}");
						Ok(())
					}
					Err(TrySendError::Closed(_)) => Err(SinkClosed),
				}
			}
		}
	}
}

impl OutboxRx {
	/// Waits for the next message. Pending rejections go first, and only the
	/// latest unsent snapshot is ever returned. `None` once every [`Outbox`] has
	/// been dropped.
	pub async fn recv(&mut self) -> Option<Clientbound> {
		loop {
			tokio::select! {
				biased;
				Some(reason) = self.rejections.recv() => {
					return Some(Clientbound::Rejected { reason });
				}
				changed = self.state.changed() => {
					if changed.is_err() {
						return None;
					}
					if let Some(snapshot) = self.state.borrow_and_update().clone() {
						return Some(Clientbound::State(snapshot));
					}
				}
			}
		}
	}

	/// Everything that is ready right now, without waiting.
	#[cfg(test)]
	pub(crate) fn drain(&mut self) -> Vec<Clientbound> {
		let mut msgs: Vec<_> = std::iter::from_fn(|| self.rejections.try_recv().ok())
			.map(|reason| Clientbound::Rejected { reason })
			.collect();
		if self.state.has_changed().unwrap_or(false) {
			if let Some(snapshot) = self.state.borrow_and_update().clone() {
				msgs.push(Clientbound::State(snapshot));
			}
		}
		msgs
	}
}
