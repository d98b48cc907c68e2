//! The table of connected players.
//!
//! Every mutation goes through [`SessionRegistry`]: it is persisted through the
//! player store first, then applied in memory, then a full state snapshot is
//! pushed to every connected session. Pushing everything to everyone is
//! quadratic in the number of players, which is fine for the handful of players
//! a single instance hosts.

use std::collections::HashMap;

use armada_protocol::{
	Clientbound, LeaderboardEntry, PlayerPosition, RejectReason, StateSnapshot,
};
use player_store::{PlayerRecord, StoreError, StoreHandle};
use tracing::{debug, info};

use crate::leaderboard;

/// Gold it costs to buy a ship.
pub const SHIP_PRICE: u64 = 100;

/// Longest username we accept, in characters.
pub const MAX_IDENTITY_LEN: usize = 32;

/// Longest ship name we accept, in characters.
pub const MAX_SHIP_NAME_LEN: usize = 32;

/// Where state snapshots for a single client go.
pub trait StateSink: Send + Sync + 'static {
	fn send(&self, msg: Clientbound) -> Result<(), SinkClosed>;
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
#[error("client is no longer receiving messages")]
pub struct SinkClosed;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
	#[error("{0:?} has not joined")]
	NotJoined(String),
	#[error("{0:?} is already connected")]
	IdentityInUse(String),
	#[error("username must be 1 to {MAX_IDENTITY_LEN} characters")]
	InvalidIdentity,
	#[error("ship name must be 1 to {MAX_SHIP_NAME_LEN} characters")]
	InvalidShip,
	#[error("already owns {0:?}")]
	AlreadyOwnsShip(String),
	#[error("a ship costs {SHIP_PRICE} gold but only {gold} is available")]
	InsufficientGold { gold: u64 },
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl RegistryError {
	/// What to tell the client that caused this error, if anything. Requests
	/// from connections that never joined are dropped without a reply.
	pub fn reject_reason(&self) -> Option<RejectReason> {
		match self {
			Self::NotJoined(_) => None,
			Self::IdentityInUse(_) => Some(RejectReason::IdentityInUse),
			Self::InvalidIdentity => Some(RejectReason::InvalidIdentity),
			Self::InvalidShip => Some(RejectReason::InvalidShip),
			Self::AlreadyOwnsShip(_) => Some(RejectReason::AlreadyOwnsShip),
			Self::InsufficientGold { .. } => Some(RejectReason::InsufficientGold),
			Self::Store(_) => Some(RejectReason::StorageUnavailable),
		}
	}
}

type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug)]
struct Session<S> {
	record: PlayerRecord,
	sink: S,
	/// Position in join order. Used to keep broadcasts and leaderboard ties
	/// stable.
	seq: u64,
}

/// Connected identities and their last-known state.
#[derive(Debug)]
pub struct SessionRegistry<S> {
	store: StoreHandle,
	sessions: HashMap<String, Session<S>>,
	next_seq: u64,
}

impl<S: StateSink> SessionRegistry<S> {
	pub fn new(store: StoreHandle) -> Self {
		Self {
			store,
			sessions: HashMap::new(),
			next_seq: 0,
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	pub fn contains(&self, identity: &str) -> bool {
		self.sessions.contains_key(identity)
	}

	/// Registers a session for `identity`, loading its record or creating and
	/// persisting a fresh one. Surrounding whitespace is not part of the
	/// identity, so the record's `username` is the key actually used.
	///
	/// An identity can only be connected once; later joins are rejected until
	/// the first session leaves.
	pub async fn join(&mut self, identity: &str, sink: S) -> Result<PlayerRecord> {
		let identity = identity.trim();
		if identity.is_empty() || identity.chars().count() > MAX_IDENTITY_LEN {
			return Err(RegistryError::InvalidIdentity);
		}
		if self.sessions.contains_key(identity) {
			return Err(RegistryError::IdentityInUse(identity.to_owned()));
		}
		let record = match self.store.load(identity).await? {
			Some(record) => record,
			None => {
				let record = PlayerRecord::new(identity);
				self.store.save(record.clone()).await?;
				info!("created player {identity:?}");
				record
			}
		};

		let seq = self.next_seq;
		self.next_seq += 1;
		self.sessions.insert(
			identity.to_owned(),
			Session {
				record: record.clone(),
				sink,
				seq,
			},
		);
		info!("{identity:?} joined, {} online", self.sessions.len());
		self.broadcast_state();
		Ok(record)
	}

	/// Moves `identity` to `(x, z)`. Positions are taken as reported.
	pub async fn move_to(&mut self, identity: &str, x: f64, z: f64) -> Result<PlayerRecord> {
		self.commit(identity, |record| {
			record.x = x;
			record.z = z;
			Ok(())
		})
		.await
	}

	/// Every attack counts as a kill, whether or not it hit anything.
	pub async fn record_hit(&mut self, identity: &str) -> Result<PlayerRecord> {
		self.commit(identity, |record| {
			record.kills = record.kills.saturating_add(1);
			Ok(())
		})
		.await
	}

	/// Buys `ship` for [`SHIP_PRICE`] gold. Only possible without a ship. The
	/// name is trimmed and must not be empty, since an empty name is how a
	/// record without a ship is stored.
	pub async fn purchase_ship(
		&mut self,
		identity: &str,
		ship: &str,
	) -> Result<PlayerRecord> {
		let ship = ship.trim();
		self.commit(identity, |record| {
			if ship.is_empty() || ship.chars().count() > MAX_SHIP_NAME_LEN {
				return Err(RegistryError::InvalidShip);
			}
			if let Some(owned) = &record.ship {
				return Err(RegistryError::AlreadyOwnsShip(owned.clone()));
			}
			record.gold = record
				.gold
				.checked_sub(SHIP_PRICE)
				.ok_or(RegistryError::InsufficientGold { gold: record.gold })?;
			record.ship = Some(ship.to_owned());
			Ok(())
		})
		.await
	}

	/// Drops the session for `identity`. Its durable record stays as it is.
	pub fn leave(&mut self, identity: &str) -> Result<PlayerRecord> {
		let session = self
			.sessions
			.remove(identity)
			.ok_or_else(|| RegistryError::NotJoined(identity.to_owned()))?;
		info!("{identity:?} left, {} online", self.sessions.len());
		self.broadcast_state();
		Ok(session.record)
	}

	/// Drops every session without broadcasting. Used on shutdown.
	pub fn clear(&mut self) {
		self.sessions.clear();
	}

	/// Applies `mutate` to a copy of the record, persists it, and only then
	/// makes it visible in memory and broadcasts. On any error nothing changes.
	async fn commit(
		&mut self,
		identity: &str,
		mutate: impl FnOnce(&mut PlayerRecord) -> Result<()>,
	) -> Result<PlayerRecord> {
		let session = self
			.sessions
			.get(identity)
			.ok_or_else(|| RegistryError::NotJoined(identity.to_owned()))?;
		let mut record = session.record.clone();
		mutate(&mut record)?;
		self.store.save(record.clone()).await?;
		if let Some(session) = self.sessions.get_mut(identity) {
			session.record = record.clone();
		}
		self.broadcast_state();
		Ok(record)
	}

	/// Sessions in join order.
	fn ordered(&self) -> Vec<&Session<S>> {
		let mut sessions: Vec<_> = self.sessions.values().collect();
		sessions.sort_by_key(|s| s.seq);
		sessions
	}

	/// Top players among those currently connected.
	pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
		leaderboard::rank(self.ordered().into_iter().map(|s| LeaderboardEntry {
			username: s.record.username.clone(),
			kills: s.record.kills,
		}))
	}

	fn positions(&self) -> Vec<PlayerPosition> {
		self.ordered()
			.into_iter()
			.map(|s| PlayerPosition {
				username: s.record.username.clone(),
				x: s.record.x,
				z: s.record.z,
			})
			.collect()
	}

	fn snapshot(
		record: &PlayerRecord,
		leaderboard: &[LeaderboardEntry],
		players: &[PlayerPosition],
	) -> StateSnapshot {
		StateSnapshot {
			leaderboard: leaderboard.to_vec(),
			gold: record.gold,
			kills: record.kills,
			ship: record.ship.clone(),
			players: players.to_vec(),
		}
	}

	/// The snapshot `identity` would receive in the next broadcast.
	pub fn snapshot_for(&self, identity: &str) -> Option<StateSnapshot> {
		let session = self.sessions.get(identity)?;
		Some(Self::snapshot(
			&session.record,
			&self.leaderboard(),
			&self.positions(),
		))
	}

	/// Sends every session its own snapshot. A closed sink is skipped; its
	/// connection removes the session when it notices the disconnect.
	pub fn broadcast_state(&self) {
		let leaderboard = self.leaderboard();
		let players = self.positions();
		for session in self.ordered() {
			let msg = Clientbound::State(Self::snapshot(
				&session.record,
				&leaderboard,
				&players,
			));
			if let Err(err) = session.sink.send(msg) {
				debug!("skipping {:?}: {err}", session.record.username);
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use player_store::PlayerStore;

	use crate::outbox::{outbox, Outbox, OutboxRx};

	type Registry = SessionRegistry<Outbox>;

	struct Harness {
		registry: Registry,
		store: StoreHandle,
		_dir: tempfile::TempDir,
	}

	fn harness() -> Harness {
		let dir = tempfile::tempdir().unwrap();
		let (store, _join) = PlayerStore::spawn(dir.path().join("playerdata.json"));
		Harness {
			registry: SessionRegistry::new(store.clone()),
			store,
			_dir: dir,
		}
	}

	fn client() -> (Outbox, OutboxRx) {
		outbox()
	}

	/// The most recent state pushed to `rx` since it was last checked, if any.
	fn latest_state(rx: &mut OutboxRx) -> Option<StateSnapshot> {
		rx.drain().into_iter().rev().find_map(|msg| match msg {
			Clientbound::State(state) => Some(state),
			Clientbound::Rejected { .. } => None,
		})
	}

	fn usernames(state: &StateSnapshot) -> Vec<&str> {
		state.players.iter().map(|p| p.username.as_str()).collect()
	}

	#[tokio::test]
	async fn test_new_player_gets_persisted_default_record() {
		let mut h = harness();
		let (tx, mut rx) = client();
		let record = h.registry.join("alice", tx).await.unwrap();
		assert_eq!(record, PlayerRecord::new("alice"));
		assert_eq!(
			h.store.load("alice").await.unwrap(),
			Some(PlayerRecord::new("alice"))
		);

		let state = latest_state(&mut rx).unwrap();
		assert_eq!(state.gold, 0);
		assert_eq!(state.kills, 0);
		assert_eq!(state.ship, None);
		assert_eq!(
			state.players,
			vec![PlayerPosition {
				username: "alice".to_owned(),
				x: 0.0,
				z: 0.0,
			}]
		);
	}

	#[tokio::test]
	async fn test_join_loads_existing_record() {
		let mut h = harness();
		let stored = PlayerRecord {
			gold: 40,
			kills: 9,
			x: 5.0,
			..PlayerRecord::new("zed")
		};
		h.store.save(stored.clone()).await.unwrap();
		let (tx, _rx) = client();
		assert_eq!(h.registry.join("  zed ", tx).await.unwrap(), stored);
		assert!(h.registry.contains("zed"));
	}

	#[tokio::test]
	async fn test_broadcast_reflects_last_move() {
		let mut h = harness();
		let (alice_tx, _alice_rx) = client();
		let (bob_tx, mut bob_rx) = client();
		h.registry.join("alice", alice_tx).await.unwrap();
		h.registry.join("bob", bob_tx).await.unwrap();

		for (x, z) in [(1.0, 2.0), (-40.5, 3.0), (1e6, -1e6), (7.25, 0.5)] {
			h.registry.move_to("alice", x, z).await.unwrap();
		}

		let state = latest_state(&mut bob_rx).unwrap();
		let alice = state.players.iter().find(|p| p.username == "alice").unwrap();
		assert_eq!((alice.x, alice.z), (7.25, 0.5));
		let stored = h.store.load("alice").await.unwrap().unwrap();
		assert_eq!((stored.x, stored.z), (7.25, 0.5));
	}

	#[tokio::test]
	async fn test_every_attack_counts_as_kill() {
		let mut h = harness();
		let (tx, mut rx) = client();
		h.registry.join("alice", tx).await.unwrap();
		for _ in 0..3 {
			h.registry.record_hit("alice").await.unwrap();
		}
		let state = latest_state(&mut rx).unwrap();
		assert_eq!(state.kills, 3);
		assert_eq!(
			state.leaderboard,
			vec![LeaderboardEntry {
				username: "alice".to_owned(),
				kills: 3,
			}]
		);
		assert_eq!(h.store.load("alice").await.unwrap().unwrap().kills, 3);
	}

	#[tokio::test]
	async fn test_purchase_with_enough_gold() {
		let mut h = harness();
		h.store
			.save(PlayerRecord {
				gold: 150,
				..PlayerRecord::new("bob")
			})
			.await
			.unwrap();
		let (tx, mut rx) = client();
		h.registry.join("bob", tx).await.unwrap();

		let record = h.registry.purchase_ship("bob", "Sloop").await.unwrap();
		assert_eq!(record.gold, 50);
		assert_eq!(record.ship.as_deref(), Some("Sloop"));
		assert_eq!(h.store.load("bob").await.unwrap(), Some(record));

		let state = latest_state(&mut rx).unwrap();
		assert_eq!(state.gold, 50);
		assert_eq!(state.ship.as_deref(), Some("Sloop"));
	}

	#[tokio::test]
	async fn test_purchase_rejections_change_nothing() {
		let mut h = harness();
		h.store
			.save(PlayerRecord {
				gold: 99,
				..PlayerRecord::new("poor")
			})
			.await
			.unwrap();
		h.store
			.save(PlayerRecord {
				gold: 500,
				ship: Some("Frigate".to_owned()),
				..PlayerRecord::new("rich")
			})
			.await
			.unwrap();
		let (poor_tx, mut poor_rx) = client();
		let (rich_tx, mut rich_rx) = client();
		h.registry.join("poor", poor_tx).await.unwrap();
		h.registry.join("rich", rich_tx).await.unwrap();
		latest_state(&mut poor_rx);
		latest_state(&mut rich_rx);

		assert!(matches!(
			h.registry.purchase_ship("poor", "Sloop").await,
			Err(RegistryError::InsufficientGold { gold: 99 })
		));
		assert!(matches!(
			h.registry.purchase_ship("rich", "Sloop").await,
			Err(RegistryError::AlreadyOwnsShip(ship)) if ship == "Frigate"
		));

		assert_eq!(latest_state(&mut poor_rx), None, "no broadcast on rejection");
		assert_eq!(latest_state(&mut rich_rx), None, "no broadcast on rejection");
		assert_eq!(h.store.load("poor").await.unwrap().unwrap().gold, 99);
		let rich = h.store.load("rich").await.unwrap().unwrap();
		assert_eq!(rich.gold, 500);
		assert_eq!(rich.ship.as_deref(), Some("Frigate"));
	}

	#[tokio::test]
	async fn test_purchase_rejects_bad_ship_names() {
		let mut h = harness();
		h.store
			.save(PlayerRecord {
				gold: 500,
				..PlayerRecord::new("bob")
			})
			.await
			.unwrap();
		let (tx, mut rx) = client();
		h.registry.join("bob", tx).await.unwrap();
		latest_state(&mut rx);

		let too_long = "S".repeat(MAX_SHIP_NAME_LEN + 1);
		let huge = "S".repeat(100_000);
		for ship in ["", "  \t ", too_long.as_str(), huge.as_str()] {
			let err = h.registry.purchase_ship("bob", ship).await.unwrap_err();
			assert!(matches!(err, RegistryError::InvalidShip));
			assert_eq!(err.reject_reason(), Some(RejectReason::InvalidShip));
		}
		assert_eq!(latest_state(&mut rx), None);
		let stored = h.store.load("bob").await.unwrap().unwrap();
		assert_eq!((stored.gold, stored.ship), (500, None));

		let longest = "S".repeat(MAX_SHIP_NAME_LEN);
		let record = h
			.registry
			.purchase_ship("bob", &format!(" {longest} "))
			.await
			.unwrap();
		assert_eq!(record.ship, Some(longest));
	}

	#[tokio::test]
	async fn test_stalled_client_holds_one_pending_state() {
		let mut h = harness();
		let (stalled_tx, mut stalled_rx) = client();
		let (alice_tx, _alice_rx) = client();
		h.registry.join("stalled", stalled_tx).await.unwrap();
		h.registry.join("alice", alice_tx).await.unwrap();

		for i in 0..500u32 {
			h.registry.move_to("alice", f64::from(i), 0.0).await.unwrap();
		}
		let pending = stalled_rx.drain();
		assert_eq!(pending.len(), 1);
		let Clientbound::State(state) = &pending[0] else {
			panic!("expected a state, got {pending:?}");
		};
		let alice = state.players.iter().find(|p| p.username == "alice").unwrap();
		assert_eq!(alice.x, 499.0);
	}

	#[tokio::test]
	async fn test_purchase_succeeds_iff_affordable_and_shipless() {
		for gold in [0, 1, 99, 100, 101, 250] {
			for owned in [None, Some("Raft")] {
				let mut h = harness();
				h.store
					.save(PlayerRecord {
						gold,
						ship: owned.map(str::to_owned),
						..PlayerRecord::new("p")
					})
					.await
					.unwrap();
				let (tx, _rx) = client();
				h.registry.join("p", tx).await.unwrap();

				let result = h.registry.purchase_ship("p", "Sloop").await;
				let should_succeed = gold >= SHIP_PRICE && owned.is_none();
				assert_eq!(result.is_ok(), should_succeed, "gold={gold} owned={owned:?}");
				if let Ok(record) = result {
					assert_eq!(record.gold, gold - SHIP_PRICE);
				}
			}
		}
	}

	#[tokio::test]
	async fn test_leaderboard_top_ten_descending() {
		let mut h = harness();
		let mut receivers = Vec::new();
		for i in 0..13u64 {
			let name = format!("p{i}");
			h.store
				.save(PlayerRecord {
					kills: (i * 5) % 11,
					..PlayerRecord::new(name.clone())
				})
				.await
				.unwrap();
			let (tx, rx) = client();
			h.registry.join(&name, tx).await.unwrap();
			receivers.push(rx);
		}
		for rx in &mut receivers {
			let state = latest_state(rx).unwrap();
			assert_eq!(state.leaderboard.len(), leaderboard::LEADERBOARD_LEN);
			assert!(state
				.leaderboard
				.windows(2)
				.all(|w| w[0].kills >= w[1].kills));
			assert_eq!(state.players.len(), 13);
		}
	}

	#[tokio::test]
	async fn test_leave_keeps_durable_record() {
		let mut h = harness();
		let (alice_tx, mut alice_rx) = client();
		let (carol_tx, _carol_rx) = client();
		h.registry.join("alice", alice_tx).await.unwrap();
		h.registry.join("carol", carol_tx).await.unwrap();
		h.registry.record_hit("carol").await.unwrap();
		h.registry.move_to("carol", 3.0, 4.0).await.unwrap();
		assert_eq!(usernames(&latest_state(&mut alice_rx).unwrap()), ["alice", "carol"]);

		h.registry.leave("carol").unwrap();
		let state = latest_state(&mut alice_rx).unwrap();
		assert_eq!(usernames(&state), ["alice"]);
		assert!(state.leaderboard.iter().all(|e| e.username != "carol"));

		let (carol_tx, _carol_rx) = client();
		let record = h.registry.join("carol", carol_tx).await.unwrap();
		assert_eq!(record.kills, 1);
		assert_eq!((record.x, record.z), (3.0, 4.0));
	}

	#[tokio::test]
	async fn test_duplicate_join_is_rejected() {
		let mut h = harness();
		let (first_tx, mut first_rx) = client();
		let (second_tx, mut second_rx) = client();
		h.registry.join("alice", first_tx).await.unwrap();
		assert!(matches!(
			h.registry.join("alice", second_tx).await,
			Err(RegistryError::IdentityInUse(_))
		));
		assert_eq!(h.registry.len(), 1);

		h.registry.record_hit("alice").await.unwrap();
		assert_eq!(latest_state(&mut first_rx).unwrap().kills, 1);
		assert_eq!(latest_state(&mut second_rx), None);
	}

	#[tokio::test]
	async fn test_invalid_identities() {
		let mut h = harness();
		let too_long = "x".repeat(MAX_IDENTITY_LEN + 1);
		for name in ["", "   ", too_long.as_str()] {
			let (tx, _rx) = client();
			assert!(matches!(
				h.registry.join(name, tx).await,
				Err(RegistryError::InvalidIdentity)
			));
		}
		assert!(h.registry.is_empty());
	}

	#[tokio::test]
	async fn test_operations_before_join() {
		let mut h = harness();
		assert!(matches!(
			h.registry.move_to("ghost", 1.0, 1.0).await,
			Err(RegistryError::NotJoined(_))
		));
		assert!(matches!(
			h.registry.record_hit("ghost").await,
			Err(RegistryError::NotJoined(_))
		));
		assert!(matches!(
			h.registry.purchase_ship("ghost", "Sloop").await,
			Err(RegistryError::NotJoined(_))
		));
		assert!(matches!(
			h.registry.leave("ghost"),
			Err(RegistryError::NotJoined(_))
		));
		assert_eq!(h.store.load("ghost").await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_closed_sink_does_not_stop_broadcast() {
		let mut h = harness();
		let (gone_tx, gone_rx) = client();
		let (alice_tx, mut alice_rx) = client();
		h.registry.join("gone", gone_tx).await.unwrap();
		h.registry.join("alice", alice_tx).await.unwrap();
		drop(gone_rx);

		h.registry.move_to("alice", 9.0, 9.0).await.unwrap();
		let state = latest_state(&mut alice_rx).unwrap();
		assert_eq!(usernames(&state), ["gone", "alice"]);
	}

	#[tokio::test]
	async fn test_corrupt_store_rejects_join() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("playerdata.json");
		std::fs::write(&path, "not json").unwrap();
		let (store, _join) = PlayerStore::spawn(path);
		let mut registry: Registry = SessionRegistry::new(store);

		let (tx, _rx) = client();
		let err = registry.join("alice", tx).await.unwrap_err();
		assert!(matches!(err, RegistryError::Store(StoreError::Corrupt { .. })));
		assert_eq!(err.reject_reason(), Some(RejectReason::StorageUnavailable));
		assert!(registry.is_empty());
	}

	#[tokio::test]
	async fn test_snapshot_for_matches_broadcast() {
		let mut h = harness();
		let (tx, mut rx) = client();
		h.registry.join("alice", tx).await.unwrap();
		h.registry.move_to("alice", 1.0, 2.0).await.unwrap();
		assert_eq!(h.registry.snapshot_for("alice"), latest_state(&mut rx));
		assert_eq!(h.registry.snapshot_for("nobody"), None);
	}
}
