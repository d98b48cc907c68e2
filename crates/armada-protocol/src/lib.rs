//! Wire protocol between the naval clients and the relay server.
//!
//! Every message is a single JSON text frame, internally tagged by a `"type"`
//! field. The browser clients build these by hand, so the field names here are
//! part of the protocol and must not change.

use serde::{Deserialize, Serialize};

/// Messages sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Serverbound {
	/// Claims an identity for this connection.
	Join { username: String },
	Move { x: f64, z: f64 },
	/// Counts as a kill no matter what. The extra fields are only what the
	/// client happened to aim with.
	Attack {
		weapon: Option<String>,
		x: Option<f64>,
		z: Option<f64>,
	},
	/// `gold` is whatever the client believes it has. The server ignores it
	/// and charges from its own record.
	BuyShip { ship: String, gold: Option<f64> },
}

impl Serverbound {
	pub fn from_json(text: &str) -> Result<Self, DecodeError> {
		serde_json::from_str(text).map_err(DecodeError)
	}
}

#[derive(thiserror::Error, Debug)]
#[error("malformed serverbound message")]
pub struct DecodeError(#[source] serde_json::Error);

/// Messages sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Clientbound {
	/// Full state push, sent to everyone after every mutation.
	State(StateSnapshot),
	/// Sent only to the client whose request was refused.
	Rejected { reason: RejectReason },
}

impl Clientbound {
	pub fn to_json(&self) -> String {
		// Only strings, numbers and options in here, so this cannot fail.
		serde_json::to_string(self).expect("clientbound messages always serialize")
	}
}

/// What a single client sees after a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
	pub leaderboard: Vec<LeaderboardEntry>,
	pub gold: u64,
	pub kills: u64,
	pub ship: Option<String>,
	pub players: Vec<PlayerPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
	pub username: String,
	pub kills: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerPosition {
	pub username: String,
	pub x: f64,
	pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
	/// Someone is already connected under that username.
	IdentityInUse,
	InvalidIdentity,
	/// This connection already joined once.
	AlreadyJoined,
	/// The ship name was empty or too long.
	InvalidShip,
	AlreadyOwnsShip,
	InsufficientGold,
	StorageUnavailable,
}
