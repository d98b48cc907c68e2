use serde::{Deserialize, Deserializer, Serialize};

/// Durable per-player progress. Created on first join, never deleted.
///
/// Every field falls back to its default when missing or `null`, so older or
/// hand-edited files still load. An empty ship name means no ship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
	#[serde(default, deserialize_with = "null_as_default")]
	pub username: String,
	#[serde(default, deserialize_with = "null_as_default")]
	pub gold: u64,
	#[serde(default, deserialize_with = "null_as_default")]
	pub kills: u64,
	#[serde(default, deserialize_with = "empty_as_none")]
	pub ship: Option<String>,
	#[serde(default, deserialize_with = "null_as_default")]
	pub x: f64,
	#[serde(default, deserialize_with = "null_as_default")]
	pub z: f64,
}

impl PlayerRecord {
	/// The record a player starts with: no gold, no kills, no ship, at the origin.
	pub fn new(username: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			gold: 0,
			kills: 0,
			ship: None,
			x: 0.0,
			z: 0.0,
		}
	}
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Default + Deserialize<'de>,
{
	Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(Option::<String>::deserialize(deserializer)?.filter(|ship| !ship.is_empty()))
}
