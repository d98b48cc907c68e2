//! Durable player progress, kept in a single JSON file.
//!
//! The file maps username to [`PlayerRecord`] and is re-read and fully rewritten
//! on every access. Doing that from several connections at once would lose
//! updates, so all access goes through one task that owns the file. We talk to
//! it by sending messages (CSP style): see [`PlayerStore::spawn`] for the task
//! and [`StoreHandle`] for the messaging.

mod record;

pub use self::record::PlayerRecord;

use std::{
	collections::BTreeMap,
	ffi::OsString,
	io::ErrorKind,
	path::PathBuf,
};

use tokio::{
	sync::{mpsc, oneshot},
	task::JoinHandle,
};
use tracing::{debug, trace, warn};

/// How many requests may queue up before callers start waiting on the task.
const REQUEST_BUFFER: usize = 64;

type Table = BTreeMap<String, PlayerRecord>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("failed to access player store at {}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("player store at {} is not valid json, refusing to touch it", path.display())]
	Corrupt {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
	#[error("failed to encode player store")]
	Encode(#[source] serde_json::Error),
	#[error("player store task is no longer running")]
	Closed,
}

type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug)]
enum Request {
	Load {
		username: String,
		reply: oneshot::Sender<Result<Option<PlayerRecord>>>,
	},
	Save {
		record: PlayerRecord,
		reply: oneshot::Sender<Result<()>>,
	},
}

/// Used to communicate with the store task. Cheaply cloneable.
///
/// The task exits once every handle has been dropped.
#[derive(Clone, Debug)]
pub struct StoreHandle {
	tx: mpsc::Sender<Request>,
}

impl StoreHandle {
	/// Returns the record for `username`, or `None` if it was never saved.
	pub async fn load(&self, username: &str) -> Result<Option<PlayerRecord>> {
		let (reply, rx) = oneshot::channel();
		self.request(Request::Load {
			username: username.to_owned(),
			reply,
		})
		.await?;
		rx.await.map_err(|_| StoreError::Closed)?
	}

	/// Inserts or replaces the record keyed by `record.username`.
	pub async fn save(&self, record: PlayerRecord) -> Result<()> {
		let (reply, rx) = oneshot::channel();
		self.request(Request::Save { record, reply }).await?;
		rx.await.map_err(|_| StoreError::Closed)?
	}

	async fn request(&self, request: Request) -> Result<()> {
		self.tx.send(request).await.map_err(|_| StoreError::Closed)
	}
}

/// Owns the backing file. Only ever used from the task spawned by
/// [`PlayerStore::spawn`].
#[derive(Debug)]
pub struct PlayerStore {
	path: PathBuf,
}

impl PlayerStore {
	/// Spawns the store task for the file at `path` and returns a way to talk to
	/// it and to join on it. The file does not need to exist yet.
	pub fn spawn(path: impl Into<PathBuf>) -> (StoreHandle, JoinHandle<()>) {
		let store = Self { path: path.into() };
		let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
		(StoreHandle { tx }, tokio::spawn(store.run(rx)))
	}

	/// The body of the task. Requests are handled strictly one after another,
	/// so a save's read-modify-write never interleaves with another.
	async fn run(self, mut rx: mpsc::Receiver<Request>) {
		debug!(path = %self.path.display(), "player store started");
		while let Some(request) = rx.recv().await {
			match request {
				Request::Load { username, reply } => {
					let result = self.load(&username).await;
					if let Err(err) = &result {
						warn!("failed to load {username:?}: {err}");
					}
					// The caller may have gone away, that's fine.
					let _ = reply.send(result);
				}
				Request::Save { record, reply } => {
					let result = self.save(record).await;
					if let Err(err) = &result {
						warn!("failed to save: {err}");
					}
					let _ = reply.send(result);
				}
			}
		}
		debug!("all store handles dropped, player store stopped");
	}

	async fn load(&self, username: &str) -> Result<Option<PlayerRecord>> {
		let mut table = self.read_table().await?;
		Ok(table.remove(username))
	}

	async fn save(&self, record: PlayerRecord) -> Result<()> {
		let mut table = self.read_table().await?;
		trace!("saving {record:?}");
		table.insert(record.username.clone(), record);
		self.write_table(&table).await
	}

	/// A missing file is an empty store.
	async fn read_table(&self) -> Result<Table> {
		let bytes = match tokio::fs::read(&self.path).await {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Table::new()),
			Err(source) => return Err(self.io_err(source)),
		};
		let mut table: Table =
			serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
				path: self.path.clone(),
				source,
			})?;
		// The key is the source of truth for who a record belongs to.
		for (username, record) in table.iter_mut() {
			if record.username != *username {
				record.username.clone_from(username);
			}
		}
		Ok(table)
	}

	/// Writes to a sibling file first and renames it over the store, so a crash
	/// mid-write leaves either the old or the new table.
	async fn write_table(&self, table: &Table) -> Result<()> {
		let serialized = serde_json::to_vec(table).map_err(StoreError::Encode)?;
		if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty())
		{
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|source| self.io_err(source))?;
		}
		let tmp_path = self.tmp_path();
		tokio::fs::write(&tmp_path, serialized)
			.await
			.map_err(|source| self.io_err(source))?;
		tokio::fs::rename(&tmp_path, &self.path)
			.await
			.map_err(|source| self.io_err(source))
	}

	fn tmp_path(&self) -> PathBuf {
		let mut tmp = OsString::from(self.path.as_os_str());
		tmp.push(".tmp");
		tmp.into()
	}

	fn io_err(&self, source: std::io::Error) -> StoreError {
		StoreError::Io {
			path: self.path.clone(),
			source,
		}
	}
}
