//! Session snapshot: the minimal state needed to resume after a reload.
//!
//! Stored per identity in the key-value store as a CBOR envelope
//! `{magic, schema_version, checksum, payload}` with a blake3 checksum over
//! the payload bytes. Anything that fails to verify is discarded, never
//! resumed.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::lifecycle::helper::Assignment;
use crate::model::{Request, UnixTimeMs, UserId};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_SNAPSHOT_BYTES: usize = 256 * 1024;
const SNAPSHOT_MAGIC: &[u8; 4] = b"SKSN";
const KEY_PREFIX: &str = "session:snapshot:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("snapshot too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<ciborium::de::Error<std::io::Error>> for SnapshotError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for SnapshotError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SeekerSnapshot {
    pub request: Request,
    pub confirm_in_flight: bool,
    pub cancel_window_ends_at: Option<UnixTimeMs>,
    pub cancel_window_provisional: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HelperSnapshot {
    pub assignment: Assignment,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum SessionSnapshot {
    Seeker(SeekerSnapshot),
    Helper(HelperSnapshot),
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

pub fn encode(snapshot: &SessionSnapshot) -> Result<Vec<u8>, SnapshotError> {
    let mut payload = Vec::new();
    ciborium::into_writer(snapshot, &mut payload)?;

    let envelope = SnapshotEnvelope {
        magic: *SNAPSHOT_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *blake3::hash(&payload).as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<SessionSnapshot, SnapshotError> {
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::TooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }
    if bytes.is_empty() {
        return Err(SnapshotError::Corrupted {
            reason: "empty snapshot",
        });
    }

    let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *SNAPSHOT_MAGIC {
        return Err(SnapshotError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(SnapshotError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(SnapshotError::IntegrityCheckFailed {
            expected: blake3::Hash::from(envelope.checksum).to_hex().to_string(),
            actual: actual.to_hex().to_string(),
        });
    }

    Ok(ciborium::from_reader(&envelope.payload[..])?)
}

/// KV key for a user's snapshot. Hashing keeps user ids out of storage keys.
#[must_use]
pub fn key_for(user_id: &UserId) -> String {
    let hex = blake3::hash(user_id.as_str().as_bytes()).to_hex();
    format!("{KEY_PREFIX}{}", &hex.as_str()[..16])
}

/// Key-value work for the shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCommand {
    Write { key: String, bytes: Vec<u8> },
    Delete { key: String },
}

impl StoreCommand {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Write { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Write-through cache in front of the key-value store. The lifecycle state
/// machines are its only writers.
#[derive(Debug, Default)]
pub struct SessionStore {
    key: Option<String>,
    cached: Option<SessionSnapshot>,
    hydrated: bool,
    /// Set when a clear went out before hydration finished.
    cleared_early: bool,
}

impl SessionStore {
    /// Scopes the store to one identity. Returns the key to hydrate from.
    pub fn bind(&mut self, user_id: &UserId) -> String {
        let key = key_for(user_id);
        self.key = Some(key.clone());
        self.cached = None;
        self.hydrated = false;
        self.cleared_early = false;
        key
    }

    /// Drops the identity scope, deleting its snapshot.
    pub fn unbind(&mut self) -> Option<StoreCommand> {
        let command = self.key.take().map(|key| StoreCommand::Delete { key });
        self.cached = None;
        self.hydrated = false;
        self.cleared_early = false;
        command
    }

    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    #[must_use]
    pub fn load(&self) -> Option<&SessionSnapshot> {
        self.cached.as_ref()
    }

    /// Unchanged snapshots are not rewritten.
    pub fn save(&mut self, snapshot: SessionSnapshot) -> Result<Option<StoreCommand>, SnapshotError> {
        let Some(key) = self.key.clone() else {
            debug!("no identity bound, snapshot kept in memory only");
            self.cached = Some(snapshot);
            return Ok(None);
        };
        if self.cached.as_ref() == Some(&snapshot) {
            return Ok(None);
        }
        let bytes = encode(&snapshot)?;
        self.cached = Some(snapshot);
        Ok(Some(StoreCommand::Write { key, bytes }))
    }

    pub fn clear(&mut self) -> Option<StoreCommand> {
        let had = self.cached.take().is_some();
        let key = self.key.clone()?;
        if !self.hydrated {
            self.cleared_early = true;
        }
        (had || !self.hydrated).then_some(StoreCommand::Delete { key })
    }

    /// Fills the cache from the bytes read at startup. A snapshot written
    /// since binding wins over the stored one.
    pub fn hydrate(&mut self, bytes: Option<&[u8]>) -> Result<Option<SessionSnapshot>, SnapshotError> {
        self.hydrated = true;
        if self.cleared_early {
            debug!("snapshot cleared before it was read, ignoring stored copy");
            return Ok(None);
        }
        if self.cached.is_some() {
            debug!("live snapshot present, skipping stored copy");
            return Ok(None);
        }
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        match decode(bytes) {
            Ok(snapshot) => {
                self.cached = Some(snapshot.clone());
                Ok(Some(snapshot))
            }
            Err(err) => {
                warn!(error = %err, "discarding unreadable session snapshot");
                Err(err)
            }
        }
    }
}
