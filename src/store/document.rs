//! Versioned documents persisted through a [`KvStore`].
//!
//! Each document is stored as an envelope carrying a schema version and a
//! SHA-256 checksum of the payload text. Loading a document written by a
//! different schema version, or one whose payload no longer matches its
//! checksum, yields `None` and a warning rather than corrupt state.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::traits::KvStore;

/// Current schema version of every persisted document.
pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  version: u32,
  checksum: String,
  /// JSON text of the payload; kept as text so the checksum is stable
  data: String,
}

fn checksum(data: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data.as_bytes());
  hex::encode(hasher.finalize())
}

/// Serialize `value` and overwrite the document stored under `key`.
pub fn save_document<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
  let data =
    serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
  let envelope = Envelope {
    version: DOCUMENT_VERSION,
    checksum: checksum(&data),
    data,
  };
  let text = serde_json::to_string(&envelope)
    .map_err(|e| eyre!("Failed to serialize {} envelope: {}", key, e))?;

  store.set_item(key, &text)
}

/// Load the document stored under `key`.
///
/// Returns `Ok(None)` when nothing is stored or when the stored document
/// cannot be trusted. Only storage failures are errors.
pub fn load_document<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
  let Some(text) = store.get_item(key)? else {
    return Ok(None);
  };

  let envelope: Envelope = match serde_json::from_str(&text) {
    Ok(envelope) => envelope,
    Err(e) => {
      warn!(key, error = %e, "Discarding unreadable document");
      return Ok(None);
    }
  };

  if envelope.version != DOCUMENT_VERSION {
    warn!(
      key,
      found = envelope.version,
      expected = DOCUMENT_VERSION,
      "Discarding document with unknown schema version"
    );
    return Ok(None);
  }

  if checksum(&envelope.data) != envelope.checksum {
    warn!(key, "Discarding document with checksum mismatch");
    return Ok(None);
  }

  match serde_json::from_str(&envelope.data) {
    Ok(value) => Ok(Some(value)),
    Err(e) => {
      warn!(key, error = %e, "Discarding document that no longer matches its type");
      Ok(None)
    }
  }
}
