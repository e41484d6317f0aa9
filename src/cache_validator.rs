use hex;
use sha2::{Digest, Sha256};

/// Validates state-store entries using SHA-256 checksums
///
/// Rate-limit buckets, analytics and health history are read back by
/// other invocations, possibly from a shared database. Each value is
/// stored inside an envelope carrying the checksum of its payload:
/// 1. The checksum is computed when the value is written
/// 2. It is recomputed when the value is read
/// 3. Entries that do not match are discarded and treated as absent

/// Envelope stored for every state value
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatedStateEntry {
    /// The stored JSON payload
    pub data: String,
    /// SHA-256 checksum of the data (hex encoded)
    pub checksum: String,
}

impl ValidatedStateEntry {
    /// Creates a new entry with computed checksum
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns true if the checksum matches, false if tampered
    pub fn is_valid(&self) -> bool {
        let computed = Self::compute_checksum(&self.data);
        computed == self.checksum
    }

    /// Serializes the envelope to the bytes handed to the store
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope and returns its payload if the checksum holds
    ///
    /// Returns None for corrupted bytes, invalid JSON or a checksum mismatch.
    pub fn from_bytes_validated(bytes: &[u8]) -> Option<String> {
        let entry: ValidatedStateEntry = match serde_json::from_slice(bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("State entry is not a valid envelope: {}", e);
                return None;
            }
        };

        if entry.is_valid() {
            Some(entry.data)
        } else {
            tracing::warn!(
                "State validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            None
        }
    }
}
