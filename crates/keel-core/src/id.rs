//! Identifiers for keel entities.
//!
//! Entity IDs are opaque strings. Freshly minted IDs are ULIDs so they sort by
//! creation time; IDs minted inside the apply loop are derived from the event
//! clock and a seed so that replaying a log reproduces them exactly.
//!
//! # Example
//!
//! ```rust
//! use keel_core::id::{deterministic_ulid, WorkspaceId};
//!
//! let ws = WorkspaceId::new("acme").unwrap();
//! let a = deterministic_ulid(1_700_000_000_000, "release-1:0");
//! let b = deterministic_ulid(1_700_000_000_000, "release-1:0");
//! assert_eq!(a, b);
//! assert_eq!(ws.to_string(), "acme");
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum accepted workspace ID length.
pub const MAX_WORKSPACE_ID_LEN: usize = 128;

/// A unique identifier for a workspace (tenant).
///
/// Workspace IDs must be non-empty, at most 128 characters and must not
/// contain `/` or whitespace, since they appear in URL paths and storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Creates a workspace ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, too long, or has invalid characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Returns the workspace ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "workspace ID cannot be empty".to_string(),
            });
        }
        if id.len() > MAX_WORKSPACE_ID_LEN {
            return Err(Error::InvalidId {
                message: format!(
                    "workspace ID is too long ({} > {MAX_WORKSPACE_ID_LEN})",
                    id.len()
                ),
            });
        }
        if id.chars().any(|c| c == '/' || c.is_whitespace()) {
            return Err(Error::InvalidId {
                message: format!("workspace ID '{id}' contains '/' or whitespace"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkspaceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for WorkspaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generates a fresh ULID string.
#[must_use]
pub fn generate_id() -> String {
    Ulid::new().to_string()
}

/// Derives a ULID from a millisecond timestamp and a seed string.
///
/// The random component is the SHA-256 of the seed, so identical inputs yield
/// identical IDs and distinct seeds at the same instant do not collide.
#[must_use]
pub fn deterministic_ulid(timestamp_ms: i64, seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut random = [0u8; 16];
    random.copy_from_slice(&digest[..16]);
    let ms = u64::try_from(timestamp_ms).unwrap_or(0);
    Ulid::from_parts(ms, u128::from_be_bytes(random)).to_string()
}
