//! Binary workspace snapshots.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic      8 bytes   "KEELSNAP"
//! version    u16
//! sequence   u64       changelog sequence covered by the snapshot
//! workspace  u32 len + UTF-8 id
//! repeated per repository, in Stores::repositories() order:
//!   name     u32 len + UTF-8 entity kind
//!   body     u32 len + JSON object (id -> entity)
//! ```
//!
//! Repositories are ordered maps, so encoding the same state twice yields the
//! same bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::Stores;

/// Leading bytes of every snapshot.
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"KEELSNAP";

/// Current layout version.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

/// A decoded snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Workspace the snapshot belongs to.
    pub workspace_id: String,
    /// Changelog sequence covered.
    pub sequence: u64,
    /// `(entity kind, JSON body)` in encoding order.
    pub repositories: Vec<(String, Vec<u8>)>,
}

impl Snapshot {
    /// Captures every repository of `stores`.
    ///
    /// # Errors
    ///
    /// Returns an error if a repository cannot be serialized.
    pub fn capture(workspace_id: &str, sequence: u64, stores: &Stores) -> Result<Self> {
        let repositories = stores
            .repositories()
            .into_iter()
            .map(|repo| Ok((repo.kind().to_string(), repo.export_json()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            workspace_id: workspace_id.to_string(),
            sequence,
            repositories,
        })
    }

    /// Replaces the content of `stores` with this snapshot.
    ///
    /// Repositories absent from the snapshot are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown repository names or malformed bodies.
    pub fn restore(&self, stores: &Stores) -> Result<()> {
        for (name, body) in &self.repositories {
            stores.repository(name)?.import_json(body)?;
        }
        Ok(())
    }

    /// Encodes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is longer than `u32::MAX` bytes.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_slice(SNAPSHOT_MAGIC);
        buf.put_u16(SNAPSHOT_FORMAT_VERSION);
        buf.put_u64(self.sequence);
        put_field(&mut buf, self.workspace_id.as_bytes())?;
        for (name, body) in &self.repositories {
            put_field(&mut buf, name.as_bytes())?;
            put_field(&mut buf, body)?;
        }
        Ok(buf.freeze())
    }

    /// Decodes snapshot bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptSnapshot`] on a bad magic, unsupported version,
    /// truncated field or non-UTF-8 name.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < SNAPSHOT_MAGIC.len() + 2 + 8 {
            return Err(corrupt("truncated header"));
        }
        if &buf[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        buf.advance(SNAPSHOT_MAGIC.len());
        let version = buf.get_u16();
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }
        let sequence = buf.get_u64();
        let workspace_id = take_string(&mut buf, "workspace id")?;

        let mut repositories = Vec::new();
        while buf.has_remaining() {
            let name = take_string(&mut buf, "repository name")?;
            let body = take_field(&mut buf, &name)?.to_vec();
            repositories.push((name, body));
        }
        Ok(Self {
            workspace_id,
            sequence,
            repositories,
        })
    }

    /// Human-readable JSON view: workspace, sequence and every repository.
    ///
    /// # Errors
    ///
    /// Returns an error if a repository body is not valid JSON.
    pub fn to_json(&self) -> Result<Value> {
        let mut repositories = serde_json::Map::new();
        for (name, body) in &self.repositories {
            repositories.insert(name.clone(), serde_json::from_slice(body)?);
        }
        Ok(serde_json::json!({
            "workspaceId": self.workspace_id,
            "sequence": self.sequence,
            "formatVersion": SNAPSHOT_FORMAT_VERSION,
            "repositories": repositories,
        }))
    }
}

fn corrupt(message: impl Into<String>) -> Error {
    Error::CorruptSnapshot {
        message: message.into(),
    }
}

fn put_field(buf: &mut BytesMut, field: &[u8]) -> Result<()> {
    let len = u32::try_from(field.len())
        .map_err(|_| Error::internal(format!("snapshot field too large: {} bytes", field.len())))?;
    buf.put_u32(len);
    buf.put_slice(field);
    Ok(())
}

fn take_field<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(corrupt(format!("truncated length of {what}")));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(corrupt(format!("truncated {what}")));
    }
    let (field, rest) = buf.split_at(len);
    *buf = rest;
    Ok(field)
}

fn take_string(buf: &mut &[u8], what: &str) -> Result<String> {
    let field = take_field(buf, what)?;
    String::from_utf8(field.to_vec()).map_err(|_| corrupt(format!("{what} is not UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReleaseTarget, System};

    fn seeded() -> Stores {
        let stores = Stores::new();
        let mut system = System::new("s1", "payments");
        system.deployment_ids.insert("d1".into());
        system.environment_ids.insert("e1".into());
        stores.systems.upsert(system).unwrap();
        stores
            .release_targets
            .upsert(ReleaseTarget::new("r1", "e1", "d1"))
            .unwrap();
        stores
    }

    #[test]
    fn encode_decode_restore() -> Result<()> {
        let stores = seeded();
        let bytes = Snapshot::capture("ws", 7, &stores)?.encode()?;
        assert_eq!(&bytes[..8], SNAPSHOT_MAGIC);

        let decoded = Snapshot::decode(&bytes)?;
        assert_eq!(decoded.workspace_id, "ws");
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.repositories.len(), stores.repositories().len());

        let restored = Stores::new();
        decoded.restore(&restored)?;
        assert_eq!(restored.systems.get("s1")?.map(|s| s.name), Some("payments".into()));
        assert_eq!(restored.release_targets.len()?, 1);
        Ok(())
    }

    #[test]
    fn identical_state_encodes_identically() -> Result<()> {
        let a = Snapshot::capture("ws", 1, &seeded())?.encode()?;
        let b = Snapshot::capture("ws", 1, &seeded())?.encode()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn rejects_corrupt_input() {
        assert!(matches!(
            Snapshot::decode(b"NOTASNAPSHOT-----"),
            Err(Error::CorruptSnapshot { .. })
        ));
        let bytes = Snapshot::capture("ws", 1, &seeded()).unwrap().encode().unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Snapshot::decode(truncated),
            Err(Error::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn json_view_lists_repositories() -> Result<()> {
        let view = Snapshot::capture("ws", 3, &seeded())?.to_json()?;
        assert_eq!(view["sequence"], 3);
        assert_eq!(view["repositories"]["system"]["s1"]["name"], "payments");
        Ok(())
    }
}
