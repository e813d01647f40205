//! Blob container format
//!
//! ```text
//! +-------+----------------+---------------------+------------------------+
//! | magic | index len (LE) | index (JSON)        | entry bytes, packed    |
//! | 4 B   | u32            | index len bytes     | in index order         |
//! +-------+----------------+---------------------+------------------------+
//! ```
//!
//! Entry offsets are relative to the start of the packed data, and every
//! entry carries the hash of its own bytes so a reader can verify one entry
//! without touching the rest.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::store::BlobStore;
use crate::error::{PressError, Result};

pub const CONTAINER_MAGIC: &[u8; 4] = b"GPC1";

const HEADER_LEN: usize = 8;

/// Location of one entry inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    pub identifier: String,
    pub offset: u64,
    pub length: u64,
    /// `sha256-<hex>` of the entry bytes
    pub hash: String,
}

/// Parsed container index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIndex {
    pub entries: Vec<ContainerEntry>,
    /// Absolute offset of the packed data
    #[serde(skip)]
    pub data_offset: usize,
}

impl ContainerIndex {
    /// Exact identifier match. No prefix or case-insensitive matching.
    pub fn find(&self, identifier: &str) -> Option<&ContainerEntry> {
        self.entries.iter().find(|e| e.identifier == identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.identifier.as_str())
    }
}

/// Packs named entries into container bytes
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    entries: Vec<(String, Vec<u8>)>,
    seen: HashSet<String>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Identifiers must be non-empty and unique.
    pub fn add(&mut self, identifier: impl Into<String>, bytes: Vec<u8>) -> Result<&mut Self> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(PressError::MalformedContainer("entry identifier must not be empty".into()));
        }
        if !self.seen.insert(identifier.clone()) {
            return Err(PressError::MalformedContainer(format!(
                "duplicate entry identifier: {identifier}"
            )));
        }
        self.entries.push((identifier, bytes));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the container. Deterministic for the same entries in the same order.
    pub fn build(self) -> Result<(Vec<u8>, ContainerIndex)> {
        if self.entries.is_empty() {
            return Err(PressError::MalformedContainer("container has no entries".into()));
        }

        let mut offset = 0u64;
        let mut index_entries = Vec::with_capacity(self.entries.len());
        for (identifier, bytes) in &self.entries {
            index_entries.push(ContainerEntry {
                identifier: identifier.clone(),
                offset,
                length: bytes.len() as u64,
                hash: BlobStore::compute_hash(bytes),
            });
            offset += bytes.len() as u64;
        }

        let mut index = ContainerIndex {
            entries: index_entries,
            data_offset: 0,
        };
        let index_json = serde_json::to_vec(&index)?;
        let index_len = u32::try_from(index_json.len())
            .map_err(|_| PressError::MalformedContainer("container index too large".into()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + index_json.len() + offset as usize);
        out.extend_from_slice(CONTAINER_MAGIC);
        out.extend_from_slice(&index_len.to_le_bytes());
        out.extend_from_slice(&index_json);
        for (_, bytes) in &self.entries {
            out.extend_from_slice(bytes);
        }

        index.data_offset = HEADER_LEN + index_json.len();
        Ok((out, index))
    }
}

/// Parse and bounds-check the index at the front of `bytes`
pub fn parse_index(bytes: &[u8]) -> Result<ContainerIndex> {
    if bytes.len() < HEADER_LEN {
        return Err(PressError::MalformedContainer(format!(
            "container is {} bytes, shorter than its header",
            bytes.len()
        )));
    }
    if &bytes[..4] != CONTAINER_MAGIC {
        return Err(PressError::MalformedContainer("bad magic".into()));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[4..HEADER_LEN]);
    let index_len = u32::from_le_bytes(len_bytes) as usize;

    let data_offset = HEADER_LEN
        .checked_add(index_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| PressError::MalformedContainer("index length exceeds container".into()))?;

    let mut index: ContainerIndex = serde_json::from_slice(&bytes[HEADER_LEN..data_offset])
        .map_err(|e| PressError::MalformedContainer(format!("unreadable index: {e}")))?;
    index.data_offset = data_offset;

    let data_len = (bytes.len() - data_offset) as u64;
    for entry in &index.entries {
        let end = entry.offset.checked_add(entry.length);
        if end.map_or(true, |end| end > data_len) {
            return Err(PressError::MalformedContainer(format!(
                "entry {} lies outside the container",
                entry.identifier
            )));
        }
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_entry_container() -> (Vec<u8>, ContainerIndex) {
        let mut builder = ContainerBuilder::new();
        builder.add("issue-1", b"first body".to_vec()).unwrap();
        builder.add("issue-2", b"second, longer body".to_vec()).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_build_then_parse() {
        let (bytes, built) = two_entry_container();
        let parsed = parse_index(&bytes).unwrap();

        assert_eq!(parsed, built);
        assert_eq!(parsed.data_offset, built.data_offset);

        let entry = parsed.find("issue-2").unwrap();
        let start = parsed.data_offset + entry.offset as usize;
        let end = start + entry.length as usize;
        assert_eq!(&bytes[start..end], b"second, longer body");
    }

    #[test]
    fn test_find_is_exact() {
        let (bytes, _) = two_entry_container();
        let index = parse_index(&bytes).unwrap();
        assert!(index.find("issue-1").is_some());
        assert!(index.find("issue").is_none());
        assert!(index.find("ISSUE-1").is_none());
        assert_eq!(index.identifiers().collect::<Vec<_>>(), vec!["issue-1", "issue-2"]);
    }

    #[test]
    fn test_builder_rejects_bad_identifiers() {
        let mut builder = ContainerBuilder::new();
        builder.add("a", vec![1]).unwrap();
        assert!(matches!(builder.add("a", vec![2]), Err(PressError::MalformedContainer(_))));
        assert!(matches!(builder.add("", vec![3]), Err(PressError::MalformedContainer(_))));
        assert!(ContainerBuilder::new().build().is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_index(b"GPC").is_err());
        assert!(parse_index(b"NOPE\x00\x00\x00\x00").is_err());

        let (mut bytes, _) = two_entry_container();
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(parse_index(&bytes), Err(PressError::MalformedContainer(_))));
    }
}
