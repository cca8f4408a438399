//! Structural plan fingerprints.
//!
//! A fingerprint is a blake3 digest over a tagged stream of node records:
//! type id, dependency edges and payload. Nodes are named by their position
//! in the stream instead of their id, so plans with the same shape and
//! payloads fingerprint equal even when their node ids differ. Nested
//! subquery bodies are fed inside their own scope.

use std::collections::HashMap;
use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::NodeId;

const TAG_NODE: u8 = 1;
const TAG_DEPENDENCY: u8 = 2;
const TAG_PAYLOAD: u8 = 3;
const TAG_OPEN: u8 = 4;
const TAG_CLOSE: u8 = 5;
const TAG_DOCUMENT: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Digest of a whole serialized value rather than a node stream.
    pub fn of_document<T: Serialize>(doc: &T) -> Result<Fingerprint> {
        let mut builder = FingerprintBuilder::new();
        builder.hasher.update(&[TAG_DOCUMENT]);
        builder.write_json(doc)?;
        Ok(builder.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental fingerprint over nodes fed dependencies-first.
pub struct FingerprintBuilder {
    hasher: Hasher,
    scopes: Vec<HashMap<NodeId, u64>>,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
            scopes: vec![HashMap::new()],
        }
    }

    fn scope(&mut self) -> &mut HashMap<NodeId, u64> {
        if self.scopes.is_empty() {
            self.scopes.push(HashMap::new());
        }
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    /// Start a node record. Its position in the current scope stands in for
    /// `id` in later dependency records.
    pub fn node(&mut self, id: NodeId, type_id: i64) {
        let scope = self.scope();
        let position = scope.len() as u64;
        scope.insert(id, position);
        self.hasher.update(&[TAG_NODE]);
        self.hasher.update(&type_id.to_le_bytes());
    }

    /// Edge from the current node to an already fed node of the same scope.
    pub fn dependency(&mut self, dep: NodeId) -> Result<()> {
        let position = self.scope().get(&dep).copied().ok_or_else(|| {
            Error::Hash(format!("dependency {} was not fed before its dependent", dep.get()))
        })?;
        self.hasher.update(&[TAG_DEPENDENCY]);
        self.hasher.update(&position.to_le_bytes());
        Ok(())
    }

    /// Payload of the current node as canonical JSON.
    pub fn payload<T: Serialize>(&mut self, payload: &T) -> Result<()> {
        self.hasher.update(&[TAG_PAYLOAD]);
        self.write_json(payload)
    }

    /// Enter a nested body; positions restart at zero inside it.
    pub fn open_scope(&mut self) {
        self.hasher.update(&[TAG_OPEN]);
        self.scopes.push(HashMap::new());
    }

    pub fn close_scope(&mut self) {
        self.hasher.update(&[TAG_CLOSE]);
        self.scopes.pop();
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }

    fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::Hash(e.to_string()))?;
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(&bytes);
        Ok(())
    }
}
