//! Persisted plugin state.
//!
//! A state blob is the 4-byte magic `CBGS`, a little-endian `u32` format
//! version, and a JSON body holding the document text and the control
//! channel values. Restoring recompiles the document and reapplies the
//! values.

use serde::{Deserialize, Serialize};

use crate::error::StateError;

pub const STATE_MAGIC: [u8; 4] = *b"CBGS";
pub const STATE_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Document text and control channel values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub document: String,
    #[serde(default)]
    pub channels: Vec<(String, f64)>,
}

impl PluginState {
    pub fn new(document: impl Into<String>, channels: Vec<(String, f64)>) -> Self {
        Self {
            document: document.into(),
            channels,
        }
    }

    /// Encode as a state blob. Non-finite values are dropped since JSON
    /// cannot carry them.
    pub fn to_bytes(&self) -> Vec<u8> {
        let finite = PluginState {
            document: self.document.clone(),
            channels: self
                .channels
                .iter()
                .filter(|(_, v)| v.is_finite())
                .cloned()
                .collect(),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + finite.document.len() + 64);
        out.extend_from_slice(&STATE_MAGIC);
        out.extend_from_slice(&STATE_VERSION.to_le_bytes());
        // Serializing strings and finite floats into a Vec cannot fail.
        if let Err(err) = serde_json::to_writer(&mut out, &finite) {
            log::error!("failed to encode plugin state: {err}");
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        if bytes.len() < HEADER_LEN || bytes[..4] != STATE_MAGIC {
            return Err(StateError::BadMagic);
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..HEADER_LEN]);
        let version = u32::from_le_bytes(version);
        if version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_slice(&bytes[HEADER_LEN..])?)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}
