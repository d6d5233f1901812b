//! Collection resource id decoding.
//!
//! The service identifies collections with a base64 resource id in which
//! `/` is transmitted as `-`. The first eight decoded bytes are the
//! database id and the collection id, both little-endian `u32`.

use crate::error::ResourceIdError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::str::FromStr;

/// 64-bit unique collection id (database id in the high 32 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Build from database and collection ids.
    pub fn from_parts(database: u32, collection: u32) -> Self {
        Self(((database as u64) << 32) | collection as u64)
    }

    /// Decode a collection (or child resource) id.
    pub fn parse(text: &str) -> Result<Self, ResourceIdError> {
        let normalized = text.replace('-', "/");
        let bytes = STANDARD
            .decode(normalized.as_bytes())
            .map_err(|_| ResourceIdError::InvalidEncoding(text.to_string()))?;

        if bytes.len() < 8 {
            return Err(ResourceIdError::InvalidLength {
                id: text.to_string(),
                len: bytes.len(),
            });
        }

        let database = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let collection = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self::from_parts(database, collection))
    }

    /// The unique collection id.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The database part.
    pub fn database(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The collection part.
    pub fn collection(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.database().to_le_bytes());
        bytes[4..].copy_from_slice(&self.collection().to_le_bytes());
        f.write_str(&STANDARD.encode(bytes).replace('/', "-"))
    }
}

impl FromStr for ResourceId {
    type Err = ResourceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
