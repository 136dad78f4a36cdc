//! Runtime signal index cache.
//!
//! The publisher assigns each subscribed signal a 16-bit runtime alias,
//! the signal index, used in place of the 128-bit signal identifier in
//! on-wire measurement records. The cache is the bidirectional map
//! between aliases and `(signal id, source, id)` measurement keys.
//!
//! A cache belongs to exactly one subscription. A received
//! `UpdateSignalIndexCache` response replaces the active cache wholesale;
//! caches are never merged.

use std::collections::HashMap;

use uuid::Uuid;
use winnow::binary::be_u32;
use winnow::prelude::*;
use winnow::token::take;

use super::error::{Error, Result};

/// Bidirectional map between 16-bit runtime signal indices and
/// measurement keys.
#[derive(Debug, Clone, Default)]
pub struct SignalIndexCache {
    /// signal index -> position in the parallel lists.
    reference: HashMap<u16, usize>,
    signal_ids: Vec<Uuid>,
    sources: Vec<String>,
    ids: Vec<u32>,
    /// signal id -> signal index.
    signal_id_cache: HashMap<Uuid, u16>,
}

impl SignalIndexCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a measurement key to the cache. An existing mapping under the
    /// same index is overwritten; the publisher may re-use an index after
    /// removing it.
    pub fn add_measurement_key(
        &mut self,
        signal_index: u16,
        signal_id: Uuid,
        source: impl Into<String>,
        id: u32,
    ) {
        let position = self.signal_ids.len();
        self.reference.insert(signal_index, position);
        self.signal_ids.push(signal_id);
        self.sources.push(source.into());
        self.ids.push(id);
        self.signal_id_cache.insert(signal_id, signal_index);
    }

    /// Empty the cache.
    pub fn clear(&mut self) {
        self.reference.clear();
        self.signal_ids.clear();
        self.sources.clear();
        self.ids.clear();
        self.signal_id_cache.clear();
    }

    /// Whether the given runtime index exists in the cache.
    pub fn contains(&self, signal_index: u16) -> bool {
        self.reference.contains_key(&signal_index)
    }

    /// Number of mapped signals.
    pub fn len(&self) -> usize {
        self.reference.len()
    }

    /// Whether the cache maps no signals.
    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    /// The globally unique signal ID for a runtime index.
    pub fn signal_id(&self, signal_index: u16) -> Option<Uuid> {
        self.reference
            .get(&signal_index)
            .map(|&position| self.signal_ids[position])
    }

    /// The source half of the measurement key for a runtime index.
    pub fn source(&self, signal_index: u16) -> Option<&str> {
        self.reference
            .get(&signal_index)
            .map(|&position| self.sources[position].as_str())
    }

    /// The numeric half of the measurement key for a runtime index.
    pub fn id(&self, signal_index: u16) -> Option<u32> {
        self.reference
            .get(&signal_index)
            .map(|&position| self.ids[position])
    }

    /// The complete measurement key for a runtime index.
    pub fn measurement_key(&self, signal_index: u16) -> Option<(Uuid, &str, u32)> {
        self.reference.get(&signal_index).map(|&position| {
            (
                self.signal_ids[position],
                self.sources[position].as_str(),
                self.ids[position],
            )
        })
    }

    /// The runtime index assigned to a signal ID.
    pub fn signal_index_of(&self, signal_id: Uuid) -> Option<u16> {
        self.signal_id_cache.get(&signal_id).copied()
    }

    /// Iterate over `(signal index, signal id, source, id)` entries in
    /// unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, Uuid, &str, u32)> {
        self.reference.iter().map(|(&index, &position)| {
            (
                index,
                self.signal_ids[position],
                self.sources[position].as_str(),
                self.ids[position],
            )
        })
    }

    /// Parse the body of an `UpdateSignalIndexCache` response, after any
    /// GZip decompression. Returns the cache and the subscriber UUID the
    /// publisher assigned to this connection.
    pub fn parse(body: &[u8]) -> Result<(Self, Uuid)> {
        cache_body
            .parse(body)
            .map_err(|e| Error::malformed("signal index cache", e.to_string()))
    }

    /// Serialize into the `UpdateSignalIndexCache` wire body, before any
    /// GZip compression.
    pub fn serialize(&self, subscriber_id: Uuid) -> Vec<u8> {
        let mut records = Vec::new();

        // Sorted for a deterministic wire image.
        let mut indices: Vec<u16> = self.reference.keys().copied().collect();
        indices.sort_unstable();

        for index in &indices {
            let position = self.reference[index];
            let source = self.sources[position].as_bytes();

            records.extend_from_slice(&u32::from(*index).to_be_bytes());
            records.extend_from_slice(self.signal_ids[position].as_bytes());
            records.extend_from_slice(&(source.len() as u32).to_be_bytes());
            records.extend_from_slice(source);
            records.extend_from_slice(&self.ids[position].to_be_bytes());
        }

        let binary_length = 4 + records.len() + 16;
        let mut body = Vec::with_capacity(4 + binary_length);
        body.extend_from_slice(&(binary_length as u32).to_be_bytes());
        body.extend_from_slice(&(indices.len() as u32).to_be_bytes());
        body.extend_from_slice(&records);
        body.extend_from_slice(subscriber_id.as_bytes());
        body
    }
}

fn uuid_bytes(input: &mut &[u8]) -> ModalResult<Uuid> {
    let raw: &[u8] = take(16usize).parse_next(input)?;
    // Wire order is RFC 4122 big-endian, which is uuid's native layout.
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(raw);
    Ok(Uuid::from_bytes(bytes))
}

fn cache_body(input: &mut &[u8]) -> ModalResult<(SignalIndexCache, Uuid)> {
    let _binary_length = be_u32.parse_next(input)?;
    let reference_count = be_u32.parse_next(input)?;

    let mut cache = SignalIndexCache::new();

    for _ in 0..reference_count {
        let signal_index = be_u32.parse_next(input)? as u16;
        let signal_id = uuid_bytes.parse_next(input)?;
        let source_length = be_u32.parse_next(input)? as usize;
        let source: &[u8] = take(source_length).parse_next(input)?;
        let id = be_u32.parse_next(input)?;

        cache.add_measurement_key(
            signal_index,
            signal_id,
            String::from_utf8_lossy(source).into_owned(),
            id,
        );
    }

    let subscriber_id = uuid_bytes.parse_next(input)?;
    Ok((cache, subscriber_id))
}
