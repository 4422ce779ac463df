//! Decoders for the chunk filter pipeline.
//!
//! A pipeline message lists filters in stored order; a chunk's 32-bit mask
//! can suppress individual filters for that chunk only. Decoders are looked
//! up by filter ID in a registry callers may extend.

use std::collections::BTreeMap;

use log::trace;
use miniz_oxide::inflate;

use crate::error::Error;
use crate::parse::header::FilterPipeline;

/// Filter ID 1: deflate, in zlib or gzip framing.
pub const FILTER_DEFLATE: u16 = 1;

/// A decoder for one filter ID.
pub trait ChunkFilter {
    fn name(&self) -> &'static str;
    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, Error>;
}

pub struct FilterRegistry {
    decoders: BTreeMap<u16, Box<dyn ChunkFilter>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map()
            .entries(self.decoders.iter().map(|(id, d)| (id, d.name())))
            .finish()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = FilterRegistry {
            decoders: BTreeMap::new(),
        };
        registry.register(FILTER_DEFLATE, Box::new(Deflate));
        registry
    }
}

impl FilterRegistry {
    /// Register (or replace) the decoder for a filter ID.
    pub fn register(&mut self, id: u16, decoder: Box<dyn ChunkFilter>) {
        self.decoders.insert(id, decoder);
    }

    /// Run a chunk's bytes through the pipeline, in stored order. Mask bit
    /// i suppresses filter i for this chunk. An unknown filter marked
    /// optional is skipped; otherwise it is fatal.
    pub fn apply(
        &self,
        pipeline: &FilterPipeline,
        filter_mask: u32,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let mut data = data;
        for (index, filter) in pipeline.filters.iter().enumerate() {
            if filter_mask >> index & 1 == 1 {
                trace!("filter {} suppressed by chunk mask", filter.id);
                continue;
            }
            match self.decoders.get(&filter.id) {
                Some(decoder) => {
                    trace!("applying filter {} ({})", filter.id, decoder.name());
                    data = decoder.decode(data)?;
                }
                None if filter.optional => {
                    trace!("skipping optional unknown filter {}", filter.id);
                }
                None => return Err(Error::UnsupportedFilter { id: filter.id }),
            }
        }
        Ok(data)
    }
}

struct Deflate;

impl ChunkFilter for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        if data.starts_with(&[0x1f, 0x8b]) {
            let body = strip_gzip_header(&data)?;
            finish(inflate::decompress_to_vec(body))
        } else {
            finish(inflate::decompress_to_vec_zlib(&data))
        }
    }
}

/// A chunk's stream may stop mid-block when the writer flushed early;
/// whatever decompressed is the payload.
fn finish(result: Result<Vec<u8>, inflate::DecompressError>) -> Result<Vec<u8>, Error> {
    use inflate::TINFLStatus;
    match result {
        Ok(data) => Ok(data),
        Err(e) if e.status == TINFLStatus::FailedCannotMakeProgress && !e.output.is_empty() => {
            Ok(e.output)
        }
        Err(e) => Err(Error::Malformed(format!("deflate stream: {:?}", e.status))),
    }
}

/// Skip an RFC 1952 member header, returning the raw deflate body (any
/// crc/length trailer is ignored by the decompressor once the final block
/// ends).
fn strip_gzip_header(data: &[u8]) -> Result<&[u8], Error> {
    let bad = |what: &str| Error::Malformed(format!("gzip framing: {}", what));
    if data.len() < 10 {
        return Err(bad("header truncated"));
    }
    if data[2] != 8 {
        return Err(bad("compression method is not deflate"));
    }
    let flags = data[3];
    let mut at = 10usize;
    if flags & 0x04 != 0 {
        let extra = data
            .get(at..at + 2)
            .map(|raw| u16::from_le_bytes([raw[0], raw[1]]) as usize)
            .ok_or_else(|| bad("extra field truncated"))?;
        at += 2 + extra;
    }
    for present in &[flags & 0x08 != 0, flags & 0x10 != 0] {
        // file name, then comment: NUL-terminated when present
        if *present {
            let nul = data
                .get(at..)
                .and_then(|rest| rest.iter().position(|b| *b == 0))
                .ok_or_else(|| bad("string field unterminated"))?;
            at += nul + 1;
        }
    }
    if flags & 0x02 != 0 {
        at += 2; // header crc
    }
    data.get(at..).ok_or_else(|| bad("body missing"))
}
