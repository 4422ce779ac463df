use std::collections::HashSet;
use std::convert::TryFrom;

use log::{debug, trace};
use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u24, le_u32, le_u64, le_u8};

use crate::checksum::lookup3;
use crate::error::{eof, Error};

pub type ParseResult<'a, O> =
    std::result::Result<(&'a [u8], O), nom::Err<nom::error::VerboseError<&'a [u8]>>>;

/// "No address" sentinel used for sibling pointers and unallocated storage.
pub const UNDEFINED_ADDRESS: u64 = u64::MAX;

pub const SIGNATURE: [u8; 8] = *b"\x89HDF\r\n\x1a\n";

/// Address widths and origin shared by every decoder that reads a file
/// offset. Built once from the superblock.
#[derive(Clone, Copy, Debug)]
pub struct FormatContext {
    pub offset_size: u8,
    pub length_size: u8,
    pub base_address: u64,
}

impl FormatContext {
    /// Absolute file position of a stored address.
    pub fn address(&self, relative: u64) -> u64 {
        self.base_address
            .checked_add(relative)
            .unwrap_or(UNDEFINED_ADDRESS)
    }
}

pub(crate) fn bit_flag(byte: u8, index: u8) -> bool {
    byte >> index & 1 == 1
}

/// Extract bits `lo..=hi` of one byte, low-order first.
pub(crate) fn bit_field(byte: u8, lo: u8, hi: u8) -> u8 {
    (u16::from(byte) >> lo & ((1 << (hi - lo + 1)) - 1)) as u8
}

/// Little-endian unsigned integer of 1, 2, 4, or 8 bytes.
pub(crate) fn var_uint<'a>(width: u8) -> impl Fn(&'a [u8]) -> ParseResult<'a, u64> {
    move |input: &'a [u8]| {
        let (input, raw) = take(width)(input)?;
        let mut value = 0u64;
        for (i, byte) in raw.iter().enumerate() {
            value |= u64::from(*byte) << (8 * i);
        }
        Ok((input, value))
    }
}

pub(crate) fn slice_at(contents: &[u8], address: u64) -> Result<&[u8], Error> {
    let start = usize::try_from(address).map_err(|_| eof())?;
    contents.get(start..).ok_or_else(eof)
}

pub(crate) fn slice_range(contents: &[u8], address: u64, length: u64) -> Result<&[u8], Error> {
    let start = usize::try_from(address).map_err(|_| eof())?;
    let length = usize::try_from(length).map_err(|_| eof())?;
    start
        .checked_add(length)
        .and_then(|end| contents.get(start..end))
        .ok_or_else(eof)
}

fn verify_checksum(
    structure: &'static str,
    covered: &[u8],
    stored: u32,
    verify: bool,
) -> Result<(), Error> {
    let computed = lookup3(covered, 0);
    if computed == stored {
        return Ok(());
    }
    if verify {
        Err(Error::ChecksumMismatch {
            structure,
            stored,
            computed,
        })
    } else {
        debug!(
            "ignoring {} checksum mismatch: stored {:#010x}, computed {:#010x}",
            structure, stored, computed
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Superblock

#[derive(Debug, Clone, PartialEq)]
pub struct Superblock {
    pub version: u8,
    pub offset_size: u8,
    pub length_size: u8,
    pub base_address: u64,
    pub end_of_file_address: u64,
    pub layout: SuperblockLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuperblockLayout {
    Legacy(LegacySuperblock),
    Modern(ModernSuperblock),
}

/// v0/v1 fields. Decoded for inspection only; the root symbol table entry
/// that follows them is left unread and data access is rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacySuperblock {
    pub free_space_version: u8,
    pub root_symbol_table_version: u8,
    pub shared_header_message_version: u8,
    pub group_leaf_k: u8,
    pub group_internal_k: u8,
    pub indexed_storage_internal_k: Option<u16>,
    pub free_space_address: u64,
    pub driver_information_address: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModernSuperblock {
    pub consistency: Option<ConsistencyFlags>,
    pub extension_address: u64,
    pub root_header_address: u64,
    pub checksum: u32,
}

/// v3 write-access bits; v2 stores the byte but defines no bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsistencyFlags {
    pub write_access: bool,
    pub write_multi_read_access: bool,
}

/// Find the signature at offset 0 or at 512 * 2^k.
pub fn locate_signature(contents: &[u8]) -> Result<usize, Error> {
    if contents.len() >= 8 && contents[..8] == SIGNATURE {
        return Ok(0);
    }
    let mut offset = 512usize;
    while offset + 8 <= contents.len() {
        if contents[offset..offset + 8] == SIGNATURE {
            return Ok(offset);
        }
        offset = match offset.checked_mul(2) {
            Some(next) => next,
            None => break,
        };
    }
    Err(Error::NotAnHdf5File)
}

/// Locate and decode the superblock. Returns the signature's byte offset
/// alongside the decoded fields.
pub fn read_superblock(contents: &[u8], verify_checksums: bool) -> Result<(usize, Superblock), Error> {
    let start = locate_signature(contents)?;
    debug!("signature at byte offset {}", start);
    let block = &contents[start..];
    let version = *block.get(8).ok_or_else(eof)?;
    let superblock = match version {
        0 | 1 => legacy_superblock(block)?.1,
        2 | 3 => {
            let (_, superblock) = modern_superblock(block)?;
            if let SuperblockLayout::Modern(modern) = &superblock.layout {
                let body_len = 12 + 4 * superblock.offset_size as usize;
                verify_checksum("superblock", &block[..body_len], modern.checksum, verify_checksums)?;
                if modern.extension_address != UNDEFINED_ADDRESS {
                    superblock_extension(contents, modern.extension_address);
                }
            }
            superblock
        }
        v => {
            return Err(Error::UnsupportedVersion {
                structure: "superblock",
                version: v,
            })
        }
    };
    validate_superblock(&superblock)?;
    Ok((start, superblock))
}

fn validate_superblock(superblock: &Superblock) -> Result<(), Error> {
    for &(what, value) in &[
        ("offset size", superblock.offset_size),
        ("length size", superblock.length_size),
    ] {
        if !matches!(value, 1 | 2 | 4 | 8) {
            return Err(Error::Malformed(format!("superblock {} {}", what, value)));
        }
    }
    if let SuperblockLayout::Legacy(legacy) = &superblock.layout {
        if legacy.group_leaf_k == 0 || legacy.group_internal_k == 0 {
            return Err(Error::Malformed("superblock group K constant is zero".into()));
        }
        if legacy.indexed_storage_internal_k == Some(0) {
            return Err(Error::Malformed(
                "superblock indexed storage K constant is zero".into(),
            ));
        }
    }
    Ok(())
}

fn legacy_superblock(input: &[u8]) -> ParseResult<Superblock> {
    context("superblock v0/v1", |input| {
        let (input, _) = tag(&SIGNATURE[..])(input)?;
        let (input, version) = le_u8(input)?;
        let (input, free_space_version) = le_u8(input)?;
        let (input, root_symbol_table_version) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, shared_header_message_version) = le_u8(input)?;
        let (input, offset_size) = le_u8(input)?;
        let (input, length_size) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, group_leaf_k) = le_u8(input)?;
        let (input, group_internal_k) = le_u8(input)?;
        let (input, _) = take(4usize)(input)?; // consistency flags, unused pre-v2
        let (input, indexed_storage_internal_k) = if version == 1 {
            let (input, k) = le_u16(input)?;
            let (input, _) = tag([0, 0])(input)?;
            (input, Some(k))
        } else {
            (input, None)
        };
        let (input, base_address) = var_uint(offset_size)(input)?;
        let (input, free_space_address) = var_uint(offset_size)(input)?;
        let (input, end_of_file_address) = var_uint(offset_size)(input)?;
        let (input, driver_information_address) = var_uint(offset_size)(input)?;
        // The root symbol table entry follows; it is only reachable through
        // v1 group machinery this reader does not implement.
        Ok((
            input,
            Superblock {
                version,
                offset_size,
                length_size,
                base_address,
                end_of_file_address,
                layout: SuperblockLayout::Legacy(LegacySuperblock {
                    free_space_version,
                    root_symbol_table_version,
                    shared_header_message_version,
                    group_leaf_k,
                    group_internal_k,
                    indexed_storage_internal_k,
                    free_space_address,
                    driver_information_address,
                }),
            },
        ))
    })(input)
}

fn modern_superblock(input: &[u8]) -> ParseResult<Superblock> {
    context("superblock v2/v3", |input| {
        let (input, _) = tag(&SIGNATURE[..])(input)?;
        let (input, version) = le_u8(input)?;
        let (input, offset_size) = le_u8(input)?;
        let (input, length_size) = le_u8(input)?;
        let (input, consistency_raw) = le_u8(input)?;
        let consistency = if version == 3 {
            Some(ConsistencyFlags {
                write_access: bit_flag(consistency_raw, 0),
                write_multi_read_access: bit_flag(consistency_raw, 2),
            })
        } else {
            None
        };
        let (input, base_address) = var_uint(offset_size)(input)?;
        let (input, extension_address) = var_uint(offset_size)(input)?;
        let (input, end_of_file_address) = var_uint(offset_size)(input)?;
        let (input, root_header_address) = var_uint(offset_size)(input)?;
        let (input, checksum) = le_u32(input)?;
        Ok((
            input,
            Superblock {
                version,
                offset_size,
                length_size,
                base_address,
                end_of_file_address,
                layout: SuperblockLayout::Modern(ModernSuperblock {
                    consistency,
                    extension_address,
                    root_header_address,
                    checksum,
                }),
            },
        ))
    })(input)
}

/// Superblock extensions hold shared-message tables and similar metadata
/// this reader does not consume.
fn superblock_extension(_contents: &[u8], address: u64) {
    debug!("superblock extension at {:#x} skipped", address);
}

// ---------------------------------------------------------------------------
// Object headers

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaderFlags {
    pub chunk0_size_width: u8,
    pub track_attribute_order: bool,
    pub index_attribute_order: bool,
    pub attribute_storage_bounds: bool,
    pub timestamps: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamps {
    pub access: u32,
    pub modification: u32,
    pub change: u32,
    pub birth: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHeaderPrefix {
    pub flags: HeaderFlags,
    pub timestamps: Option<Timestamps>,
    /// (max compact, min dense) attribute counts, when stored.
    pub attribute_storage_bounds: Option<(u16, u16)>,
    pub chunk0_size: u64,
}

/// One decoded group-or-dataset node: its prefix and every message,
/// including messages pulled in through continuation blocks.
#[derive(Debug)]
pub struct ObjectHeader {
    /// Absolute file address; the node's identity.
    pub address: u64,
    pub prefix: ObjectHeaderPrefix,
    pub messages: Vec<HeaderMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMessage {
    pub msgtype: u8,
    pub flags: u8,
    pub creation_order: Option<u16>,
    pub message: header::Message,
}

fn header_flags(input: &[u8]) -> ParseResult<HeaderFlags> {
    let (input, raw) = le_u8(input)?;
    Ok((
        input,
        HeaderFlags {
            chunk0_size_width: 1 << bit_field(raw, 0, 1),
            track_attribute_order: bit_flag(raw, 2),
            index_attribute_order: bit_flag(raw, 3),
            attribute_storage_bounds: bit_flag(raw, 4),
            timestamps: bit_flag(raw, 5),
        },
    ))
}

fn object_header_prefix(input: &[u8]) -> ParseResult<ObjectHeaderPrefix> {
    context("object header prefix", |input| {
        let (input, _) = tag(b"OHDR")(input)?;
        let (input, _) = tag([2])(input)?;
        let (input, flags) = header_flags(input)?;
        let (input, timestamps) = if flags.timestamps {
            let (input, access) = le_u32(input)?;
            let (input, modification) = le_u32(input)?;
            let (input, change) = le_u32(input)?;
            let (input, birth) = le_u32(input)?;
            (
                input,
                Some(Timestamps {
                    access,
                    modification,
                    change,
                    birth,
                }),
            )
        } else {
            (input, None)
        };
        let (input, attribute_storage_bounds) = if flags.attribute_storage_bounds {
            let (input, max_compact) = le_u16(input)?;
            let (input, min_dense) = le_u16(input)?;
            (input, Some((max_compact, min_dense)))
        } else {
            (input, None)
        };
        let (input, chunk0_size) = var_uint(flags.chunk0_size_width)(input)?;
        Ok((
            input,
            ObjectHeaderPrefix {
                flags,
                timestamps,
                attribute_storage_bounds,
                chunk0_size,
            },
        ))
    })(input)
}

/// Decode the object header at an absolute file address, following its
/// continuation messages.
pub fn read_object_header(
    contents: &[u8],
    ctx: &FormatContext,
    address: u64,
    verify_checksums: bool,
) -> Result<ObjectHeader, Error> {
    let start = slice_at(contents, address)?;
    if !start.starts_with(b"OHDR") {
        // v1 prefixes start directly with their version byte.
        let version = *start.first().ok_or_else(eof)?;
        return Err(if version == 1 {
            Error::UnsupportedVersion {
                structure: "object header prefix",
                version,
            }
        } else {
            Error::Malformed(format!("object header prefix version {}", version))
        });
    }
    let (after_prefix, prefix) = object_header_prefix(start)?;
    let prefix_len = start.len() - after_prefix.len();
    let chunk0_size = usize::try_from(prefix.chunk0_size).map_err(|_| eof())?;
    if chunk0_size < 4 {
        return Err(Error::Malformed(format!(
            "object header chunk 0 size {} cannot hold its checksum",
            chunk0_size
        )));
    }
    let message_len = chunk0_size - 4;
    let block = after_prefix.get(..message_len).ok_or_else(eof)?;
    let stored = checksum_trailer(after_prefix, message_len)?;
    verify_checksum(
        "object header",
        &start[..prefix_len + message_len],
        stored,
        verify_checksums,
    )?;
    debug!(
        "object header at {:#x}: {} message bytes",
        address, message_len
    );

    let tracked = prefix.flags.track_attribute_order;
    let mut messages = Vec::new();
    message_block(block, ctx, tracked, &mut messages)?;

    // Follow continuation segments in discovery order; continuations found
    // inside a continuation join the back of the queue.
    let mut followed = HashSet::new();
    let mut scanned = 0;
    loop {
        let pending: Vec<(u64, u64)> = messages[scanned..]
            .iter()
            .filter_map(|m| match &m.message {
                header::Message::HeaderContinuation(c) => Some((c.offset, c.length)),
                _ => None,
            })
            .collect();
        scanned = messages.len();
        if pending.is_empty() {
            break;
        }
        for (offset, length) in pending {
            if !followed.insert(offset) {
                return Err(Error::Malformed(format!(
                    "continuation block at {:#x} referenced twice",
                    offset
                )));
            }
            if length < 4 {
                return Err(Error::Malformed(format!(
                    "continuation block length {} cannot hold its checksum",
                    length
                )));
            }
            let segment = slice_range(contents, ctx.address(offset), length)?;
            let body_len = segment.len() - 4;
            let stored = checksum_trailer(segment, body_len)?;
            verify_checksum("continuation block", &segment[..body_len], stored, verify_checksums)?;
            message_block(&segment[..body_len], ctx, tracked, &mut messages)?;
        }
    }

    Ok(ObjectHeader {
        address,
        prefix,
        messages,
    })
}

fn checksum_trailer(bytes: &[u8], at: usize) -> Result<u32, Error> {
    let raw = bytes.get(at..at + 4).ok_or_else(eof)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Decode one message block. Each message's payload is exactly `data_size`
/// bytes; the typed decoders see only that sub-slice, so the next message
/// always starts at `header_size + data_size` no matter how much a decoder
/// consumed.
fn message_block(
    mut block: &[u8],
    ctx: &FormatContext,
    creation_order_tracked: bool,
    messages: &mut Vec<HeaderMessage>,
) -> Result<(), Error> {
    while !block.is_empty() {
        let (rest, msgtype) = le_u8(block)?;
        let (rest, data_size) = le_u16(rest)?;
        let (rest, flags) = le_u8(rest)?;
        let (rest, creation_order) = if creation_order_tracked {
            let (rest, order) = le_u16(rest)?;
            (rest, Some(order))
        } else {
            (rest, None)
        };
        let (rest, payload) = take(data_size)(rest)?;
        let message = if bit_flag(flags, 1) {
            header::Message::Shared(shared_message(payload, ctx)?)
        } else {
            decode_message(msgtype, payload, ctx)?
        };
        trace!("message type {}, {} payload bytes", msgtype, data_size);
        messages.push(HeaderMessage {
            msgtype,
            flags,
            creation_order,
            message,
        });
        block = rest;
    }
    Ok(())
}

fn decode_message(msgtype: u8, payload: &[u8], ctx: &FormatContext) -> Result<header::Message, Error> {
    use header::Message;
    Ok(match msgtype {
        0x0 => Message::Nil,
        0x1 => Message::Dataspace(dataspace(payload, ctx)?),
        0x2 => Message::LinkInfo(link_info(payload, ctx)?),
        0x3 => Message::Datatype(datatype(payload)?),
        0x5 => Message::FillValue(fill_value(payload)?),
        0x6 => Message::Link(link(payload, ctx)?),
        0x8 => Message::DataLayout(data_layout(payload, ctx)?),
        0xB => Message::FilterPipeline(filter_pipeline(payload)?),
        0x10 => Message::HeaderContinuation(header_continuation(payload, ctx)?),
        _ => Message::Unknown {
            msgtype,
            bytes: payload.to_vec(),
        },
    })
}

pub mod header {
    /// The closed set of message payloads this reader decodes. Anything
    /// else is carried as `Unknown` and never fatal.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Message {
        Nil,
        Dataspace(Dataspace),
        LinkInfo(LinkInfo),
        Datatype(Datatype),
        FillValue(FillValue),
        Link(Link),
        DataLayout(DataLayout),
        FilterPipeline(FilterPipeline),
        HeaderContinuation(HeaderContinuation),
        Shared(SharedMessage),
        Unknown { msgtype: u8, bytes: Vec<u8> },
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Dataspace {
        pub version: u8,
        pub dimensionality: u8,
        /// v2 stores an explicit space type byte; v1 has none.
        pub space_type: Option<u8>,
        pub dimensions: Vec<u64>,
        pub max_dimensions: Option<Vec<u64>>,
        pub permutation_indices: Option<Vec<u64>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct LinkInfo {
        pub track_creation_order: bool,
        pub index_creation_order: bool,
        pub max_creation_index: Option<u64>,
        pub fractal_heap_address: u64,
        pub name_index_btree_address: u64,
        pub order_index_btree_address: Option<u64>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DatatypeClass {
        FixedPoint,
        FloatingPoint,
        Time,
        String,
        BitField,
        Opaque,
        Compound,
        Reference,
        Enumerated,
        VariableLength,
        Array,
    }

    impl DatatypeClass {
        pub fn code(self) -> u8 {
            match self {
                DatatypeClass::FixedPoint => 0,
                DatatypeClass::FloatingPoint => 1,
                DatatypeClass::Time => 2,
                DatatypeClass::String => 3,
                DatatypeClass::BitField => 4,
                DatatypeClass::Opaque => 5,
                DatatypeClass::Compound => 6,
                DatatypeClass::Reference => 7,
                DatatypeClass::Enumerated => 8,
                DatatypeClass::VariableLength => 9,
                DatatypeClass::Array => 10,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Datatype {
        pub version: u8,
        pub class: DatatypeClass,
        /// 24 class-dependent bits, low-order first.
        pub bitfields: u32,
        pub size: u32,
        pub properties: Vec<u8>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct FillValue {
        pub version: u8,
        pub space_allocation_time: u8,
        pub write_time: u8,
        pub defined: bool,
        pub value: Option<Vec<u8>>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Charset {
        Ascii,
        Utf8,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum LinkTarget {
        /// Address of the linked object header, relative to the base address.
        Hard { address: u64 },
        /// A stored path, uninterpreted.
        Soft { path: String },
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Link {
        pub name: String,
        pub charset: Charset,
        pub creation_order: Option<u64>,
        pub target: LinkTarget,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum DataLayout {
        /// Element bytes stored inline in the message.
        Compact { data: Vec<u8> },
        Contiguous {
            address: u64,
            size: u64,
        },
        Chunked {
            btree_address: u64,
            /// As declared in the message: chunk rank plus the trailing
            /// element-size slot. B-tree keys carry exactly this many
            /// coordinates.
            dimensionality: u8,
            chunk_dimensions: Vec<u32>,
            element_size: u32,
        },
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct FilterDescription {
        pub id: u16,
        pub name: Option<String>,
        pub optional: bool,
        pub flags: u16,
        pub client_data: Vec<u32>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct FilterPipeline {
        pub version: u8,
        pub filters: Vec<FilterDescription>,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct HeaderContinuation {
        pub offset: u64,
        pub length: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum SharedLocation {
        /// Object header address holding the original message.
        Address(u64),
        /// Heap identifier, for v3 heap-stored messages.
        Heap(u64),
    }

    /// Pointer to a message stored elsewhere. Recorded, not dereferenced.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct SharedMessage {
        pub version: u8,
        pub original_type: u8,
        pub location: SharedLocation,
    }
}

fn dataspace(payload: &[u8], ctx: &FormatContext) -> Result<header::Dataspace, Error> {
    let (rest, version) = le_u8(payload)?;
    let (rest, dimensionality, flags, space_type) = match version {
        1 => {
            let (rest, dimensionality) = le_u8(rest)?;
            let (rest, flags) = le_u8(rest)?;
            let (rest, _) = take(5usize)(rest)?; // 1 reserved byte + 4 unused
            (rest, dimensionality, flags, None)
        }
        2 => {
            let (rest, dimensionality) = le_u8(rest)?;
            let (rest, flags) = le_u8(rest)?;
            let (rest, space_type) = le_u8(rest)?;
            (rest, dimensionality, flags, Some(space_type))
        }
        v => {
            return Err(Error::UnsupportedVersion {
                structure: "dataspace",
                version: v,
            })
        }
    };
    let dims = count(var_uint(ctx.length_size), dimensionality as usize);
    let (rest, dimensions) = dims(rest)?;
    let (rest, max_dimensions) = if bit_flag(flags, 0) {
        let (rest, max) = count(var_uint(ctx.length_size), dimensionality as usize)(rest)?;
        (rest, Some(max))
    } else {
        (rest, None)
    };
    let permutation_indices = if version == 1 && bit_flag(flags, 1) {
        let (_, indices) = count(var_uint(ctx.length_size), dimensionality as usize)(rest)?;
        Some(indices)
    } else {
        None
    };
    Ok(header::Dataspace {
        version,
        dimensionality,
        space_type,
        dimensions,
        max_dimensions,
        permutation_indices,
    })
}

fn link_info(payload: &[u8], ctx: &FormatContext) -> Result<header::LinkInfo, Error> {
    let (rest, version) = le_u8(payload)?;
    if version != 0 {
        return Err(Error::UnsupportedVersion {
            structure: "link info",
            version,
        });
    }
    let (rest, flags) = le_u8(rest)?;
    let track_creation_order = bit_flag(flags, 0);
    let index_creation_order = bit_flag(flags, 1);
    let (rest, max_creation_index) = if track_creation_order {
        let (rest, index) = le_u64(rest)?;
        (rest, Some(index))
    } else {
        (rest, None)
    };
    let (rest, fractal_heap_address) = var_uint(ctx.offset_size)(rest)?;
    let (rest, name_index_btree_address) = var_uint(ctx.offset_size)(rest)?;
    let order_index_btree_address = if index_creation_order {
        let (_, address) = var_uint(ctx.offset_size)(rest)?;
        Some(address)
    } else {
        None
    };
    Ok(header::LinkInfo {
        track_creation_order,
        index_creation_order,
        max_creation_index,
        fractal_heap_address,
        name_index_btree_address,
        order_index_btree_address,
    })
}

fn datatype(payload: &[u8]) -> Result<header::Datatype, Error> {
    use header::DatatypeClass::*;
    let (rest, class_and_version) = le_u8(payload)?;
    let version = class_and_version >> 4;
    if !(1..=3).contains(&version) {
        return Err(Error::UnsupportedVersion {
            structure: "datatype",
            version,
        });
    }
    let raw_class = class_and_version & 0b0000_1111;
    let class = match raw_class {
        0 => FixedPoint,
        1 => FloatingPoint,
        2 => Time,
        3 => header::DatatypeClass::String,
        4 => BitField,
        5 => Opaque,
        6 => Compound,
        7 => Reference,
        8 => Enumerated,
        9 => VariableLength,
        10 => Array,
        _ => return Err(Error::Malformed(format!("datatype class {}", raw_class))),
    };
    let (rest, bitfields) = le_u24(rest)?;
    let (rest, size) = le_u32(rest)?;
    Ok(header::Datatype {
        version,
        class,
        bitfields,
        size,
        properties: rest.to_vec(),
    })
}

fn fill_value(payload: &[u8]) -> Result<header::FillValue, Error> {
    let (rest, version) = le_u8(payload)?;
    match version {
        2 => {
            let (rest, space_allocation_time) = le_u8(rest)?;
            let (rest, write_time) = le_u8(rest)?;
            let (rest, defined) = le_u8(rest)?;
            let value = if defined > 0 {
                let (rest, size) = le_u32(rest)?;
                let (_, raw) = take(size)(rest)?;
                Some(raw.to_vec())
            } else {
                None
            };
            Ok(header::FillValue {
                version,
                space_allocation_time,
                write_time,
                defined: defined > 0,
                value,
            })
        }
        3 => {
            let (rest, flags) = le_u8(rest)?;
            let undefined = bit_flag(flags, 4);
            let defined = bit_flag(flags, 5);
            if undefined && defined {
                return Err(Error::Malformed(
                    "fill value flagged both defined and undefined".into(),
                ));
            }
            let value = if defined {
                let (rest, size) = le_u32(rest)?;
                let (_, raw) = take(size)(rest)?;
                Some(raw.to_vec())
            } else {
                None
            };
            Ok(header::FillValue {
                version,
                space_allocation_time: bit_field(flags, 0, 1),
                write_time: bit_field(flags, 2, 3),
                defined,
                value,
            })
        }
        v => Err(Error::UnsupportedVersion {
            structure: "fill value",
            version: v,
        }),
    }
}

fn link(payload: &[u8], ctx: &FormatContext) -> Result<header::Link, Error> {
    use header::{Charset, LinkTarget};
    let (rest, version) = le_u8(payload)?;
    if version != 1 {
        return Err(Error::UnsupportedVersion {
            structure: "link",
            version,
        });
    }
    let (rest, flags) = le_u8(rest)?;
    let name_length_width = 1u8 << bit_field(flags, 0, 1);
    let (rest, link_type) = if bit_flag(flags, 3) {
        le_u8(rest)?
    } else {
        (rest, 0) // absent means hard
    };
    let (rest, creation_order) = if bit_flag(flags, 2) {
        let (rest, order) = le_u64(rest)?;
        (rest, Some(order))
    } else {
        (rest, None)
    };
    let (rest, charset) = if bit_flag(flags, 4) {
        let (rest, raw) = le_u8(rest)?;
        let charset = match raw {
            0 => Charset::Ascii,
            1 => Charset::Utf8,
            other => return Err(Error::Malformed(format!("link name charset {}", other))),
        };
        (rest, charset)
    } else {
        (rest, Charset::Ascii)
    };
    let (rest, name_length) = var_uint(name_length_width)(rest)?;
    let name_length = usize::try_from(name_length).map_err(|_| eof())?;
    let (rest, name_raw) = take(name_length)(rest)?;
    let name = String::from_utf8(name_raw.to_vec())
        .map_err(|_| Error::Malformed("link name is not valid UTF-8".into()))?;
    let target = match link_type {
        0 => {
            let (_, address) = var_uint(ctx.offset_size)(rest)?;
            LinkTarget::Hard { address }
        }
        1 => {
            let (rest, path_length) = le_u16(rest)?;
            let (_, path_raw) = take(path_length)(rest)?;
            let path = String::from_utf8(path_raw.to_vec())
                .map_err(|_| Error::Malformed("soft link path is not valid UTF-8".into()))?;
            LinkTarget::Soft { path }
        }
        kind => return Err(Error::UnsupportedLink { kind }),
    };
    Ok(header::Link {
        name,
        charset,
        creation_order,
        target,
    })
}

fn data_layout(payload: &[u8], ctx: &FormatContext) -> Result<header::DataLayout, Error> {
    let (rest, version) = le_u8(payload)?;
    if version != 3 {
        return Err(Error::UnsupportedVersion {
            structure: "data layout",
            version,
        });
    }
    let (rest, layout_class) = le_u8(rest)?;
    match layout_class {
        0 => {
            let (rest, size) = le_u16(rest)?;
            let (_, data) = take(size)(rest)?;
            Ok(header::DataLayout::Compact {
                data: data.to_vec(),
            })
        }
        1 => {
            let (rest, address) = var_uint(ctx.offset_size)(rest)?;
            let (_, size) = var_uint(ctx.length_size)(rest)?;
            Ok(header::DataLayout::Contiguous { address, size })
        }
        2 => {
            let (rest, dimensionality) = le_u8(rest)?;
            if dimensionality == 0 {
                return Err(Error::Malformed("chunked layout with zero dimensions".into()));
            }
            let (rest, btree_address) = var_uint(ctx.offset_size)(rest)?;
            // The last declared dimension is the element-size slot, stored
            // separately below.
            let (rest, chunk_dimensions) = count(le_u32, dimensionality as usize - 1)(rest)?;
            let (_, element_size) = le_u32(rest)?;
            Ok(header::DataLayout::Chunked {
                btree_address,
                dimensionality,
                chunk_dimensions,
                element_size,
            })
        }
        c => Err(Error::Malformed(format!("data layout class {}", c))),
    }
}

fn filter_pipeline(payload: &[u8]) -> Result<header::FilterPipeline, Error> {
    let (rest, version) = le_u8(payload)?;
    let (rest, filter_count) = le_u8(rest)?;
    let mut rest = match version {
        1 => take(6usize)(rest)?.0, // 2 + 4 reserved bytes
        2 => rest,
        v => {
            return Err(Error::UnsupportedVersion {
                structure: "filter pipeline",
                version: v,
            })
        }
    };
    let mut filters = Vec::with_capacity(filter_count as usize);
    for _ in 0..filter_count {
        let (r, id) = le_u16(rest)?;
        let named = version == 1 || id >= 256;
        let (r, name_length) = if named { le_u16(r)? } else { (r, 0) };
        let (r, flags) = le_u16(r)?;
        let (r, value_count) = le_u16(r)?;
        let (r, name_raw) = take(name_length)(r)?;
        let name = if name_length > 0 {
            let trimmed: Vec<u8> = name_raw.iter().take_while(|b| **b != 0).copied().collect();
            Some(
                String::from_utf8(trimmed)
                    .map_err(|_| Error::Malformed("filter name is not valid UTF-8".into()))?,
            )
        } else {
            None
        };
        let (r, client_data) = count(le_u32, value_count as usize)(r)?;
        let r = if version == 1 && value_count % 2 == 1 {
            take(4usize)(r)?.0 // pad to an 8-byte boundary
        } else {
            r
        };
        filters.push(header::FilterDescription {
            id,
            name,
            optional: flags & 1 == 1,
            flags,
            client_data,
        });
        rest = r;
    }
    Ok(header::FilterPipeline { version, filters })
}

fn header_continuation(
    payload: &[u8],
    ctx: &FormatContext,
) -> Result<header::HeaderContinuation, Error> {
    let (rest, offset) = var_uint(ctx.offset_size)(payload)?;
    let (_, length) = var_uint(ctx.length_size)(rest)?;
    Ok(header::HeaderContinuation { offset, length })
}

fn shared_message(payload: &[u8], ctx: &FormatContext) -> Result<header::SharedMessage, Error> {
    use header::SharedLocation;
    let (rest, version) = le_u8(payload)?;
    match version {
        1 => {
            let (rest, original_type) = le_u8(rest)?;
            let (rest, _) = take(6usize)(rest)?; // 2 + 4 reserved bytes
            let (_, address) = var_uint(ctx.offset_size)(rest)?;
            Ok(header::SharedMessage {
                version,
                original_type,
                location: SharedLocation::Address(address),
            })
        }
        2 => {
            let (rest, original_type) = le_u8(rest)?;
            let (_, address) = var_uint(ctx.offset_size)(rest)?;
            Ok(header::SharedMessage {
                version,
                original_type,
                location: SharedLocation::Address(address),
            })
        }
        3 => {
            let (rest, original_type) = le_u8(rest)?;
            let location = if original_type == 1 {
                let (_, heap_id) = le_u64(rest)?;
                SharedLocation::Heap(heap_id)
            } else {
                let (_, address) = var_uint(ctx.offset_size)(rest)?;
                SharedLocation::Address(address)
            };
            Ok(header::SharedMessage {
                version,
                original_type,
                location,
            })
        }
        v => Err(Error::UnsupportedVersion {
            structure: "shared message",
            version: v,
        }),
    }
}
