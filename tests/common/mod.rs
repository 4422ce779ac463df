//! Byte-level builders that assemble small but well-formed files for the
//! integration tests. Everything here writes 8-byte offsets and lengths.
#![allow(dead_code)]

use std::path::PathBuf;

use h5read::checksum::lookup3;

pub const UNDEFINED: u64 = u64::MAX;
pub const SUPERBLOCK_LEN: usize = 48;

pub const MSG_DATASPACE: u8 = 0x1;
pub const MSG_LINK_INFO: u8 = 0x2;
pub const MSG_DATATYPE: u8 = 0x3;
pub const MSG_FILL_VALUE: u8 = 0x5;
pub const MSG_LINK: u8 = 0x6;
pub const MSG_DATA_LAYOUT: u8 = 0x8;
pub const MSG_FILTER_PIPELINE: u8 = 0xB;
pub const MSG_CONTINUATION: u8 = 0x10;

/// Grows a file body behind a v2/v3 superblock; `finish` stamps the
/// superblock (checksum included) in front of it.
pub struct FileBuilder {
    sig_offset: usize,
    version: u8,
    body: Vec<u8>,
}

impl FileBuilder {
    pub fn new() -> Self {
        FileBuilder {
            sig_offset: 0,
            version: 2,
            body: Vec::new(),
        }
    }

    pub fn with_signature_offset(sig_offset: usize) -> Self {
        FileBuilder {
            sig_offset,
            version: 2,
            body: Vec::new(),
        }
    }

    pub fn superblock_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Address (relative to the base address) of the next appended byte.
    pub fn next_address(&self) -> u64 {
        (SUPERBLOCK_LEN + self.body.len()) as u64
    }

    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let address = self.next_address();
        self.body.extend_from_slice(bytes);
        address
    }

    pub fn finish(self, root_address: u64) -> Vec<u8> {
        let mut out = vec![0xab_u8; self.sig_offset];
        let eof = (self.sig_offset + SUPERBLOCK_LEN + self.body.len()) as u64;
        let mut sb = Vec::new();
        sb.extend_from_slice(b"\x89HDF\r\n\x1a\n");
        sb.push(self.version);
        sb.push(8); // offset size
        sb.push(8); // length size
        sb.push(0); // consistency
        sb.extend_from_slice(&(self.sig_offset as u64).to_le_bytes());
        sb.extend_from_slice(&UNDEFINED.to_le_bytes()); // no extension
        sb.extend_from_slice(&eof.to_le_bytes());
        sb.extend_from_slice(&root_address.to_le_bytes());
        let checksum = lookup3(&sb, 0);
        sb.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&sb);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn write(self, name: &str, root_address: u64) -> PathBuf {
        let bytes = self.finish(root_address);
        write_bytes(name, &bytes)
    }
}

pub fn write_bytes(name: &str, bytes: &[u8]) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("h5read-{}-{}.h5", std::process::id(), name));
    std::fs::write(&path, bytes).expect("failed to write test file");
    path
}

/// A v0 superblock followed by an (undecoded) root symbol table entry.
pub fn legacy_v0_file(name: &str) -> PathBuf {
    let mut sb = Vec::new();
    sb.extend_from_slice(b"\x89HDF\r\n\x1a\n");
    sb.push(0); // superblock version
    sb.push(0); // free space version
    sb.push(0); // root symbol table version
    sb.push(0); // reserved
    sb.push(0); // shared header message version
    sb.push(8); // offset size
    sb.push(8); // length size
    sb.push(0); // reserved
    sb.push(4); // group leaf K
    sb.push(16); // group internal K
    sb.extend_from_slice(&[0; 4]); // consistency flags
    sb.extend_from_slice(&0u64.to_le_bytes()); // base address
    sb.extend_from_slice(&UNDEFINED.to_le_bytes()); // free space
    sb.extend_from_slice(&1024u64.to_le_bytes()); // end of file
    sb.extend_from_slice(&UNDEFINED.to_le_bytes()); // driver information
    sb.extend_from_slice(&[0; 40]); // root symbol table entry, unread
    write_bytes(name, &sb)
}

/// Encodes a v2 object header; messages are added in order.
pub struct ObjectHeaderBuilder {
    track_order: bool,
    next_order: u16,
    messages: Vec<Vec<u8>>,
}

impl ObjectHeaderBuilder {
    pub fn new() -> Self {
        ObjectHeaderBuilder {
            track_order: false,
            next_order: 0,
            messages: Vec::new(),
        }
    }

    pub fn track_creation_order(mut self) -> Self {
        self.track_order = true;
        self
    }

    pub fn message(self, msgtype: u8, payload: &[u8]) -> Self {
        self.message_with_flags(msgtype, 0, payload)
    }

    pub fn message_with_flags(mut self, msgtype: u8, flags: u8, payload: &[u8]) -> Self {
        let mut record = Vec::new();
        record.push(msgtype);
        record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        record.push(flags);
        if self.track_order {
            record.extend_from_slice(&self.next_order.to_le_bytes());
            self.next_order += 1;
        }
        record.extend_from_slice(payload);
        self.messages.push(record);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let message_bytes: usize = self.messages.iter().map(Vec::len).sum();
        let chunk0_size = (message_bytes + 4) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"OHDR");
        out.push(2);
        let mut flags = 0b0000_0010_u8; // 4-byte chunk 0 size field
        if self.track_order {
            flags |= 0b0000_0100;
        }
        out.push(flags);
        out.extend_from_slice(&chunk0_size.to_le_bytes());
        for record in &self.messages {
            out.extend_from_slice(record);
        }
        let checksum = lookup3(&out, 0);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }
}

/// A continuation segment: message records plus the trailing checksum.
pub fn continuation_block(messages: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (msgtype, payload) in messages {
        body.push(*msgtype);
        body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        body.push(0);
        body.extend_from_slice(payload);
    }
    let checksum = lookup3(&body, 0);
    body.extend_from_slice(&checksum.to_le_bytes());
    body
}

// --------------------------------------------------------------------------
// Message payloads

pub fn dataspace_v2(dims: &[u64]) -> Vec<u8> {
    let mut p = vec![2, dims.len() as u8, 0, 1];
    for d in dims {
        p.extend_from_slice(&d.to_le_bytes());
    }
    p
}

pub fn datatype_fixed(size: u32, signed: bool) -> Vec<u8> {
    datatype_fixed_order(size, signed, false)
}

pub fn datatype_fixed_order(size: u32, signed: bool, big_endian: bool) -> Vec<u8> {
    let mut bitfields = 0u32;
    if big_endian {
        bitfields |= 1;
    }
    if signed {
        bitfields |= 1 << 3;
    }
    let mut p = vec![0x10]; // version 1, class 0
    p.extend_from_slice(&bitfields.to_le_bytes()[..3]);
    p.extend_from_slice(&size.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes()); // bit offset
    p.extend_from_slice(&((size * 8) as u16).to_le_bytes()); // precision
    p
}

pub fn datatype_float(size: u32) -> Vec<u8> {
    let mut p = vec![0x11]; // version 1, class 1
    p.extend_from_slice(&[0, 0, 0]); // little-endian IEEE
    p.extend_from_slice(&size.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes()); // bit offset
    p.extend_from_slice(&((size * 8) as u16).to_le_bytes()); // precision
    match size {
        4 => {
            p.extend_from_slice(&[23, 8, 0, 23]);
            p.extend_from_slice(&127u32.to_le_bytes());
        }
        _ => {
            p.extend_from_slice(&[52, 11, 0, 52]);
            p.extend_from_slice(&1023u32.to_le_bytes());
        }
    }
    p
}

pub fn datatype_string(size: u32) -> Vec<u8> {
    let mut p = vec![0x13]; // version 1, class 3
    p.extend_from_slice(&[0, 0, 0]);
    p.extend_from_slice(&size.to_le_bytes());
    p
}

pub fn fill_value_v3_undefined() -> Vec<u8> {
    vec![3, 0b0001_0010]
}

pub fn layout_compact(data: &[u8]) -> Vec<u8> {
    let mut p = vec![3, 0];
    p.extend_from_slice(&(data.len() as u16).to_le_bytes());
    p.extend_from_slice(data);
    p
}

pub fn layout_contiguous(address: u64, size: u64) -> Vec<u8> {
    let mut p = vec![3, 1];
    p.extend_from_slice(&address.to_le_bytes());
    p.extend_from_slice(&size.to_le_bytes());
    p
}

pub fn layout_chunked(btree_address: u64, chunk_dims: &[u32], element_size: u32) -> Vec<u8> {
    let mut p = vec![3, 2, (chunk_dims.len() + 1) as u8];
    p.extend_from_slice(&btree_address.to_le_bytes());
    for d in chunk_dims {
        p.extend_from_slice(&d.to_le_bytes());
    }
    p.extend_from_slice(&element_size.to_le_bytes());
    p
}

pub fn link_info() -> Vec<u8> {
    let mut p = vec![0, 0];
    p.extend_from_slice(&UNDEFINED.to_le_bytes()); // fractal heap
    p.extend_from_slice(&UNDEFINED.to_le_bytes()); // name index B-tree
    p
}

pub fn link_hard(name: &str, address: u64) -> Vec<u8> {
    let mut p = vec![1, 0b0000_1000, 0];
    p.push(name.len() as u8);
    p.extend_from_slice(name.as_bytes());
    p.extend_from_slice(&address.to_le_bytes());
    p
}

pub fn link_soft(name: &str, path: &str) -> Vec<u8> {
    let mut p = vec![1, 0b0000_1000, 1];
    p.push(name.len() as u8);
    p.extend_from_slice(name.as_bytes());
    p.extend_from_slice(&(path.len() as u16).to_le_bytes());
    p.extend_from_slice(path.as_bytes());
    p
}

pub fn link_external(name: &str) -> Vec<u8> {
    let mut p = vec![1, 0b0000_1000, 64];
    p.push(name.len() as u8);
    p.extend_from_slice(name.as_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

pub fn filter_pipeline_v2(id: u16, flags: u16) -> Vec<u8> {
    let mut p = vec![2, 1];
    p.extend_from_slice(&id.to_le_bytes());
    p.extend_from_slice(&flags.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes()); // zero client data values
    p
}

pub fn filter_pipeline_deflate() -> Vec<u8> {
    filter_pipeline_v2(1, 0)
}

pub fn continuation(offset: u64, length: u64) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&offset.to_le_bytes());
    p.extend_from_slice(&length.to_le_bytes());
    p
}

pub fn shared_v2(original_type: u8, address: u64) -> Vec<u8> {
    let mut p = vec![2, original_type];
    p.extend_from_slice(&address.to_le_bytes());
    p
}

// --------------------------------------------------------------------------
// Chunk B-tree nodes

pub struct ChunkSpec {
    pub size: u32,
    pub mask: u32,
    /// Chunk origin coordinates, including the trailing element slot.
    pub offsets: Vec<u64>,
    pub address: u64,
}

fn chunk_key(out: &mut Vec<u8>, size: u32, mask: u32, offsets: &[u64]) {
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&mask.to_le_bytes());
    for o in offsets {
        out.extend_from_slice(&o.to_le_bytes());
    }
}

/// A single leaf node holding every chunk of a dataset.
pub fn chunk_leaf(dimensionality: usize, entries: &[ChunkSpec]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"TREE");
    out.push(1); // raw data chunks
    out.push(0); // leaf
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&UNDEFINED.to_le_bytes());
    out.extend_from_slice(&UNDEFINED.to_le_bytes());
    let zeros = vec![0u64; dimensionality];
    match entries.first() {
        Some(e) => chunk_key(&mut out, e.size, e.mask, &e.offsets),
        None => chunk_key(&mut out, 0, 0, &zeros),
    }
    for (i, e) in entries.iter().enumerate() {
        out.extend_from_slice(&e.address.to_le_bytes());
        match entries.get(i + 1) {
            Some(next) => chunk_key(&mut out, next.size, next.mask, &next.offsets),
            None => chunk_key(&mut out, 0, 0, &zeros),
        }
    }
    out
}
