//! Version 1 B-trees index a chunked dataset's tiles by their coordinates.
//! Only raw-data-chunk trees (`node_type == 1`) are walked here; the group
//! symbol-table variant belongs to the v0/v1 machinery this reader rejects.

use std::collections::HashSet;

use log::debug;
use nom::bytes::streaming::tag;
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u64, le_u8};

use crate::error::Error;
use crate::parse::{slice_at, var_uint, FormatContext, ParseResult, UNDEFINED_ADDRESS};

/// One stored chunk, as described by a leaf entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntry {
    /// Stored (possibly compressed) byte count.
    pub size: u32,
    /// Bit i set suppresses filter i of the pipeline for this chunk.
    pub filter_mask: u32,
    /// Chunk origin per dimension, plus the trailing element slot.
    pub offsets: Vec<u64>,
    /// Chunk bytes, relative to the base address.
    pub address: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct ChunkKey {
    size: u32,
    filter_mask: u32,
    offsets: Vec<u64>,
}

#[derive(Debug)]
struct NodeHeader {
    node_type: u8,
    level: u8,
    entries_used: u16,
    right_sibling: u64,
}

#[derive(Debug)]
struct ChunkNode {
    level: u8,
    right_sibling: u64,
    /// n+1 keys bracketing n children.
    keys: Vec<ChunkKey>,
    children: Vec<u64>,
}

fn node_header<'a>(input: &'a [u8], offset_size: u8) -> ParseResult<'a, NodeHeader> {
    context("B-tree node", move |input| {
        let (input, _) = tag(b"TREE")(input)?;
        let (input, node_type) = le_u8(input)?;
        let (input, level) = le_u8(input)?;
        let (input, entries_used) = le_u16(input)?;
        let (input, _left_sibling) = var_uint(offset_size)(input)?;
        let (input, right_sibling) = var_uint(offset_size)(input)?;
        Ok((
            input,
            NodeHeader {
                node_type,
                level,
                entries_used,
                right_sibling,
            },
        ))
    })(input)
}

fn chunk_key<'a>(dimensionality: u8) -> impl Fn(&'a [u8]) -> ParseResult<'a, ChunkKey> {
    move |input: &'a [u8]| {
        let (input, size) = le_u32(input)?;
        let (input, filter_mask) = le_u32(input)?;
        let (input, offsets) = count(le_u64, dimensionality as usize)(input)?;
        Ok((
            input,
            ChunkKey {
                size,
                filter_mask,
                offsets,
            },
        ))
    }
}

fn read_chunk_node(
    contents: &[u8],
    ctx: &FormatContext,
    address: u64,
    dimensionality: u8,
) -> Result<ChunkNode, Error> {
    let input = slice_at(contents, ctx.address(address))?;
    let (input, header) = node_header(input, ctx.offset_size)?;
    match header.node_type {
        1 => {}
        0 => {
            return Err(Error::Malformed(format!(
                "group symbol-table B-tree node at {:#x} in a chunk index",
                address
            )))
        }
        t => return Err(Error::Malformed(format!("B-tree node type {}", t))),
    }
    let mut keys = Vec::with_capacity(header.entries_used as usize + 1);
    let mut children = Vec::with_capacity(header.entries_used as usize);
    let (mut input, first_key) = chunk_key(dimensionality)(input)?;
    keys.push(first_key);
    for _ in 0..header.entries_used {
        let (rest, child) = var_uint(ctx.offset_size)(input)?;
        let (rest, key) = chunk_key(dimensionality)(rest)?;
        children.push(child);
        keys.push(key);
        input = rest;
    }
    Ok(ChunkNode {
        level: header.level,
        right_sibling: header.right_sibling,
        keys,
        children,
    })
}

/// Walk the tree rooted at `root_address` and return its leaf entries in
/// in-order visitation order.
///
/// Each child of an internal node starts a right-sibling chain at the level
/// below; chains supplement the parent's entry list, so a node reachable
/// both ways is decoded once. The visited set also bounds the walk on
/// corrupt files with pointer cycles.
pub fn chunk_entries(
    contents: &[u8],
    ctx: &FormatContext,
    root_address: u64,
    dimensionality: u8,
) -> Result<Vec<ChunkEntry>, Error> {
    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    visit_chain(
        contents,
        ctx,
        root_address,
        dimensionality,
        &mut visited,
        &mut entries,
    )?;
    debug!(
        "chunk B-tree at {:#x}: {} nodes, {} entries",
        root_address,
        visited.len(),
        entries.len()
    );
    Ok(entries)
}

fn visit_chain(
    contents: &[u8],
    ctx: &FormatContext,
    start: u64,
    dimensionality: u8,
    visited: &mut HashSet<u64>,
    out: &mut Vec<ChunkEntry>,
) -> Result<(), Error> {
    let mut address = start;
    while address != UNDEFINED_ADDRESS {
        if !visited.insert(address) {
            break;
        }
        let node = read_chunk_node(contents, ctx, address, dimensionality)?;
        if node.level == 0 {
            for (key, child) in node.keys.iter().zip(&node.children) {
                out.push(ChunkEntry {
                    size: key.size,
                    filter_mask: key.filter_mask,
                    offsets: key.offsets.clone(),
                    address: *child,
                });
            }
        } else {
            for &child in &node.children {
                visit_chain(contents, ctx, child, dimensionality, visited, out)?;
            }
        }
        address = node.right_sibling;
    }
    Ok(())
}
