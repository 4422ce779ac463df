//! Turn a (dataspace, datatype, layout) triple into typed values.

use log::debug;

use crate::btree;
use crate::error::Error;
use crate::filter::FilterRegistry;
use crate::parse::header::{DataLayout, Dataspace, Datatype, DatatypeClass, FilterPipeline};
use crate::parse::{slice_range, FormatContext, UNDEFINED_ADDRESS};

/// Primitive representations this library can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hdf5Dtype {
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

/// A datatype message resolved to one decodable primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementType {
    pub dtype: Hdf5Dtype,
    pub big_endian: bool,
}

impl ElementType {
    pub fn from_datatype(raw: &Datatype) -> Result<Self, Error> {
        let unsupported = || Error::UnsupportedDatatype {
            class: raw.class.code(),
            size: raw.size,
        };
        match raw.class {
            DatatypeClass::FixedPoint => {
                let big_endian = raw.bitfields & 1 == 1;
                let signed = raw.bitfields >> 3 & 1 == 1;
                let dtype = match (raw.size, signed) {
                    (2, true) => Hdf5Dtype::I16,
                    (2, false) => Hdf5Dtype::U16,
                    (4, true) => Hdf5Dtype::I32,
                    (4, false) => Hdf5Dtype::U32,
                    (8, true) => Hdf5Dtype::I64,
                    (8, false) => Hdf5Dtype::U64,
                    _ => return Err(unsupported()),
                };
                Ok(ElementType { dtype, big_endian })
            }
            DatatypeClass::FloatingPoint => {
                // bits {6, 0}: {0,0} little, {0,1} big; bit 6 set is a VAX
                // order nothing writes anymore.
                let big_endian = match (raw.bitfields >> 6 & 1, raw.bitfields & 1) {
                    (0, 0) => false,
                    (0, 1) => true,
                    _ => return Err(unsupported()),
                };
                let dtype = match raw.size {
                    4 => Hdf5Dtype::F32,
                    8 => Hdf5Dtype::F64,
                    _ => return Err(unsupported()),
                };
                Ok(ElementType { dtype, big_endian })
            }
            _ => Err(unsupported()),
        }
    }

    pub fn size(&self) -> usize {
        match self.dtype {
            Hdf5Dtype::I16 | Hdf5Dtype::U16 => 2,
            Hdf5Dtype::I32 | Hdf5Dtype::U32 | Hdf5Dtype::F32 => 4,
            Hdf5Dtype::I64 | Hdf5Dtype::U64 | Hdf5Dtype::F64 => 8,
        }
    }
}

/// A dataset's elements as one flat, typed buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum Values {
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::I16(v) => v.len(),
            Values::U16(v) => v.len(),
            Values::I32(v) => v.len(),
            Values::U32(v) => v.len(),
            Values::I64(v) => v.len(),
            Values::U64(v) => v.len(),
            Values::F32(v) => v.len(),
            Values::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Hdf5Dtype {
        match self {
            Values::I16(_) => Hdf5Dtype::I16,
            Values::U16(_) => Hdf5Dtype::U16,
            Values::I32(_) => Hdf5Dtype::I32,
            Values::U32(_) => Hdf5Dtype::U32,
            Values::I64(_) => Hdf5Dtype::I64,
            Values::U64(_) => Hdf5Dtype::U64,
            Values::F32(_) => Hdf5Dtype::F32,
            Values::F64(_) => Hdf5Dtype::F64,
        }
    }
}

macro_rules! decode_prim {
    ($bytes:expr, $big:expr, $ty:ty, $variant:ident) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        let values = $bytes
            .chunks_exact(WIDTH)
            .map(|chunk| {
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(chunk);
                if $big {
                    <$ty>::from_be_bytes(raw)
                } else {
                    <$ty>::from_le_bytes(raw)
                }
            })
            .collect();
        Values::$variant(values)
    }};
}

fn decode_values(bytes: &[u8], element: ElementType) -> Values {
    match element.dtype {
        Hdf5Dtype::I16 => decode_prim!(bytes, element.big_endian, i16, I16),
        Hdf5Dtype::U16 => decode_prim!(bytes, element.big_endian, u16, U16),
        Hdf5Dtype::I32 => decode_prim!(bytes, element.big_endian, i32, I32),
        Hdf5Dtype::U32 => decode_prim!(bytes, element.big_endian, u32, U32),
        Hdf5Dtype::I64 => decode_prim!(bytes, element.big_endian, i64, I64),
        Hdf5Dtype::U64 => decode_prim!(bytes, element.big_endian, u64, U64),
        Hdf5Dtype::F32 => decode_prim!(bytes, element.big_endian, f32, F32),
        Hdf5Dtype::F64 => decode_prim!(bytes, element.big_endian, f64, F64),
    }
}

/// Materialize a dataset: read its storage per the layout class, run chunk
/// bytes through the filter pipeline, and decode elements. Chunked output
/// follows the B-tree's chunk visitation order, each chunk's elements
/// contiguous.
pub fn read_data(
    contents: &[u8],
    ctx: &FormatContext,
    registry: &FilterRegistry,
    dataspace: &Dataspace,
    datatype: &Datatype,
    layout: &DataLayout,
    pipeline: Option<&FilterPipeline>,
) -> Result<(Values, Vec<u64>), Error> {
    let element = ElementType::from_datatype(datatype)?;
    let bytes = match layout {
        DataLayout::Compact { data } => data.clone(),
        DataLayout::Contiguous { address, size } => {
            if *address == UNDEFINED_ADDRESS {
                Vec::new() // storage never allocated
            } else {
                slice_range(contents, ctx.address(*address), *size)?.to_vec()
            }
        }
        DataLayout::Chunked {
            btree_address,
            dimensionality,
            ..
        } => {
            let entries = btree::chunk_entries(contents, ctx, *btree_address, *dimensionality)?;
            let mut assembled = Vec::new();
            for entry in entries {
                let stored =
                    slice_range(contents, ctx.address(entry.address), u64::from(entry.size))?;
                let cooked = match pipeline {
                    Some(p) => registry.apply(p, entry.filter_mask, stored.to_vec())?,
                    None => stored.to_vec(),
                };
                if cooked.len() % element.size() != 0 {
                    return Err(Error::Malformed(format!(
                        "chunk at {:#x} holds {} bytes, not a multiple of element size {}",
                        entry.address,
                        cooked.len(),
                        element.size()
                    )));
                }
                assembled.extend_from_slice(&cooked);
            }
            assembled
        }
    };
    if bytes.len() % element.size() != 0 {
        return Err(Error::Malformed(format!(
            "{} stored bytes, not a multiple of element size {}",
            bytes.len(),
            element.size()
        )));
    }
    debug!(
        "decoded {} elements of {:?}",
        bytes.len() / element.size(),
        element.dtype
    );
    Ok((decode_values(&bytes, element), dataspace.dimensions.clone()))
}
