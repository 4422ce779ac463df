//! A pure-Rust reader for the HDF5 binary container format.
//!
//! This library decodes v2/v3 superblocks, v2 object headers and the inline
//! link graph, and materializes compact, contiguous, and chunked dataset
//! data (decompressing through the filter pipeline where needed). It does
//! not intend to support every feature of the specification: writing, v1
//! group machinery, fractal heaps, and non-scalar datatypes are out.

use std::collections::BTreeMap;
use std::path::Path;

mod btree;
pub mod checksum;
mod data;
mod error;
mod filter;
mod parse;

pub use data::{Hdf5Dtype, Values};
pub use error::Error;
pub use filter::{ChunkFilter, FilterRegistry, FILTER_DEFLATE};
pub use parse::{
    header, ConsistencyFlags, FormatContext, HeaderFlags, HeaderMessage, LegacySuperblock,
    ModernSuperblock, ObjectHeader, ObjectHeaderPrefix, Superblock, SuperblockLayout, Timestamps,
    SIGNATURE, UNDEFINED_ADDRESS,
};

/// Convenience function for Hdf5File::open
pub fn open<P: AsRef<Path>>(path: P) -> Result<Hdf5File, Error> {
    Hdf5File::open(path)
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Verify superblock and object-header checksums (on by default).
    /// When off, mismatches are logged and decoding continues.
    pub verify_checksums: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            verify_checksums: true,
        }
    }
}

/// An opened HDF5 file
pub struct Hdf5File {
    map: memmap::Mmap,
    superblock: Superblock,
    context: FormatContext,
    registry: FilterRegistry,
    /// None for v0/v1 files, which open for metadata only.
    root_group: Option<Group>,
    verify_checksums: bool,
}

impl std::fmt::Debug for Hdf5File {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hdf5File")
            .field("superblock", &self.superblock)
            .field("root", &self.root_group)
            .finish()
    }
}

/// One group node: child groups, datasets, and soft links by name.
#[derive(Debug)]
pub struct Group {
    groups: BTreeMap<String, Group>,
    datasets: BTreeMap<String, Dataset>,
    soft_links: BTreeMap<String, String>,
}

impl Group {
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn dataset_names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// The stored path of a soft link, uninterpreted.
    pub fn soft_link(&self, name: &str) -> Option<&str> {
        self.soft_links.get(name).map(String::as_str)
    }

    fn find_dataset(&self, dataset_path: &str) -> Option<&Dataset> {
        match dataset_path.find('/') {
            Some(i) => {
                let (first, remaining) = dataset_path.split_at(i);
                if let Some(d) = self.datasets.get(first) {
                    Some(d)
                } else {
                    self.groups.get(first)?.find_dataset(&remaining[1..])
                }
            }
            None => self.datasets.get(dataset_path),
        }
    }
}

pub struct Dataset {
    dataspace: header::Dataspace,
    datatype: header::Datatype,
    layout: header::DataLayout,
    pipeline: Option<header::FilterPipeline>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("dimensions", &self.dataspace.dimensions)
            .field("datatype", &self.datatype.class)
            .field("element_bytes", &self.datatype.size)
            .finish()
    }
}

impl Dataset {
    pub fn dimensions(&self) -> &[u64] {
        &self.dataspace.dimensions
    }
}

impl Hdf5File {
    /// Open an HDF5 file
    ///
    /// This function memory-maps the file, decodes the superblock, and (for
    /// v2/v3 files) walks the link graph into a group tree so path lookups
    /// are trivial.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::open_with(path, OpenOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let map = unsafe { memmap::Mmap::map(&file)? };
        let (_, superblock) = parse::read_superblock(&map, options.verify_checksums)?;
        let context = FormatContext {
            offset_size: superblock.offset_size,
            length_size: superblock.length_size,
            base_address: superblock.base_address,
        };

        let root_group = match &superblock.layout {
            SuperblockLayout::Modern(modern) => {
                let root = parse::read_object_header(
                    &map,
                    &context,
                    context.address(modern.root_header_address),
                    options.verify_checksums,
                )?;
                let mut in_progress = Vec::new();
                Some(build_group(
                    &map,
                    &context,
                    &root,
                    options.verify_checksums,
                    &mut in_progress,
                )?)
            }
            SuperblockLayout::Legacy(_) => None,
        };

        Ok(Hdf5File {
            map,
            superblock,
            context,
            registry: FilterRegistry::default(),
            root_group,
            verify_checksums: options.verify_checksums,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Decode the root group's object header.
    pub fn root(&self) -> Result<ObjectHeader, Error> {
        match &self.superblock.layout {
            SuperblockLayout::Modern(modern) => parse::read_object_header(
                &self.map,
                &self.context,
                self.context.address(modern.root_header_address),
                self.verify_checksums,
            ),
            SuperblockLayout::Legacy(_) => Err(self.legacy_data_access()),
        }
    }

    /// The group tree, for v2/v3 files.
    pub fn root_group(&self) -> Result<&Group, Error> {
        self.root_group.as_ref().ok_or_else(|| self.legacy_data_access())
    }

    /// Decode the object header a hard link points at. Soft links carry a
    /// path instead of an object; following one is an error.
    pub fn follow_link(&self, link: &header::Link) -> Result<ObjectHeader, Error> {
        match &link.target {
            header::LinkTarget::Hard { address } => parse::read_object_header(
                &self.map,
                &self.context,
                self.context.address(*address),
                self.verify_checksums,
            ),
            header::LinkTarget::Soft { .. } => Err(Error::UnsupportedLink { kind: 1 }),
        }
    }

    /// Read a dataset's elements and dimension sizes by `/`-separated path.
    pub fn read_data(&self, dataset_path: &str) -> Result<(Values, Vec<u64>), Error> {
        let group = self.root_group()?;
        let dataset = group
            .find_dataset(dataset_path)
            .ok_or_else(|| Error::NotFound(format!("dataset {:?}", dataset_path)))?;
        data::read_data(
            &self.map,
            &self.context,
            &self.registry,
            &dataset.dataspace,
            &dataset.datatype,
            &dataset.layout,
            dataset.pipeline.as_ref(),
        )
    }

    /// Read the dataset described by an already-decoded object header.
    pub fn read_header_data(&self, header: &ObjectHeader) -> Result<(Values, Vec<u64>), Error> {
        let parts = DatasetParts::from_messages(&header.messages)?;
        data::read_data(
            &self.map,
            &self.context,
            &self.registry,
            parts.dataspace,
            parts.datatype,
            parts.layout,
            parts.pipeline,
        )
    }

    /// Look up the provided path to a dataset and decode it as a `Vec<T>`.
    ///
    /// Panics if the dataset's type is not `T`; every file-shape problem is
    /// an `Err`.
    pub fn read_as<T: Hdf5Type>(&self, dataset_path: &str) -> Result<Vec<T>, Error> {
        let (values, _) = self.read_data(dataset_path)?;
        let found = values.dtype();
        match T::extract(values) {
            Some(v) => Ok(v),
            None => panic!(
                "Dataset {:?} is of type {:?}, not {:?}",
                dataset_path,
                found,
                T::dtype()
            ),
        }
    }

    /// Install a decoder for a filter ID, replacing any existing one.
    pub fn register_filter(&mut self, id: u16, decoder: Box<dyn ChunkFilter>) {
        self.registry.register(id, decoder);
    }

    fn legacy_data_access(&self) -> Error {
        Error::UnsupportedVersion {
            structure: "superblock data access",
            version: self.superblock.version,
        }
    }
}

struct DatasetParts<'a> {
    dataspace: &'a header::Dataspace,
    datatype: &'a header::Datatype,
    layout: &'a header::DataLayout,
    pipeline: Option<&'a header::FilterPipeline>,
}

impl<'a> DatasetParts<'a> {
    fn from_messages(messages: &'a [HeaderMessage]) -> Result<Self, Error> {
        let mut dataspace = None;
        let mut datatype = None;
        let mut layout = None;
        let mut pipeline = None;
        for message in messages {
            match &message.message {
                header::Message::Dataspace(m) => dataspace = Some(m),
                header::Message::Datatype(m) => datatype = Some(m),
                header::Message::DataLayout(m) => layout = Some(m),
                header::Message::FilterPipeline(m) => pipeline = Some(m),
                _ => {}
            }
        }
        match (dataspace, datatype, layout) {
            (Some(dataspace), Some(datatype), Some(layout)) => Ok(DatasetParts {
                dataspace,
                datatype,
                layout,
                pipeline,
            }),
            (None, _, _) => Err(Error::Malformed("dataset without a dataspace message".into())),
            (_, None, _) => Err(Error::Malformed("dataset without a datatype message".into())),
            (_, _, None) => Err(Error::Malformed(
                "object header holds no data layout message".into(),
            )),
        }
    }
}

fn build_group(
    contents: &[u8],
    ctx: &FormatContext,
    node: &ObjectHeader,
    verify_checksums: bool,
    in_progress: &mut Vec<u64>,
) -> Result<Group, Error> {
    if in_progress.contains(&node.address) {
        return Err(Error::Malformed(format!(
            "hard link cycle through object header at {:#x}",
            node.address
        )));
    }
    in_progress.push(node.address);

    let mut groups = BTreeMap::new();
    let mut datasets = BTreeMap::new();
    let mut soft_links = BTreeMap::new();

    for message in &node.messages {
        let link = match &message.message {
            header::Message::Link(link) => link,
            _ => continue,
        };
        match &link.target {
            header::LinkTarget::Soft { path } => {
                soft_links.insert(link.name.clone(), path.clone());
            }
            header::LinkTarget::Hard { address } => {
                let child = parse::read_object_header(
                    contents,
                    ctx,
                    ctx.address(*address),
                    verify_checksums,
                )?;
                let is_dataset = child
                    .messages
                    .iter()
                    .any(|m| matches!(m.message, header::Message::DataLayout(_)));
                if is_dataset {
                    let parts = DatasetParts::from_messages(&child.messages)?;
                    datasets.insert(
                        link.name.clone(),
                        Dataset {
                            dataspace: parts.dataspace.clone(),
                            datatype: parts.datatype.clone(),
                            layout: parts.layout.clone(),
                            pipeline: parts.pipeline.cloned(),
                        },
                    );
                } else {
                    groups.insert(
                        link.name.clone(),
                        build_group(contents, ctx, &child, verify_checksums, in_progress)?,
                    );
                }
            }
        }
    }

    in_progress.pop();
    Ok(Group {
        groups,
        datasets,
        soft_links,
    })
}

/// Identifies Rust types that this library can produce from HDF5 types
pub trait Hdf5Type: private::Sealed + Sized {
    fn dtype() -> Hdf5Dtype;
    #[doc(hidden)]
    fn extract(values: Values) -> Option<Vec<Self>>;
}

mod private {
    pub trait Sealed {}
    impl Sealed for i16 {}
    impl Sealed for u16 {}
    impl Sealed for i32 {}
    impl Sealed for u32 {}
    impl Sealed for i64 {}
    impl Sealed for u64 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

macro_rules! impl_hdf5_type {
    ($ty:ty, $variant:ident) => {
        impl Hdf5Type for $ty {
            fn dtype() -> Hdf5Dtype {
                Hdf5Dtype::$variant
            }

            fn extract(values: Values) -> Option<Vec<$ty>> {
                match values {
                    Values::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_hdf5_type!(i16, I16);
impl_hdf5_type!(u16, U16);
impl_hdf5_type!(i32, I32);
impl_hdf5_type!(u32, U32);
impl_hdf5_type!(i64, I64);
impl_hdf5_type!(u64, U64);
impl_hdf5_type!(f32, F32);
impl_hdf5_type!(f64, F64);
