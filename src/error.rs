use std::fmt;
use std::io;

/// Everything that can go wrong while opening or decoding a file.
///
/// Each variant is a distinct failure kind; the CLI maps them to distinct
/// exit codes.
#[derive(Debug)]
pub enum Error {
    /// Underlying read failure, including reads past end-of-file.
    Io(io::Error),
    /// The path names no file, or a dataset path matched nothing in the tree.
    NotFound(String),
    /// No format signature at offset 0 or any 512 * 2^k offset.
    NotAnHdf5File,
    /// A stored metadata checksum disagrees with the bytes it covers.
    ChecksumMismatch {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },
    /// A versioned structure uses a version this reader does not decode.
    UnsupportedVersion {
        structure: &'static str,
        version: u8,
    },
    /// Data read attempted through a datatype class outside fixed/float.
    UnsupportedDatatype { class: u8, size: u32 },
    /// A non-optional filter with an ID no registered decoder handles.
    UnsupportedFilter { id: u16 },
    /// An external (or otherwise unfollowable) link kind.
    UnsupportedLink { kind: u8 },
    /// Structural assertion failure: bad magic, nonsensical count, cycle.
    Malformed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::NotAnHdf5File => write!(f, "format signature not found"),
            Error::ChecksumMismatch {
                structure,
                stored,
                computed,
            } => write!(
                f,
                "{} checksum mismatch: stored {:#010x}, computed {:#010x}",
                structure, stored, computed
            ),
            Error::UnsupportedVersion { structure, version } => {
                write!(f, "unsupported {} version {}", structure, version)
            }
            Error::UnsupportedDatatype { class, size } => {
                write!(f, "unsupported datatype: class {}, size {}", class, size)
            }
            Error::UnsupportedFilter { id } => write!(f, "unsupported filter id {}", id),
            Error::UnsupportedLink { kind } => write!(f, "unsupported link kind {}", kind),
            Error::Malformed(what) => write!(f, "malformed structure: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl<'a> From<nom::Err<nom::error::VerboseError<&'a [u8]>>> for Error {
    fn from(e: nom::Err<nom::error::VerboseError<&'a [u8]>>) -> Self {
        match e {
            nom::Err::Incomplete(_) => Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "structure extends past end of data",
            )),
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::Malformed(describe(&e)),
        }
    }
}

/// Flatten a nom error trace into "outer context: inner context: kind".
fn describe(e: &nom::error::VerboseError<&[u8]>) -> String {
    use nom::error::VerboseErrorKind;
    let mut parts = Vec::new();
    for (_, kind) in e.errors.iter().rev() {
        match kind {
            VerboseErrorKind::Context(c) => parts.push((*c).to_string()),
            VerboseErrorKind::Nom(k) => parts.push(format!("{:?}", k).to_lowercase()),
            VerboseErrorKind::Char(c) => parts.push(format!("expected {:?}", c)),
        }
    }
    parts.join(": ")
}

/// Premature end-of-file while dereferencing an address.
pub(crate) fn eof() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "address points past end of file",
    ))
}
