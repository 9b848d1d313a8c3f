//! Fatal parse errors. Anything recoverable is recorded as a
//! [`Warning`](crate::node::Warning) on the affected node instead.

use core::fmt;
use core::result;
use std::error;
use std::io;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The first four bytes of the image match none of the recognized magics
    BadMagic(u64),
    /// An address range required by the parse falls outside the memory map
    OutOfRange { address: u64, size: u64 },
    /// The memory map has no readable bytes at this address (a hole in a task map)
    Unreadable { address: u64 },
    /// The entity is malformed beyond what the permissive-parse policy can absorb
    Malformed(String),
    Scroll(scroll::Error),
    IO(io::Error),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Scroll(err) => Some(err),
            Error::IO(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadMagic(magic) => write!(fmt, "invalid magic number: 0x{magic:x}"),
            Error::OutOfRange { address, size } => {
                write!(fmt, "range of {size:#x} bytes at {address:#x} is outside the memory map")
            }
            Error::Unreadable { address } => write!(fmt, "no readable mapping at {address:#x}"),
            Error::Malformed(msg) => write!(fmt, "malformed entity: {msg}"),
            Error::Scroll(err) => write!(fmt, "{err}"),
            Error::IO(err) => write!(fmt, "{err}"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
