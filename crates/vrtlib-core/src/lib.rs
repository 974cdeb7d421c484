//! vrtlib-core: error, option and transport definitions shared by every
//! vrtlib crate.
//!
//! # Key types
//!
//! - [`Error`] / [`Result`] -- error handling
//! - [`ConnectionOptions`] -- typed view of the string option map
//! - [`Transport`] -- byte-level socket abstraction used by the I/O engine

pub mod error;
pub mod options;
pub mod transport;

pub use error::{Error, Result};
pub use options::{
    ConnectionOptions, Direction, InitialTimeout, SocketOptions, TransportKind, VrlBreak,
};
pub use transport::{ReadStatus, Transport};
