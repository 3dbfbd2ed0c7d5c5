//! Bit-level binary serialization for the lunet wire protocol.

pub mod error;
pub mod io;

pub use error::{BinaryError, Result};
pub use io::{BitReader, BitWriter, LengthPrefix};
