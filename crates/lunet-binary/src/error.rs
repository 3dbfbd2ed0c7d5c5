use thiserror::Error;

/// Errors that can occur during bit-level reads and writes.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Not enough bits remaining in the buffer for the requested operation.
    #[error("not enough bits in buffer: needed {needed}, remaining {remaining}")]
    ShortRead { needed: usize, remaining: usize },

    /// A fixed-allocation string was longer than its allocation allows.
    /// The allocation must leave room for the terminator.
    #[error("string of {length} characters does not fit an allocation of {allocated}")]
    StringTooLong { length: usize, allocated: usize },

    /// A fixed-allocation string had no NUL terminator within its allocation.
    #[error("fixed string not terminated within its allocation")]
    StringUnterminated,

    /// An invalid value was encountered (e.g. a malformed UTF-16 sequence).
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for binary operations.
pub type Result<T> = std::result::Result<T, BinaryError>;
