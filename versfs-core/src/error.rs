use thiserror::Error;

/// Errors surfaced by the engine.
///
/// "Not found" is deliberately absent here: an absent inode/directory
/// lookup is not an error at this layer and is modeled as `Ok(None)` at
/// call sites.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device I/O failed: {0}")]
    Device(#[from] DeviceError),

    #[error("out of space")]
    OutOfSpace,

    #[error("tree corrupt: {0}")]
    TreeCorrupt(&'static str),

    #[error("no buffer available")]
    CacheExhausted,
}

/// Wraps the underlying `errno` the way a direct syscall failure would
/// report it, mirroring the `ErrnoError` newtype pattern used at the CLI
/// layer.
#[derive(Debug, Error)]
#[error("{op} at block {block}: {errno}")]
pub struct DeviceError {
    pub op: &'static str,
    pub block: i64,
    pub errno: errno::Errno,
}

pub type Result<T> = std::result::Result<T, Error>;
