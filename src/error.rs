use thiserror::Error;

/// Errors that can stop the daemon or a transport operation.
///
/// Control point decode failures are not here: they are recovered locally
/// (see [`crate::protocol::DecodeError`]).
#[derive(Error, Debug)]
pub enum Error {
    /// BlueZ / D-Bus errors
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("Invalid config: {0}")]
    Config(#[from] serde_json::Error),

    /// The engine task is gone
    #[error("Engine channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
