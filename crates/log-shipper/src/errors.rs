// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the shipping pipeline.

use std::path::PathBuf;

/// Invalid or inconsistent configuration. Always fatal at initialization.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid file pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("File pattern '{0}' did not match any file")]
    NoMatch(String),

    #[error("Number of files must be over 0 and under 256 (got {0})")]
    FileCount(usize),

    #[error("Duplicated file is not allowed: {0}")]
    DuplicateFile(String),

    #[error("Polling interval must be between 1ms and 1000ms (got {0}ms)")]
    PollingInterval(u64),

    #[error("Hot ring capacity must be at least 1 (got {0})")]
    HotCapacity(usize),

    #[error("Cold ring capacity must be at least 2 (got {0})")]
    ColdCapacity(usize),

    #[error("Invalid namespace '{0}'")]
    Namespace(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LineBufferError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Line handler failed on {path}: {source}")]
    Handler {
        path: PathBuf,
        source: Box<ShipperError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("File is already registered: {0}")]
    AlreadyRegistered(PathBuf),

    #[error("File is not registered: {0}")]
    NotRegistered(PathBuf),

    #[error("Notification backend error: {0}")]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Buffer(#[from] LineBufferError),

    #[error("Failed to spawn watcher thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("Ring is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("Buffer and info size mismatch (buffer: {buffer}, info: {info})")]
    LengthMismatch { buffer: usize, info: u64 },

    #[error("Filename must be specified")]
    EmptyFilename,

    #[error("Unknown file {0} has no index in the file table")]
    UnknownFile(String),

    #[error("File index {index} is out of range for a table of {len} entries")]
    IndexOutOfRange { index: u8, len: usize },

    #[error("Packet has {infos} info entries but {indexes} file indexes")]
    IndexCountMismatch { infos: usize, indexes: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to compress payload: {0}")]
    Compress(std::io::Error),

    #[error("Failed to decompress payload: {0}")]
    Decompress(std::io::Error),

    #[error("{level} is not a valid {codec} compression level")]
    Level { codec: &'static str, level: i32 },
}

/// Errors reported by the remote collector.
///
/// `Backpressure` means the destination is saturated and the same packet should be
/// submitted again later. Everything else is terminal for the transport.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Destination is saturated: {0}")]
    Backpressure(String),

    #[error("Destination rejected the packet ({status:?}): {message}")]
    Destination {
        status: Option<u16>,
        message: String,
    },

    #[error("Failed to encode packet: {0}")]
    Payload(String),
}

impl SubmitError {
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, SubmitError::Backpressure(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Failed to access model file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize model: {0}")]
    Format(#[from] serde_json::Error),
}

/// Umbrella error surfaced by the scheduler and transport.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("No hot keyword matcher registered for {0}")]
    UnknownFile(String),

    #[error("Scheduler is already running or was closed")]
    InvalidState,

    #[error("Pipeline stopped")]
    Stopped,
}

impl From<LineBufferError> for ShipperError {
    fn from(err: LineBufferError) -> Self {
        ShipperError::Watcher(WatcherError::Buffer(err))
    }
}
