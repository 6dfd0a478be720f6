// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{Read, Write};
use std::ops::RangeInclusive;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;
use zstd::zstd_safe::CompressionLevel;

use crate::errors::CodecError;

/// Byte-array transform applied to cold payloads before submission.
///
/// Implementations must round-trip: `decompress(compress(x)) == x` for every
/// input, including the empty one.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Codec selected by the `codec` configuration key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Zstd,
    Gzip,
}

impl Codec {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Zstd => "zstd",
            Codec::Gzip => "gzip",
        }
    }

    /// Compression levels the codec accepts.
    #[must_use]
    pub fn level_range(&self) -> RangeInclusive<i32> {
        match self {
            Codec::Zstd => zstd::compression_level_range(),
            Codec::Gzip => 0..=9,
        }
    }

    /// Builds the compressor. `level` must be within [`Codec::level_range`].
    pub fn compressor(&self, level: i32) -> Result<Arc<dyn Compressor>, CodecError> {
        if !self.level_range().contains(&level) {
            return Err(CodecError::Level {
                codec: self.as_str(),
                level,
            });
        }
        let compressor: Arc<dyn Compressor> = match self {
            Codec::Zstd => Arc::new(ZstdCompressor::new(level)),
            #[allow(clippy::cast_sign_loss)]
            Codec::Gzip => Arc::new(GzipCompressor::new(level as u32)),
        };
        Ok(compressor)
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: CompressionLevel,
}

impl ZstdCompressor {
    #[must_use]
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = Encoder::new(Vec::new(), self.level).map_err(CodecError::Compress)?;
        encoder.write_all(data).map_err(CodecError::Compress)?;
        encoder.finish().map_err(CodecError::Compress)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoder = Decoder::new(data).map_err(CodecError::Decompress)?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(CodecError::Decompress)?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
}

impl GzipCompressor {
    /// `level` is clamped to 0..=9.
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data).map_err(CodecError::Compress)?;
        encoder.finish().map_err(CodecError::Compress)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(CodecError::Decompress)?;
        Ok(out)
    }
}
