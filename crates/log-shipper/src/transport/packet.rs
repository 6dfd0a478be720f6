// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire packet exchanged with the collector.
//!
//! A packet carries a batch of lines as one concatenated payload buffer plus
//! per-line metadata:
//!
//! ```json
//! {
//!   "namespace": "web",
//!   "info": [{"timestamp": 1700000000000000000, "length": 5}],
//!   "buffer": [104, 101, 108, 108, 111],
//!   "files": {"indexes": [0], "mapTable": ["/var/log/app.log"]},
//!   "compressed": false
//! }
//! ```
//!
//! # Invariants
//!
//! - The per-line lengths sum to the length of the (uncompressed) buffer.
//! - `files.indexes` has one entry per line and every entry is a valid index
//!   into `files.mapTable`.
//!
//! Before submission the file table is compacted so it only lists the files
//! the packet actually references, renumbered in first-use order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::compressor::Compressor;
use crate::errors::{ConfigError, PacketError};
use crate::scheduler::LogLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInfo {
    /// Capture time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTable {
    pub indexes: Vec<u8>,
    pub map_table: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPacket {
    pub namespace: String,
    pub info: Vec<LineInfo>,
    pub buffer: Vec<u8>,
    pub files: FileTable,
    #[serde(default)]
    pub compressed: bool,
}

/// Maps every tailed filename to the small integer used on the wire.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    by_name: HashMap<String, u8>,
    names: Vec<String>,
}

impl FileIndex {
    /// Assigns indexes in the order given.
    pub fn new<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut by_name = HashMap::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let idx = u8::try_from(idx).map_err(|_| ConfigError::FileCount(names.len()))?;
            by_name.insert(name.clone(), idx);
        }
        Ok(Self { by_name, names })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl LogPacket {
    /// Builds an uncompressed packet from a drained batch.
    ///
    /// Fails if a line has no filename, names a file missing from `index`, or if
    /// the declared line lengths do not add up to the payload size.
    pub fn from_lines(lines: &[LogLine], index: &FileIndex) -> Result<Self, PacketError> {
        let mut packet = LogPacket {
            files: FileTable {
                indexes: Vec::with_capacity(lines.len()),
                map_table: index.names().to_vec(),
            },
            info: Vec::with_capacity(lines.len()),
            ..Default::default()
        };

        let mut declared = 0u64;
        for line in lines {
            if line.filename.is_empty() {
                return Err(PacketError::EmptyFilename);
            }
            let idx = index
                .get(&line.filename)
                .ok_or_else(|| PacketError::UnknownFile(line.filename.clone()))?;
            packet.info.push(LineInfo {
                timestamp: line.timestamp,
                length: line.length,
            });
            packet.buffer.extend_from_slice(&line.data);
            packet.files.indexes.push(idx);
            declared += line.length;
        }

        if declared != packet.buffer.len() as u64 {
            return Err(PacketError::LengthMismatch {
                buffer: packet.buffer.len(),
                info: declared,
            });
        }
        Ok(packet)
    }

    /// Number of lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.info.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    /// Appends the lines of `other`, which must share this packet's file table.
    pub fn append(&mut self, other: LogPacket) {
        self.info.extend(other.info);
        self.buffer.extend(other.buffer);
        self.files.indexes.extend(other.files.indexes);
    }

    /// Rewrites the file table to the files actually referenced, numbered in
    /// order of first use.
    pub fn compact(&mut self) -> Result<(), PacketError> {
        let mut renumbered: HashMap<u8, u8> = HashMap::new();
        let mut map_table = Vec::new();
        let mut indexes = Vec::with_capacity(self.files.indexes.len());

        for &idx in &self.files.indexes {
            let new_idx = match renumbered.get(&idx) {
                Some(&new_idx) => new_idx,
                None => {
                    let name = self.files.map_table.get(idx as usize).ok_or(
                        PacketError::IndexOutOfRange {
                            index: idx,
                            len: self.files.map_table.len(),
                        },
                    )?;
                    // Bounded by the source table, which never exceeds u8 range.
                    let new_idx = map_table.len() as u8;
                    map_table.push(name.clone());
                    renumbered.insert(idx, new_idx);
                    new_idx
                }
            };
            indexes.push(new_idx);
        }

        self.files = FileTable { indexes, map_table };
        Ok(())
    }

    /// Checks the structural invariants. Length sums are only checked on
    /// uncompressed packets.
    pub fn validate(&self) -> Result<(), PacketError> {
        if self.info.len() != self.files.indexes.len() {
            return Err(PacketError::IndexCountMismatch {
                infos: self.info.len(),
                indexes: self.files.indexes.len(),
            });
        }
        if let Some(&index) = self
            .files
            .indexes
            .iter()
            .find(|&&i| i as usize >= self.files.map_table.len())
        {
            return Err(PacketError::IndexOutOfRange {
                index,
                len: self.files.map_table.len(),
            });
        }
        if self.files.map_table.iter().any(String::is_empty) {
            return Err(PacketError::EmptyFilename);
        }
        if !self.compressed {
            let declared: u64 = self.info.iter().map(|i| i.length).sum();
            if declared != self.buffer.len() as u64 {
                return Err(PacketError::LengthMismatch {
                    buffer: self.buffer.len(),
                    info: declared,
                });
            }
        }
        Ok(())
    }

    /// Compresses the payload in place.
    pub fn compress(&mut self, codec: &dyn Compressor) -> Result<(), PacketError> {
        if !self.compressed {
            self.buffer = codec.compress(&self.buffer)?;
            self.compressed = true;
        }
        Ok(())
    }

    /// Reconstructs `(filename, line)` pairs, decompressing with `codec` when needed.
    pub fn decode_lines(&self, codec: &dyn Compressor) -> Result<Vec<(String, Vec<u8>)>, PacketError> {
        let plain = LogPacket {
            buffer: if self.compressed {
                codec.decompress(&self.buffer)?
            } else {
                self.buffer.clone()
            },
            compressed: false,
            namespace: self.namespace.clone(),
            info: self.info.clone(),
            files: self.files.clone(),
        };
        plain.validate()?;

        let mut lines = Vec::with_capacity(plain.info.len());
        let mut offset = 0usize;
        for (info, &idx) in plain.info.iter().zip(&plain.files.indexes) {
            let end = offset + info.length as usize;
            lines.push((
                plain.files.map_table[idx as usize].clone(),
                plain.buffer[offset..end].to_vec(),
            ));
            offset = end;
        }
        Ok(lines)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::compressor::ZstdCompressor;

    fn line(filename: &str, data: &str) -> LogLine {
        LogLine::new(filename, data.as_bytes().to_vec())
    }

    fn index() -> FileIndex {
        FileIndex::new(["a.log", "b.log", "c.log"]).unwrap()
    }

    #[test]
    fn test_from_lines() {
        let lines = vec![line("a.log", "hello"), line("c.log", "world!")];
        let packet = LogPacket::from_lines(&lines, &index()).unwrap();

        assert_eq!(packet.len(), 2);
        assert_eq!(packet.buffer, b"helloworld!");
        assert_eq!(packet.files.indexes, vec![0, 2]);
        assert_eq!(packet.info[1].length, 6);
        assert!(packet.validate().is_ok());
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let mut bad = line("a.log", "hello");
        bad.length = 3;
        let err = LogPacket::from_lines(&[line("b.log", "ok"), bad], &index()).unwrap_err();
        assert!(matches!(
            err,
            PacketError::LengthMismatch { buffer: 7, info: 5 }
        ));
    }

    #[test]
    fn test_empty_and_unknown_filenames_are_rejected() {
        assert!(matches!(
            LogPacket::from_lines(&[line("", "x")], &index()),
            Err(PacketError::EmptyFilename)
        ));
        assert!(matches!(
            LogPacket::from_lines(&[line("z.log", "x")], &index()),
            Err(PacketError::UnknownFile(_))
        ));
    }

    #[test]
    fn test_compact_renumbers_in_first_use_order() {
        let lines = vec![
            line("c.log", "1"),
            line("a.log", "2"),
            line("c.log", "3"),
        ];
        let mut packet = LogPacket::from_lines(&lines, &index()).unwrap();
        packet.compact().unwrap();

        assert_eq!(packet.files.map_table, vec!["c.log", "a.log"]);
        assert_eq!(packet.files.indexes, vec![0, 1, 0]);
        assert!(packet.validate().is_ok());
    }

    #[test]
    fn test_compact_rejects_dangling_index() {
        let mut packet = LogPacket {
            info: vec![LineInfo {
                timestamp: 0,
                length: 1,
            }],
            buffer: b"x".to_vec(),
            files: FileTable {
                indexes: vec![4],
                map_table: vec!["a.log".to_string()],
            },
            ..Default::default()
        };
        assert!(matches!(
            packet.compact(),
            Err(PacketError::IndexOutOfRange { index: 4, len: 1 })
        ));
    }

    #[test]
    fn test_append_and_decode_compressed() {
        let codec = ZstdCompressor::default();
        let mut packet = LogPacket::from_lines(&[line("b.log", "first")], &index()).unwrap();
        packet.append(LogPacket::from_lines(&[line("a.log", "second")], &index()).unwrap());
        packet.compact().unwrap();
        packet.compress(&codec).unwrap();
        assert!(packet.compressed);

        let decoded = packet.decode_lines(&codec).unwrap();
        assert_eq!(
            decoded,
            vec![
                ("b.log".to_string(), b"first".to_vec()),
                ("a.log".to_string(), b"second".to_vec()),
            ]
        );
    }

    #[test]
    fn test_json_shape() {
        let mut packet = LogPacket::from_lines(&[line("a.log", "hi")], &index()).unwrap();
        packet.compact().unwrap();
        packet.namespace = "web".to_string();

        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["namespace"], "web");
        assert_eq!(json["files"]["mapTable"][0], "a.log");
        assert_eq!(json["info"][0]["length"], 2);

        let back: LogPacket = serde_json::from_value(json).unwrap();
        assert_eq!(back, packet);
    }
}
