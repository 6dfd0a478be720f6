// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration: JSON file, defaults, environment overrides and validation.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::compressor::Codec;
use crate::constants;
use crate::errors::ConfigError;
use crate::util::parse_namespace;

/// One tailed file (or glob pattern) and the keywords that make its lines hot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub filename: String,
    #[serde(default)]
    pub hot_filter: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub namespace: String,
    pub target_ip: String,
    pub target_port: String,
    pub hot_ring_capacity: usize,
    pub cold_ring_capacity: usize,
    #[serde(rename = "coldTimeoutMilli")]
    pub cold_timeout_ms: u64,
    #[serde(rename = "pollingIntervalMilli")]
    pub polling_interval_ms: u64,
    pub hot_ring_threshold: usize,
    pub cold_ring_threshold: usize,
    #[serde(rename = "coldSendThresholdBytes")]
    pub cold_send_threshold: usize,
    #[serde(rename = "retryIntervalMilli")]
    pub retry_interval_ms: u64,
    pub codec: Codec,
    pub compression_level: i32,
    pub files: Vec<FileConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: constants::DEFAULT_NAMESPACE.to_string(),
            target_ip: constants::DEFAULT_TARGET_IP.to_string(),
            target_port: constants::DEFAULT_TARGET_PORT.to_string(),
            hot_ring_capacity: constants::DEFAULT_HOT_RING_CAPACITY,
            cold_ring_capacity: constants::DEFAULT_COLD_RING_CAPACITY,
            cold_timeout_ms: constants::DEFAULT_COLD_TIMEOUT_MS,
            polling_interval_ms: constants::DEFAULT_POLLING_INTERVAL_MS,
            hot_ring_threshold: constants::DEFAULT_RING_THRESHOLD,
            cold_ring_threshold: constants::DEFAULT_RING_THRESHOLD,
            cold_send_threshold: constants::DEFAULT_COLD_SEND_THRESHOLD_BYTES,
            retry_interval_ms: constants::DEFAULT_RETRY_INTERVAL_MS,
            codec: Codec::default(),
            compression_level: constants::DEFAULT_COMPRESSION_LEVEL,
            files: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Reads a JSON config file, applies environment overrides and validates the result.
    ///
    /// File patterns are expanded, so the returned config lists concrete files only.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&text)?;
        config.apply_env();
        config.resolve()?;
        Ok(config)
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Overrides the destination and namespace from `LOG_SHIPPER_*` variables.
    pub fn apply_env(&mut self) {
        if let Ok(namespace) = env::var("LOG_SHIPPER_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(target_ip) = env::var("LOG_SHIPPER_TARGET_IP") {
            self.target_ip = target_ip;
        }
        if let Ok(target_port) = env::var("LOG_SHIPPER_TARGET_PORT") {
            self.target_port = target_port;
        }
    }

    /// Expands file patterns and validates every field. Resolving an already
    /// resolved config leaves its file list unchanged.
    pub fn resolve(&mut self) -> Result<(), ConfigError> {
        self.files = expand_patterns(&self.files)?;
        self.validate()
    }

    /// Validates an already expanded configuration.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.namespace = parse_namespace(&self.namespace)
            .ok_or_else(|| ConfigError::Namespace(self.namespace.clone()))?;

        if self.polling_interval_ms == 0
            || self.polling_interval_ms > constants::MAX_POLLING_INTERVAL_MS
        {
            return Err(ConfigError::PollingInterval(self.polling_interval_ms));
        }
        if self.hot_ring_capacity < 1 {
            return Err(ConfigError::HotCapacity(self.hot_ring_capacity));
        }
        if self.cold_ring_capacity < 2 {
            return Err(ConfigError::ColdCapacity(self.cold_ring_capacity));
        }
        if self.target_ip.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "targetIp",
                reason: "cannot be empty".to_string(),
            });
        }
        if self.target_port.parse::<u16>().is_err() {
            return Err(ConfigError::Invalid {
                key: "targetPort",
                reason: format!("'{}' is not a valid port", self.target_port),
            });
        }
        if !self.codec.level_range().contains(&self.compression_level) {
            return Err(ConfigError::Invalid {
                key: "compressionLevel",
                reason: format!(
                    "{} is not a valid {} level",
                    self.compression_level, self.codec
                ),
            });
        }

        if self.files.is_empty() || self.files.len() >= constants::MAX_FILES {
            return Err(ConfigError::FileCount(self.files.len()));
        }
        // Spellings of the same file (`logs/a.log`, `./logs/a.log`) collide.
        let mut seen = HashSet::new();
        for file in &self.files {
            let identity = std::fs::canonicalize(&file.filename)
                .unwrap_or_else(|_| PathBuf::from(&file.filename));
            if !seen.insert(identity) {
                return Err(ConfigError::DuplicateFile(file.filename.clone()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_ip, self.target_port)
    }

    #[must_use]
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    #[must_use]
    pub fn cold_timeout(&self) -> Duration {
        Duration::from_millis(self.cold_timeout_ms)
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Expands glob patterns into concrete files, keeping each pattern's hot keywords.
///
/// Every pattern must match at least one path. A name that is an existing file
/// is taken literally, even if it contains glob metacharacters.
pub fn expand_patterns(patterns: &[FileConfig]) -> Result<Vec<FileConfig>, ConfigError> {
    let mut files = Vec::new();
    for meta in patterns {
        if Path::new(&meta.filename).is_file() {
            files.push(meta.clone());
            continue;
        }
        let paths = glob::glob(&meta.filename).map_err(|e| ConfigError::Pattern {
            pattern: meta.filename.clone(),
            reason: e.to_string(),
        })?;

        let mut matched = 0;
        for entry in paths {
            let path = entry.map_err(|e| ConfigError::Pattern {
                pattern: meta.filename.clone(),
                reason: e.to_string(),
            })?;
            files.push(FileConfig {
                filename: path.to_string_lossy().into_owned(),
                hot_filter: meta.hot_filter.clone(),
            });
            matched += 1;
        }
        if matched == 0 {
            return Err(ConfigError::NoMatch(meta.filename.clone()));
        }
    }
    Ok(files)
}
