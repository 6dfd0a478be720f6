// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns drained batches into packets and delivers them.
//!
//! Hot batches are packed and submitted right away. Cold batches are appended
//! to an accumulation packet which is compressed and submitted once it holds
//! at least `coldSendThresholdBytes` bytes or has been accumulating for
//! `coldTimeoutMilli`, whichever comes first. Both checks run on every cold
//! drain, including the empty drains triggered by the polling timer.
//!
//! Backpressure from the collector is retried after `retryIntervalMilli`
//! for as long as the scheduler runs. Any other failure closes the transport.

pub mod packet;
pub mod submit;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::compressor::Compressor;
use crate::config::AgentConfig;
use crate::errors::ShipperError;
use crate::scheduler::{ClassificationHook, LogLine, Scheduler, SchedulerHandle, Submit};
use packet::{FileIndex, LogPacket};
use submit::{Port, Submitter};

/// Cold lines waiting for a flush.
#[derive(Debug)]
pub struct ColdBuffer {
    packet: LogPacket,
    started: Option<Instant>,
    threshold: usize,
    timeout: Duration,
}

impl ColdBuffer {
    #[must_use]
    pub fn new(threshold: usize, timeout: Duration) -> Self {
        Self {
            packet: LogPacket::default(),
            started: None,
            threshold,
            timeout,
        }
    }

    /// Appends a batch. The timer starts with the first line of an empty buffer.
    pub fn add(&mut self, packet: LogPacket) {
        if packet.is_empty() {
            return;
        }
        if self.packet.is_empty() {
            self.packet = packet;
            self.started = Some(Instant::now());
        } else {
            self.packet.append(packet);
        }
    }

    #[must_use]
    pub fn should_flush(&self, now: Instant) -> bool {
        match self.started {
            Some(started) if !self.packet.is_empty() => {
                self.packet.buffer.len() >= self.threshold
                    || now.saturating_duration_since(started) >= self.timeout
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn packet(&self) -> &LogPacket {
        &self.packet
    }

    /// Uncompressed bytes waiting.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.packet.buffer.len()
    }

    pub fn reset(&mut self) {
        self.packet = LogPacket::default();
        self.started = None;
    }
}

/// Everything the drain loop needs to ship batches.
struct Shipper {
    submitter: Arc<dyn Submitter>,
    codec: Arc<dyn Compressor>,
    index: FileIndex,
    namespace: String,
    retry_interval: Duration,
    scheduler: SchedulerHandle,
    cold: ColdBuffer,
}

impl Shipper {
    fn dump(&self, port: Port, packet: &LogPacket) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        match packet.decode_lines(self.codec.as_ref()) {
            Ok(lines) => {
                for (filename, line) in lines {
                    trace!("{} <- {}: {}", port, filename, String::from_utf8_lossy(&line));
                }
            }
            Err(e) => trace!("Could not decode {} packet: {}", port, e),
        }
    }

    async fn submit_with_retry(&self, port: Port, packet: &LogPacket) -> Result<(), ShipperError> {
        self.dump(port, packet);
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            match self.submitter.submit(port, packet).await {
                Ok(()) => {
                    trace!("{} accepted {} lines after {} attempts", port, packet.len(), attempts);
                    return Ok(());
                }
                Err(e) if e.is_backpressure() => {
                    if !self.scheduler.is_running() {
                        return Err(ShipperError::Stopped);
                    }
                    warn!(
                        "{} is saturated ({}), retrying in {:?} (attempt {})",
                        port, e, self.retry_interval, attempts
                    );
                    tokio::time::sleep(self.retry_interval).await;
                    if !self.scheduler.is_running() {
                        return Err(ShipperError::Stopped);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn flush_cold(&mut self) -> Result<(), ShipperError> {
        let mut packet = self.cold.packet().clone();
        packet.compact()?;
        let raw = packet.buffer.len();
        packet.compress(self.codec.as_ref())?;
        packet.namespace.clone_from(&self.namespace);
        debug!(
            "Flushing {} cold lines ({} bytes, {} compressed)",
            packet.len(),
            raw,
            packet.buffer.len()
        );

        self.submit_with_retry(Port::Cold, &packet).await?;
        self.cold.reset();
        Ok(())
    }
}

#[async_trait]
impl Submit for Shipper {
    async fn submit_hot(&mut self, lines: Vec<LogLine>) -> Result<(), ShipperError> {
        let mut packet = LogPacket::from_lines(&lines, &self.index)?;
        if packet.is_empty() {
            return Ok(());
        }
        packet.compact()?;
        packet.namespace.clone_from(&self.namespace);
        self.submit_with_retry(Port::Hot, &packet).await
    }

    async fn submit_cold(&mut self, lines: Vec<LogLine>) -> Result<(), ShipperError> {
        let packet = LogPacket::from_lines(&lines, &self.index)?;
        self.cold.add(packet);
        if self.cold.should_flush(Instant::now()) {
            self.flush_cold().await?;
        }
        Ok(())
    }
}

pub struct Transport {
    scheduler: Scheduler,
    shipper: Shipper,
}

impl Transport {
    pub fn new(
        config: &AgentConfig,
        submitter: Arc<dyn Submitter>,
        codec: Arc<dyn Compressor>,
        hook: Option<ClassificationHook>,
    ) -> Result<Self, ShipperError> {
        let scheduler = Scheduler::new(config, hook)?;
        let resolved = scheduler.config();
        let index = FileIndex::new(resolved.files.iter().map(|f| f.filename.clone()))?;

        let shipper = Shipper {
            submitter,
            codec,
            index,
            namespace: resolved.namespace.clone(),
            retry_interval: resolved.retry_interval(),
            scheduler: scheduler.handle(),
            cold: ColdBuffer::new(resolved.cold_send_threshold, resolved.cold_timeout()),
        };
        info!(
            "Transport ready for namespace {} with {} files",
            shipper.namespace,
            resolved.files.len()
        );
        Ok(Self { scheduler, shipper })
    }

    /// Runs the pipeline until it is closed or fails. The transport is closed on return.
    pub async fn run(&mut self) -> Result<(), ShipperError> {
        let result = self.scheduler.run(&mut self.shipper).await;
        if let Err(e) = &result {
            error!("Transport failed: {}", e);
        }
        self.close();
        result
    }

    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        self.scheduler.config()
    }

    pub fn close(&self) {
        if !self.shipper.cold.packet().is_empty() {
            warn!(
                "Closing with {} unsent cold bytes",
                self.shipper.cold.buffered_bytes()
            );
        }
        self.scheduler.close();
    }
}
