// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults shared by the configuration, scheduler and transport.

pub const DEFAULT_NAMESPACE: &str = "anonymous";
pub const DEFAULT_TARGET_IP: &str = "localhost";
pub const DEFAULT_TARGET_PORT: &str = "8972";

pub const DEFAULT_HOT_RING_CAPACITY: usize = 32;
pub const DEFAULT_COLD_RING_CAPACITY: usize = 32;

/// 0 drains the whole ring on every wake-up.
pub const DEFAULT_RING_THRESHOLD: usize = 0;

pub const DEFAULT_COLD_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_COLD_SEND_THRESHOLD_BYTES: usize = 4_096;

/// Upper bound on the drain loop period; keeps the loop live without events.
pub const MAX_POLLING_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = MAX_POLLING_INTERVAL_MS;

pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// File indexes travel as `u8`, so a packet can reference at most 255 files.
pub const MAX_FILES: usize = 256;

/// Grace period after which an empty ring ends a drain.
pub const POP_GRACE_PERIOD_MS: u64 = 1;

/// Marker a collector puts in its error text when its queue is saturated.
pub const BACKPRESSURE_MARKER: &str = "queue is full";
