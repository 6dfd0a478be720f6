// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owns the tailed files and reacts to filesystem change notifications.
//!
//! A single OS thread receives notifications from the `notify` backend. Each
//! data-modification event on a registered file validates its offset and reads
//! the newly appended lines, which runs the file's line handler. The thread
//! exits when [`Watcher::stop`] is called or on the first terminal error; the
//! error is kept for [`Watcher::take_error`] and completion is observable with
//! [`Watcher::wait`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::errors::{LineBufferError, WatcherError};
use crate::line_buffer::{LineBuffer, LineHandler};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

type Files = Arc<Mutex<HashMap<PathBuf, LineBuffer>>>;

pub struct Watcher {
    files: Files,
    backend: Mutex<RecommendedWatcher>,
    stop_flag: Arc<AtomicBool>,
    done: CancellationToken,
    errors: Mutex<Receiver<WatcherError>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("files", &self.file_names())
            .field("stopped", &self.stop_flag.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Subscribes to filesystem notifications and starts the processing thread.
    pub fn new() -> Result<Self, WatcherError> {
        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let backend = notify::recommended_watcher(move |res| {
            // The receiver only disappears once the processing thread has exited.
            let _ = event_tx.send(res);
        })?;

        let files: Files = Arc::new(Mutex::new(HashMap::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        let (error_tx, error_rx) = mpsc::sync_channel(1);

        let worker = Worker {
            files: files.clone(),
            stop_flag: stop_flag.clone(),
            done: done.clone(),
            errors: error_tx,
        };
        thread::Builder::new()
            .name("log-shipper-watcher".to_owned())
            .spawn(move || worker.run(&event_rx))
            .map_err(WatcherError::Spawn)?;

        Ok(Self {
            files,
            backend: Mutex::new(backend),
            stop_flag,
            done,
            errors: Mutex::new(error_rx),
        })
    }

    /// Starts tailing `path` from its current end.
    pub fn add_file(&self, path: impl AsRef<Path>, handler: LineHandler) -> Result<(), WatcherError> {
        let path = path.as_ref();
        let key = canonical(path).map_err(|source| LineBufferError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        #[allow(clippy::expect_used)]
        let mut files = self.files.lock().expect("lock poisoned");
        if files.contains_key(&key) {
            return Err(WatcherError::AlreadyRegistered(path.to_path_buf()));
        }
        let buffer = LineBuffer::new(path, handler)?;
        {
            #[allow(clippy::expect_used)]
            let mut backend = self.backend.lock().expect("lock poisoned");
            backend.watch(&key, RecursiveMode::NonRecursive)?;
        }
        files.insert(key, buffer);
        info!("Watching {}", path.display());
        Ok(())
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> Result<(), WatcherError> {
        let path = path.as_ref();
        let key = canonical(path).unwrap_or_else(|_| path.to_path_buf());

        #[allow(clippy::expect_used)]
        let mut files = self.files.lock().expect("lock poisoned");
        if files.remove(&key).is_none() {
            return Err(WatcherError::NotRegistered(path.to_path_buf()));
        }
        self.unwatch(&key);
        info!("Stopped watching {}", path.display());
        Ok(())
    }

    /// Registered filenames as they were passed to [`Watcher::add_file`].
    #[must_use]
    pub fn file_names(&self) -> Vec<PathBuf> {
        #[allow(clippy::expect_used)]
        let files = self.files.lock().expect("lock poisoned");
        files.values().map(|b| b.name().to_path_buf()).collect()
    }

    #[must_use]
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let key = canonical(path).unwrap_or_else(|_| path.to_path_buf());
        #[allow(clippy::expect_used)]
        let files = self.files.lock().expect("lock poisoned");
        files.contains_key(&key)
    }

    /// Validates the offset of a registered file and reads its new lines.
    pub fn process_file(&self, path: impl AsRef<Path>) -> Result<usize, WatcherError> {
        process(&self.files, path.as_ref())?
            .ok_or_else(|| WatcherError::NotRegistered(path.as_ref().to_path_buf()))
    }

    /// Asks the processing thread to exit. It notices within a short timeout.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the processing thread has exited.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Token cancelled when the processing thread exits.
    #[must_use]
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Terminal error of the processing thread, if any. Never blocks.
    pub fn take_error(&self) -> Option<WatcherError> {
        #[allow(clippy::expect_used)]
        let errors = self.errors.lock().expect("lock poisoned");
        errors.try_recv().ok()
    }

    /// Stops the thread and releases every tailed file.
    pub fn close(&self) {
        self.stop();
        #[allow(clippy::expect_used)]
        let mut files = self.files.lock().expect("lock poisoned");
        for key in files.keys() {
            self.unwatch(key);
        }
        files.clear();
    }

    fn unwatch(&self, key: &Path) {
        #[allow(clippy::expect_used)]
        let mut backend = self.backend.lock().expect("lock poisoned");
        if let Err(e) = backend.unwatch(key) {
            debug!("Failed to unwatch {}: {}", key.display(), e);
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    files: Files,
    stop_flag: Arc<AtomicBool>,
    done: CancellationToken,
    errors: SyncSender<WatcherError>,
}

impl Worker {
    fn run(self, events: &Receiver<notify::Result<Event>>) {
        debug!("Watcher thread started");
        if let Err(e) = self.process_events(events) {
            error!("Watcher stopped on error: {}", e);
            let _ = self.errors.try_send(e);
        }
        self.done.cancel();
        debug!("Watcher thread exited");
    }

    fn process_events(&self, events: &Receiver<notify::Result<Event>>) -> Result<(), WatcherError> {
        while !self.stop_flag.load(Ordering::Acquire) {
            let event = match events.recv_timeout(RECV_TIMEOUT) {
                Ok(event) => event?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            };
            if !is_data_change(&event.kind) {
                trace!("Ignoring {:?} on {:?}", event.kind, event.paths);
                continue;
            }
            for path in &event.paths {
                if process(&self.files, path)?.is_none() {
                    debug!("Ignoring change on unregistered file {}", path.display());
                }
            }
        }
        Ok(())
    }
}

fn is_data_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
    )
}

/// Returns `None` when `path` is not registered.
fn process(files: &Files, path: &Path) -> Result<Option<usize>, WatcherError> {
    #[allow(clippy::expect_used)]
    let mut files = files.lock().expect("lock poisoned");
    let key = if files.contains_key(path) {
        path.to_path_buf()
    } else {
        match canonical(path) {
            Ok(key) => key,
            Err(_) => return Ok(None),
        }
    };
    let Some(buffer) = files.get_mut(&key) else {
        return Ok(None);
    };
    buffer.validate_offset()?;
    let lines = buffer.read_new_lines()?;
    trace!("Read {} lines from {}", lines, buffer.name().display());
    Ok(Some(lines))
}

fn canonical(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(path)
}
