use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tokio::sync::watch;

use super::state::{
    FilePayload, TransportError, UploadOutcome, UploadPhase, UploadProgress, UploadState,
};
use super::transport::{ProgressSink, ProgressTick, TransferContext, UploadTransport};

#[derive(Clone, Copy, Debug, Default)]
pub struct UploadOptions {
    /// Enables the cooperative pause gate. Only the chunked wire format
    /// observes it; pausing a single-request upload has nothing to gate.
    pub resumable: bool,
    pub debug: bool,
}

pub struct UploadEngine<T>
where
    T: UploadTransport,
{
    transport: T,
    options: UploadOptions,
    state: Arc<RwLock<UploadState>>,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
    cancel_tx: Arc<RwLock<watch::Sender<bool>>>,
}

impl<T> UploadEngine<T>
where
    T: UploadTransport,
{
    pub fn new(transport: T, options: UploadOptions) -> Self {
        let (pause_tx, pause_rx) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            transport,
            options,
            state: Arc::new(RwLock::new(UploadState::idle())),
            pause_tx,
            pause_rx,
            cancel_tx: Arc::new(RwLock::new(cancel_tx)),
        }
    }

    /// Uploads the given files strictly in order; each file completes fully
    /// before the next starts (parallelism is chunk-level, inside one file).
    /// One file resolves to `UploadOutcome::Single`, several to `Many` in
    /// file order.
    pub async fn upload(&self, files: Vec<FilePayload>) -> Result<UploadOutcome, TransportError> {
        let cancel_rx = self.arm();
        let total: u64 = files.iter().map(FilePayload::len).sum();
        {
            let mut state = write_state(&self.state);
            *state = UploadState::idle();
            state.phase = UploadPhase::Uploading;
            state.progress.total = total;
            state.started_at = Some(Instant::now());
        }
        let _ = self.pause_tx.send(false);
        if self.options.debug {
            tracing::debug!(files = files.len(), total, "upload started");
        }

        let single = files.len() == 1;
        let mut tokens = Vec::with_capacity(files.len());
        let mut base = 0u64;
        for file in &files {
            let ctx = TransferContext {
                progress: self.progress_sink(base),
                cancel: cancel_rx.clone(),
                pause: self.pause_rx.clone(),
            };
            match self.transport.upload(file, &ctx).await {
                Ok(token) => {
                    tokens.push(token);
                    base += file.len();
                    apply_tick(&self.state, base, ProgressTick::default());
                }
                Err(error) => {
                    if matches!(error, TransportError::Cancelled { .. }) {
                        // cancel() already zeroed the state.
                        return Err(error);
                    }
                    if self.options.debug {
                        tracing::debug!(file = %file.name, %error, "upload failed");
                    }
                    let mut state = write_state(&self.state);
                    state.phase = UploadPhase::Error;
                    state.error = Some(error.clone());
                    return Err(error);
                }
            }
        }

        let outcome = if single {
            UploadOutcome::Single(tokens.remove(0))
        } else {
            UploadOutcome::Many(tokens)
        };
        {
            let mut state = write_state(&self.state);
            state.phase = UploadPhase::Completed;
            state.progress.loaded = total;
            state.progress.percent = 100;
            state.progress.remaining = 0;
            state.outcome = Some(outcome.clone());
        }
        if self.options.debug {
            tracing::debug!(total, "upload completed");
        }
        Ok(outcome)
    }

    /// Cooperative pause: in-flight chunks complete, no new chunk starts
    /// until `resume()`. A no-op unless `resumable` is enabled and an upload
    /// is running.
    pub fn pause(&self) -> bool {
        if !self.options.resumable {
            return false;
        }
        let mut state = write_state(&self.state);
        if state.phase != UploadPhase::Uploading {
            return false;
        }
        state.phase = UploadPhase::Paused;
        let _ = self.pause_tx.send(true);
        true
    }

    pub fn resume(&self) -> bool {
        if !self.options.resumable {
            return false;
        }
        let mut state = write_state(&self.state);
        if state.phase != UploadPhase::Paused {
            return false;
        }
        state.phase = UploadPhase::Uploading;
        let _ = self.pause_tx.send(false);
        true
    }

    /// Aborts the in-flight transport calls and zeroes the state.
    pub fn cancel(&self) {
        let _ = read_cancel(&self.cancel_tx).send(true);
        let _ = self.pause_tx.send(false);
        *write_state(&self.state) = UploadState::idle();
    }

    /// Clears state without aborting; intended for post-completion cleanup.
    pub fn reset(&self) {
        *write_state(&self.state) = UploadState::idle();
    }

    pub fn state(&self) -> UploadState {
        read_state(&self.state).clone()
    }

    pub fn phase(&self) -> UploadPhase {
        read_state(&self.state).phase
    }

    pub fn progress(&self) -> UploadProgress {
        read_state(&self.state).progress
    }

    pub fn outcome(&self) -> Option<UploadOutcome> {
        read_state(&self.state).outcome.clone()
    }

    pub fn error(&self) -> Option<TransportError> {
        read_state(&self.state).error.clone()
    }

    fn arm(&self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        match self.cancel_tx.write() {
            Ok(mut guard) => *guard = tx,
            Err(poisoned) => *poisoned.into_inner() = tx,
        }
        rx
    }

    fn progress_sink(&self, base: u64) -> ProgressSink {
        let state = Arc::clone(&self.state);
        Arc::new(move |tick| apply_tick(&state, base, tick))
    }
}

fn read_state(lock: &RwLock<UploadState>) -> RwLockReadGuard<'_, UploadState> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_state(lock: &RwLock<UploadState>) -> RwLockWriteGuard<'_, UploadState> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_cancel(lock: &RwLock<watch::Sender<bool>>) -> RwLockReadGuard<'_, watch::Sender<bool>> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Folds a transport tick into the shared progress, keeping `loaded`
/// monotonic and recomputing percent/speed/remaining from the whole-upload
/// start instant.
pub(super) fn apply_tick(state: &RwLock<UploadState>, base: u64, tick: ProgressTick) {
    let mut state = write_state(state);
    if state.phase != UploadPhase::Uploading && state.phase != UploadPhase::Paused {
        // A late tick from a cancelled or reset upload.
        return;
    }
    let loaded = base + tick.loaded;
    if loaded > state.progress.loaded {
        state.progress.loaded = loaded;
    }
    state.progress.current_chunk = tick.current_chunk;
    state.progress.total_chunks = tick.total_chunks;

    let total = state.progress.total;
    let loaded = state.progress.loaded;
    state.progress.percent = if total == 0 {
        0
    } else {
        ((loaded as f64 / total as f64) * 100.0).round() as u8
    };
    let elapsed = state
        .started_at
        .map(|started| started.elapsed().as_secs_f64())
        .unwrap_or_default();
    state.progress.speed = if elapsed > 0.0 {
        loaded as f64 / elapsed
    } else {
        0.0
    };
    state.progress.remaining = if state.progress.speed > 0.0 {
        ((total.saturating_sub(loaded)) as f64 / state.progress.speed).ceil() as u64
    } else {
        0
    };
}
