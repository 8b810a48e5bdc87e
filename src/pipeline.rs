//! Pipeline lifecycle
//!
//! Wires the capture engine, analyzer, broadcaster and supervisor around one
//! `StateStore`, applies live reconfiguration, and tears everything down on
//! shutdown.

use crate::analysis::{Analyzer, SpectrumConfig};
use crate::audio::{ActiveDevice, CaptureEngine, CaptureError, CaptureRequest, RingSlot};
use crate::config::{ConfigError, ConfigUpdate, PipelineConfig};
use crate::server::Broadcaster;
use crate::state::{RunStatus, StateStore};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(8);
const BACKOFF_FACTOR: f64 = 1.5;
const SUPERVISOR_POLL: Duration = Duration::from_millis(250);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Pipeline error types
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("Background task failed: {0}")]
    Task(String),
}

pub struct Pipeline {
    store: Arc<StateStore>,
    capture: Arc<Mutex<CaptureEngine>>,
    spectrum_tx: watch::Sender<SpectrumConfig>,
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Serializes configuration changes end to end
    reconfigure_lock: tokio::sync::Mutex<()>,
    clock: Instant,
    ring: RingSlot,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let config = config.clamped();
        config.validate()?;

        let store = Arc::new(StateStore::new(config.clone()));
        let ring = RingSlot::new();
        let capture = CaptureEngine::new(Arc::clone(&store), ring.clone());
        let (spectrum_tx, _) = watch::channel(SpectrumConfig::from(&config));

        Ok(Self {
            broadcaster: Broadcaster::new(Arc::clone(&store)),
            store,
            capture: Arc::new(Mutex::new(capture)),
            spectrum_tx,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            reconfigure_lock: tokio::sync::Mutex::new(()),
            clock: Instant::now(),
            ring,
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Cancelled when the pipeline shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the background tasks and open the input device.
    ///
    /// A device that fails to open is not fatal: the state goes to `error` and the
    /// supervisor keeps retrying.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let analyzer = Analyzer::new(
            Arc::clone(&self.store),
            self.ring.clone(),
            self.spectrum_tx.subscribe(),
            self.clock,
        );

        let handles = vec![
            tokio::spawn(analyzer.run(self.shutdown.clone())),
            tokio::spawn(self.broadcaster.clone().run(self.shutdown.clone())),
            tokio::spawn(supervise(
                Arc::clone(&self.store),
                Arc::clone(&self.capture),
                self.shutdown.clone(),
            )),
        ];
        self.lock_tasks().extend(handles);

        let request = CaptureRequest::from(&self.store.get().config);
        match with_capture(&self.capture, move |engine| engine.start(&request)).await {
            Ok(active) => log::info!("Pipeline started on '{}'", active.identity.name),
            Err(PipelineError::Capture(e)) => {
                log::error!("Failed to open input device: {}, will retry", e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Apply a partial configuration change.
    ///
    /// Analysis options take effect on the next cycle. Device or format changes
    /// restart capture; if that fails the new configuration is kept and the
    /// supervisor retries it.
    pub async fn reconfigure(&self, update: &ConfigUpdate) -> Result<PipelineConfig, PipelineError> {
        let _guard = self.reconfigure_lock.lock().await;

        let current = self.store.get().config.clone();
        let next = current.apply(update)?;
        if next == current {
            return Ok(next);
        }

        self.store.set_config(next.clone());
        self.spectrum_tx.send_replace(SpectrumConfig::from(&next));
        log::info!(
            "Configuration updated: {} Hz, {} ch, fft {}, {} fps, gain {:.2}, smoothing {:.2}",
            next.sample_rate,
            next.channels,
            next.fft_size,
            next.fps_cap,
            next.gain,
            next.smoothing
        );

        let capture_live = self.capture_phase() != RunStatus::Stopped;
        if capture_live && current.needs_capture_restart(&next) && !self.shutdown.is_cancelled() {
            let request = CaptureRequest::from(&next);
            with_capture(&self.capture, move |engine| engine.reconfigure(&request)).await?;
        }

        Ok(next)
    }

    /// Capture phase as mirrored into the store; never waits on the capture engine
    pub fn capture_phase(&self) -> RunStatus {
        self.store.get().status
    }

    /// Cancel every task, close the device, and wait a bounded time for the tasks
    pub async fn stop(&self) {
        self.shutdown.cancel();

        if let Err(e) = with_capture(&self.capture, |engine| {
            engine.stop();
            Ok::<_, CaptureError>(())
        })
        .await
        {
            log::error!("Failed to stop capture: {}", e);
        }

        let handles: Vec<_> = self.lock_tasks().drain(..).collect();
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    log::error!("Pipeline task failed: {}", e);
                }
            }
        })
        .await;

        if joined.is_err() {
            log::warn!("Pipeline tasks did not finish within {:?}", SHUTDOWN_GRACE);
        }
        log::info!("Pipeline stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Run a capture operation on the blocking pool; opening a device can take a while
async fn with_capture<T, F>(capture: &Arc<Mutex<CaptureEngine>>, f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&mut CaptureEngine) -> Result<T, CaptureError> + Send + 'static,
{
    let capture = Arc::clone(capture);
    tokio::task::spawn_blocking(move || {
        let mut engine = capture.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut engine)
    })
    .await
    .map_err(|e| PipelineError::Task(e.to_string()))?
    .map_err(PipelineError::from)
}

fn next_backoff(current: Duration) -> Duration {
    current.mul_f64(BACKOFF_FACTOR).min(MAX_BACKOFF)
}

/// Restart capture whenever it lands in the error state, with growing delays
async fn supervise(
    store: Arc<StateStore>,
    capture: Arc<Mutex<CaptureEngine>>,
    shutdown: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(SUPERVISOR_POLL) => {}
        }

        if store.get().status != RunStatus::Error {
            backoff = INITIAL_BACKOFF;
            continue;
        }

        log::warn!("Capture failed, retrying in {:.1}s", backoff.as_secs_f32());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }

        // A reconfigure may have recovered capture while we waited
        if store.get().status != RunStatus::Error {
            continue;
        }

        let request = CaptureRequest::from(&store.get().config);
        let restarted: Result<ActiveDevice, PipelineError> =
            with_capture(&capture, move |engine| engine.reconfigure(&request)).await;
        match restarted {
            Ok(active) => {
                log::info!("Capture recovered on '{}'", active.identity.name);
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                log::error!("Capture restart failed: {}", e);
                backoff = next_backoff(backoff);
            }
        }
    }

    log::debug!("Supervisor stopped");
}
