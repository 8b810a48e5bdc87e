//! Capture engine
//!
//! Owns exactly one cpal input stream at a time. The stream lives on a dedicated
//! `capture` thread because cpal streams are not `Send` on every platform; the
//! engine talks to that thread over a channel. The data callback only converts
//! samples and copies them into the ring buffer: no allocation, no logging, no
//! locks other than the ring's own.

use super::devices::{DeviceSelector, resolve_device};
use super::{CaptureError, RingBuffer, RingSlot};
use crate::config::{MAX_FFT_SIZE, PipelineConfig};
use crate::state::{DeviceIdentity, RunStatus, StateStore};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// Largest block converted in one pass; bigger callbacks are split
const MAX_BLOCK_FRAMES: usize = 4096;

/// What to open
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub device: DeviceSelector,
    /// Channel layout of the ring buffer (the device may deliver more or fewer)
    pub channels: u16,
    pub sample_rate: u32,
    pub buffer_seconds: f32,
}

impl From<&PipelineConfig> for CaptureRequest {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            device: DeviceSelector {
                id: config.device_id,
                name: config.device_name.clone(),
            },
            channels: config.channels,
            sample_rate: config.sample_rate,
            buffer_seconds: config.buffer_seconds,
        }
    }
}

/// The stream that was actually opened
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDevice {
    pub identity: DeviceIdentity,
    pub sample_rate: u32,
    pub channels: u16,
    pub device_channels: u16,
    pub sample_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseEvent {
    Start,
    Opened,
    OpenFailed,
    DeviceLost,
    Stop,
}

impl PhaseEvent {
    fn action(self) -> &'static str {
        match self {
            PhaseEvent::Start => "start",
            PhaseEvent::Opened => "mark opened",
            PhaseEvent::OpenFailed => "mark failed",
            PhaseEvent::DeviceLost => "report device loss",
            PhaseEvent::Stop => "stop",
        }
    }
}

/// Capture phase machine. `Running` is only reachable through `Stopped` → `Starting`.
fn next_phase(phase: RunStatus, event: PhaseEvent) -> Result<RunStatus, CaptureError> {
    use RunStatus::*;
    match (phase, event) {
        (Stopped, PhaseEvent::Start) => Ok(Starting),
        (Starting, PhaseEvent::Opened) => Ok(Running),
        (Starting, PhaseEvent::OpenFailed) => Ok(Error),
        (Running, PhaseEvent::DeviceLost) => Ok(Error),
        (_, PhaseEvent::Stop) => Ok(Stopped),
        (phase, event) => Err(CaptureError::InvalidTransition {
            action: event.action(),
            phase,
        }),
    }
}

/// Phase shared between the engine and its capture thread, mirrored into the store
#[derive(Clone)]
struct PhaseCell {
    phase: Arc<Mutex<RunStatus>>,
    store: Arc<StateStore>,
}

impl PhaseCell {
    fn get(&self) -> RunStatus {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn apply(&self, event: PhaseEvent, error: Option<String>) -> Result<RunStatus, CaptureError> {
        let mut phase = self.phase.lock().unwrap_or_else(|p| p.into_inner());
        let next = next_phase(*phase, event)?;
        *phase = next;
        match error {
            Some(message) if next == RunStatus::Error => self.store.set_error(message),
            _ => self.store.set_status(next),
        }
        Ok(next)
    }
}

enum WorkerSignal {
    Stop,
    StreamError(String),
}

struct CaptureWorker {
    signals: mpsc::Sender<WorkerSignal>,
    handle: thread::JoinHandle<()>,
}

pub struct CaptureEngine {
    store: Arc<StateStore>,
    ring: RingSlot,
    phase: PhaseCell,
    worker: Option<CaptureWorker>,
}

impl CaptureEngine {
    pub fn new(store: Arc<StateStore>, ring: RingSlot) -> Self {
        Self {
            phase: PhaseCell {
                phase: Arc::new(Mutex::new(RunStatus::Stopped)),
                store: Arc::clone(&store),
            },
            store,
            ring,
            worker: None,
        }
    }

    pub fn phase(&self) -> RunStatus {
        self.phase.get()
    }

    /// Open the input stream. Only valid while stopped.
    pub fn start(&mut self, request: &CaptureRequest) -> Result<ActiveDevice, CaptureError> {
        self.phase.apply(PhaseEvent::Start, None)?;

        let (signal_tx, signal_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let worker_ctx = WorkerContext {
            request: request.clone(),
            ring: self.ring.clone(),
            phase: self.phase.clone(),
            signals: signal_tx.clone(),
        };

        let spawned = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || run_capture_thread(worker_ctx, signal_rx, ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let error = CaptureError::Thread(e.to_string());
                self.phase.apply(PhaseEvent::OpenFailed, Some(error.to_string()))?;
                return Err(error);
            }
        };

        let ready = ready_rx.recv();
        match ready {
            Ok(Ok(active)) => {
                self.worker = Some(CaptureWorker {
                    signals: signal_tx,
                    handle,
                });
                self.store.set_device(Some(active.identity.clone()));
                Ok(active)
            }
            Ok(Err(error)) => {
                let _ = handle.join();
                self.ring.clear();
                self.phase.apply(PhaseEvent::OpenFailed, Some(error.to_string()))?;
                Err(error)
            }
            Err(_) => {
                let _ = handle.join();
                self.ring.clear();
                let error =
                    CaptureError::Thread("capture thread exited before opening the stream".into());
                self.phase.apply(PhaseEvent::OpenFailed, Some(error.to_string()))?;
                Err(error)
            }
        }
    }

    /// Close the stream and release the ring buffer. Safe to call in any phase.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.signals.send(WorkerSignal::Stop);
            if worker.handle.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
        self.ring.clear();
        self.store.set_device(None);
        // Stop is accepted from every phase
        let _ = self.phase.apply(PhaseEvent::Stop, None);
    }

    /// Stop, then start against a newly sized ring buffer
    pub fn reconfigure(&mut self, request: &CaptureRequest) -> Result<ActiveDevice, CaptureError> {
        self.stop();
        self.start(request)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

struct WorkerContext {
    request: CaptureRequest,
    ring: RingSlot,
    phase: PhaseCell,
    signals: mpsc::Sender<WorkerSignal>,
}

fn run_capture_thread(
    ctx: WorkerContext,
    signals: mpsc::Receiver<WorkerSignal>,
    ready: mpsc::SyncSender<Result<ActiveDevice, CaptureError>>,
) {
    let (stream, active) = match open_stream(&ctx) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Mark running before handing control back so a device error that arrives
    // immediately is still applied to the right phase
    if let Err(e) = ctx.phase.apply(PhaseEvent::Opened, None) {
        let _ = ready.send(Err(e));
        return;
    }

    log::info!(
        "Capturing from '{}' ({} Hz, {} device channel(s) -> {}, {})",
        active.identity.name,
        active.sample_rate,
        active.device_channels,
        active.channels,
        active.sample_format
    );
    let _ = ready.send(Ok(active));

    loop {
        match signals.recv() {
            Ok(WorkerSignal::Stop) | Err(_) => break,
            Ok(WorkerSignal::StreamError(message)) => {
                log::error!("Audio device disconnected or stream error: {}", message);
                let _ = ctx.phase.apply(PhaseEvent::DeviceLost, Some(message));
                break;
            }
        }
    }

    drop(stream);
}

fn open_stream(ctx: &WorkerContext) -> Result<(cpal::Stream, ActiveDevice), CaptureError> {
    let host = cpal::default_host();
    let (id, device, name) = resolve_device(&host, &ctx.request.device)?;
    let (config, format) = choose_config(&device, ctx.request.channels, ctx.request.sample_rate)?;

    // The negotiated rate may be lower than requested; any FFT size must still fit
    let ring = Arc::new(RingBuffer::with_min_frames(
        ctx.request.buffer_seconds,
        config.sample_rate.0,
        ctx.request.channels,
        MAX_FFT_SIZE,
    ));
    ctx.ring.install(Arc::clone(&ring));

    let errors = ctx.signals.clone();
    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, ring, errors)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, ring, errors)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, ring, errors)?,
        SampleFormat::I32 => build_stream::<i32>(&device, &config, ring, errors)?,
        other => return Err(CaptureError::UnsupportedFormat(format!("{other:?}"))),
    };
    stream.play()?;

    Ok((
        stream,
        ActiveDevice {
            identity: DeviceIdentity { id, name },
            sample_rate: config.sample_rate.0,
            channels: ctx.request.channels,
            device_channels: config.channels,
            sample_format: format!("{format:?}"),
        },
    ))
}

/// Prefer a config at the requested rate with the requested channel count and
/// `f32` samples; fall back to the device default.
fn choose_config(
    device: &Device,
    channels: u16,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat), CaptureError> {
    let rate = SampleRate(sample_rate);
    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Config(e.to_string()))?
        .collect();

    let best = ranges
        .iter()
        .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .min_by_key(|r| {
            (
                r.channels() != channels,
                r.sample_format() != SampleFormat::F32,
                r.channels(),
            )
        });

    if let Some(range) = best {
        let supported = range.clone().with_sample_rate(rate);
        return Ok((supported.config(), supported.sample_format()));
    }

    let fallback = device
        .default_input_config()
        .map_err(|e| CaptureError::Config(e.to_string()))?;
    log::warn!(
        "No input config at {} Hz, using device default {} Hz",
        sample_rate,
        fallback.sample_rate().0
    );
    Ok((fallback.config(), fallback.sample_format()))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    ring: Arc<RingBuffer>,
    errors: mpsc::Sender<WorkerSignal>,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let mut mapper = ChannelMapper::new(config.channels, ring.channels());

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mapper.write(data, &ring);
        },
        move |err| {
            let _ = errors.send(WorkerSignal::StreamError(err.to_string()));
        },
        None,
    )?;

    Ok(stream)
}

/// Converts device frames to the ring's channel layout using a preallocated buffer
pub struct ChannelMapper {
    input: usize,
    output: usize,
    scratch: Vec<f32>,
}

impl ChannelMapper {
    pub fn new(input: u16, output: u16) -> Self {
        let input = input.max(1) as usize;
        let output = output.max(1) as usize;
        Self {
            input,
            output,
            scratch: Vec::with_capacity(MAX_BLOCK_FRAMES * output),
        }
    }

    /// Convert `data` and write it into `ring`. Never allocates.
    ///
    /// Equal layouts are copied, many-to-mono is averaged, mono-to-many is
    /// duplicated, and otherwise channels are taken in order (wrapping).
    pub fn write<T>(&mut self, data: &[T], ring: &RingBuffer)
    where
        T: cpal::Sample,
        f32: cpal::FromSample<T>,
    {
        for block in data.chunks(self.input * MAX_BLOCK_FRAMES) {
            self.scratch.clear();
            for frame in block.chunks_exact(self.input) {
                self.map_frame(frame);
            }
            ring.write(&self.scratch);
        }
    }

    fn map_frame<T>(&mut self, frame: &[T])
    where
        T: cpal::Sample,
        f32: cpal::FromSample<T>,
    {
        let sample = |i: usize| -> f32 { cpal::Sample::from_sample(frame[i]) };

        if self.input == self.output {
            for i in 0..self.input {
                self.scratch.push(sample(i));
            }
        } else if self.output == 1 {
            let sum: f32 = (0..self.input).map(sample).sum();
            self.scratch.push(sum / self.input as f32);
        } else {
            for c in 0..self.output {
                self.scratch.push(sample(c % self.input));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_FFT_SIZE, PipelineConfig};

    #[test]
    fn test_phase_machine_requires_stop_before_restart() {
        use RunStatus::*;

        assert_eq!(next_phase(Stopped, PhaseEvent::Start).unwrap(), Starting);
        assert_eq!(next_phase(Starting, PhaseEvent::Opened).unwrap(), Running);
        assert_eq!(next_phase(Running, PhaseEvent::DeviceLost).unwrap(), Error);

        assert!(next_phase(Error, PhaseEvent::Start).is_err());
        assert!(next_phase(Running, PhaseEvent::Start).is_err());
        assert!(next_phase(Error, PhaseEvent::Opened).is_err());
        assert!(next_phase(Stopped, PhaseEvent::DeviceLost).is_err());

        for phase in [Stopped, Starting, Running, Error] {
            assert_eq!(next_phase(phase, PhaseEvent::Stop).unwrap(), Stopped);
        }
    }

    #[test]
    fn test_phase_cell_mirrors_into_store() {
        let store = Arc::new(StateStore::new(PipelineConfig::default()));
        let cell = PhaseCell {
            phase: Arc::new(Mutex::new(RunStatus::Stopped)),
            store: Arc::clone(&store),
        };

        cell.apply(PhaseEvent::Start, None).unwrap();
        cell.apply(PhaseEvent::Opened, None).unwrap();
        assert_eq!(store.get().status, RunStatus::Running);

        cell.apply(PhaseEvent::DeviceLost, Some("unplugged".into())).unwrap();
        let state = store.get();
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("unplugged"));

        let err = cell.apply(PhaseEvent::Start, None).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidTransition { phase: RunStatus::Error, .. }));
    }

    #[test]
    fn test_stop_is_idempotent_without_stream() {
        let store = Arc::new(StateStore::new(PipelineConfig::default()));
        let slot = RingSlot::new();
        slot.install(Arc::new(RingBuffer::new(16, 1)));

        let mut engine = CaptureEngine::new(Arc::clone(&store), slot.clone());
        engine.stop();
        engine.stop();

        assert_eq!(engine.phase(), RunStatus::Stopped);
        assert!(slot.get().is_none());
        assert_eq!(store.get().status, RunStatus::Stopped);
    }

    #[test]
    fn test_mapper_copies_matching_layout() {
        let ring = RingBuffer::new(8, 2);
        let mut mapper = ChannelMapper::new(2, 2);
        mapper.write(&[0.1f32, 0.2, 0.3, 0.4], &ring);
        assert_eq!(ring.read_latest(8), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_mapper_downmixes_to_mono() {
        let ring = RingBuffer::new(8, 1);
        let mut mapper = ChannelMapper::new(2, 1);
        mapper.write(&[1.0f32, 0.0, 0.5, 0.5], &ring);
        assert_eq!(ring.read_latest(8), vec![0.5, 0.5]);
    }

    #[test]
    fn test_mapper_duplicates_mono_and_converts_integers() {
        let ring = RingBuffer::new(8, 2);
        let mut mapper = ChannelMapper::new(1, 2);
        mapper.write(&[0i16, i16::MIN], &ring);
        assert_eq!(ring.read_latest(8), vec![0.0, 0.0, -1.0, -1.0]);
    }

    #[test]
    fn test_mapper_takes_leading_channels() {
        let ring = RingBuffer::new(8, 2);
        let mut mapper = ChannelMapper::new(4, 2);
        mapper.write(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &ring);
        assert_eq!(ring.read_latest(8), vec![1.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_mapper_splits_large_blocks_without_growing() {
        let ring = RingBuffer::new(MAX_BLOCK_FRAMES * 3, 1);
        let mut mapper = ChannelMapper::new(1, 1);
        let capacity = mapper.scratch.capacity();

        let data: Vec<f32> = (0..MAX_BLOCK_FRAMES * 2 + 10).map(|i| i as f32).collect();
        mapper.write(&data, &ring);

        assert_eq!(mapper.scratch.capacity(), capacity);
        assert_eq!(ring.frames_written(), data.len() as u64);
        assert_eq!(ring.blocks_written(), 3);
        assert_eq!(ring.read_latest(1), vec![(data.len() - 1) as f32]);
    }
}
