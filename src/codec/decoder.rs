// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder session: a worker thread feeding a hardware decoder backend from
//! a bounded input queue, with asynchronous output delivery.
//!
//! The session state machine is Uninitialized -> Ready (`init` validates
//! metadata only) -> Running (the hardware codec is created lazily on the
//! first `decode`) and back: `flush` returns to Ready with the codec torn
//! down, `drain` ends in Stopped after EOS, `stop` returns to
//! Uninitialized.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;

use anyhow::anyhow;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::codec::CodecError;
use crate::codec::CodecResult;
use crate::codec::CodedFrame;
use crate::codec::DecoderListener;
use crate::codec::DecoderMetadata;
use crate::codec::VideoDecoder;
use crate::pool::BufferPool;
use crate::video_frame::BufferHandle;
use crate::video_frame::GraphicBuffer;
use crate::video_frame::OutputGeometry;
use crate::video_frame::YcbcrLayout;

/// Coded frames buffered ahead of the hardware. `decode` blocks once this
/// many are queued.
const INPUT_QUEUE_CAPACITY: usize = 8;

/// How a hardware decoder hands frames back, fixed at codec creation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Decoded frames are pool-bound hardware buffers the application may
    /// hold on to.
    ZeroCopy,
    /// Decoded frames are mapped views only valid during the callback.
    Mapped,
}

/// Events a hardware decoder pushes into the session, from backend-owned
/// threads. For a given handle, `buffer_created` precedes the first
/// `frame_decoded` referencing it; only the zero-copy mode uses those two.
pub trait DecoderEvents: Send + Sync {
    fn buffer_created(&self, handle: Arc<dyn BufferHandle>);

    /// Returns false if the frame was not consumed and the backend should
    /// reclaim the buffer immediately.
    fn frame_decoded(&self, handle: Arc<dyn BufferHandle>) -> bool;

    /// The backend invalidated all buffers delivered so far.
    fn buffers_released(&self);

    /// The coded stream changed geometry; takes effect before the next
    /// `frame_decoded`.
    fn size_changed(&self, geometry: OutputGeometry);

    /// Everything submitted before `drain` has been delivered.
    fn eos(&self);

    fn error(&self, description: String);
}

/// Interface to one hardware decoder instance. Calls are made from the
/// session's worker thread, never concurrently.
pub trait DecoderBackend: Send {
    /// Creates and starts the hardware codec, reporting its output mode.
    /// `events` stays registered until `stop`.
    fn start(
        &mut self,
        metadata: &DecoderMetadata,
        events: Arc<dyn DecoderEvents>,
    ) -> CodecResult<OutputMode>;

    /// Feeds one coded frame. May block waiting for a hardware input slot,
    /// and must return once the coded bytes have been consumed.
    fn submit(&mut self, frame: &CodedFrame) -> CodecResult<()>;

    /// Marks end of stream; buffered output keeps arriving, then `eos`.
    fn drain(&mut self) -> CodecResult<()>;

    /// Destroys the codec, discarding anything in flight, and drops the
    /// events reference.
    fn stop(&mut self);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    Running,
    Stopped,
}

enum InputJob {
    Frame(CodedFrame),
    Drain,
}

struct SessionState {
    phase: Phase,
    metadata: Option<DecoderMetadata>,
    mode: Option<OutputMode>,
    queue: VecDeque<InputJob>,
    shutdown: bool,
}

struct BackendSlot {
    backend: Box<dyn DecoderBackend>,
    started: bool,
}

struct DecoderShared {
    state: Mutex<SessionState>,
    /// Signals queue space to blocked `decode` callers.
    space: Condvar,
    /// Semaphore waking the worker, one count per queued job.
    wake: EventFd,
    backend: Mutex<BackendSlot>,
    listener: Mutex<Option<Arc<dyn DecoderListener>>>,
    /// Zero-copy output buffers.
    pool: BufferPool,
    /// Mapped-mode layout template, re-derived on `size_changed`.
    layout: Mutex<Option<YcbcrLayout>>,
}

/// Decoder session over a `dyn DecoderBackend`; handed out by a provider as
/// `Arc<dyn VideoDecoder>`.
pub struct DecoderSession {
    shared: Arc<DecoderShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DecoderSession {
    pub fn new(backend: Box<dyn DecoderBackend>) -> CodecResult<Self> {
        let wake = EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)
            .map_err(|err| anyhow!("failed to create the worker wake eventfd: {}", err))?;
        Ok(Self {
            shared: Arc::new(DecoderShared {
                state: Mutex::new(SessionState {
                    phase: Phase::Uninitialized,
                    metadata: None,
                    mode: None,
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
                space: Condvar::new(),
                wake,
                backend: Mutex::new(BackendSlot { backend, started: false }),
                listener: Mutex::new(None),
                pool: BufferPool::new(),
                layout: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    fn spawn_worker_if_needed(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("videohal-decoder".to_string())
            .spawn(move || worker_loop(shared));
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(err) => log::error!("failed to spawn the decoder worker: {}", err),
        }
    }
}

fn worker_loop(shared: Arc<DecoderShared>) {
    loop {
        if shared.wake.read().is_err() {
            return;
        }
        loop {
            let job = {
                let mut state = shared.state.lock().unwrap();
                let job = state.queue.pop_front();
                if job.is_none() && state.shutdown {
                    return;
                }
                job
            };
            let Some(job) = job else {
                break;
            };
            shared.space.notify_all();
            process_job(&shared, job);
        }
    }
}

fn process_job(shared: &Arc<DecoderShared>, job: InputJob) {
    match job {
        InputJob::Frame(frame) => {
            if !ensure_started(shared) {
                // The frame's release hook fires on drop.
                return;
            }
            let result = shared.backend.lock().unwrap().backend.submit(&frame);
            if let Err(err) = result {
                shared.error(format!("failed to submit a coded frame: {}", err));
            }
        }
        InputJob::Drain => {
            let mut slot = shared.backend.lock().unwrap();
            if slot.started {
                if let Err(err) = slot.backend.drain() {
                    drop(slot);
                    shared.error(format!("drain failed: {}", err));
                }
            } else {
                // Nothing was ever submitted; EOS is immediate.
                drop(slot);
                shared.eos();
            }
        }
    }
}

/// Lazily creates the hardware codec on the first frame.
fn ensure_started(shared: &Arc<DecoderShared>) -> bool {
    {
        let slot = shared.backend.lock().unwrap();
        if slot.started {
            return true;
        }
    }
    let metadata = match shared.state.lock().unwrap().metadata.clone() {
        Some(metadata) => metadata,
        None => return false,
    };
    let events = Arc::clone(shared) as Arc<dyn DecoderEvents>;
    let mut slot = shared.backend.lock().unwrap();
    match slot.backend.start(&metadata, events) {
        Ok(mode) => {
            slot.started = true;
            drop(slot);
            let mut state = shared.state.lock().unwrap();
            state.mode = Some(mode);
            state.phase = Phase::Running;
            log::info!("decoder started: {} {} ({:?} output)", metadata.codec, metadata.size, mode);
            true
        }
        Err(err) => {
            drop(slot);
            shared.error(format!("failed to create the hardware decoder: {}", err));
            false
        }
    }
}

impl VideoDecoder for DecoderSession {
    fn init(&self, metadata: DecoderMetadata) -> CodecResult<()> {
        if metadata.size.get_area() == 0 {
            return Err(CodecError::InvalidMetadata(format!("empty frame size {}", metadata.size)));
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.phase == Phase::Running {
                return Err(CodecError::Other(anyhow!("the session is already running")));
            }
            state.metadata = Some(metadata);
            state.phase = Phase::Ready;
            state.shutdown = false;
        }
        self.spawn_worker_if_needed();
        Ok(())
    }

    fn decode(&self, frame: CodedFrame) -> CodecResult<()> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match state.phase {
                Phase::Ready | Phase::Running => {}
                _ => return Err(CodecError::NotInitialized),
            }
            if state.shutdown {
                return Err(CodecError::NotInitialized);
            }
            if state.queue.len() < INPUT_QUEUE_CAPACITY {
                break;
            }
            // Backpressure: hold the caller until the worker takes a job.
            state = self.shared.space.wait(state).unwrap();
        }
        state.queue.push_back(InputJob::Frame(frame));
        drop(state);
        let _ = self.shared.wake.write(1);
        Ok(())
    }

    fn flush(&self) {
        let discarded = {
            let mut state = self.shared.state.lock().unwrap();
            if state.phase == Phase::Running {
                state.phase = Phase::Ready;
            }
            state.mode = None;
            mem::take(&mut state.queue)
        };
        self.shared.space.notify_all();
        // Dropping the queued frames fires their release hooks.
        drop(discarded);

        let mut slot = self.shared.backend.lock().unwrap();
        if slot.started {
            // Some hardware cannot flush in place; tear the codec down and
            // let the next decode recreate it.
            slot.backend.stop();
            slot.started = false;
        }
        drop(slot);
        self.shared.pool.clear();
        *self.shared.layout.lock().unwrap() = None;
    }

    fn drain(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            match state.phase {
                Phase::Ready | Phase::Running => {}
                _ => return,
            }
            state.queue.push_back(InputJob::Drain);
        }
        let _ = self.shared.wake.write(1);
    }

    fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            if state.phase == Phase::Running {
                state.queue.push_back(InputJob::Drain);
            } else {
                state.queue.clear();
            }
        }
        self.shared.space.notify_all();
        let _ = self.shared.wake.write(1);

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut slot = self.shared.backend.lock().unwrap();
        if slot.started {
            slot.backend.stop();
            slot.started = false;
        }
        drop(slot);

        let mut state = self.shared.state.lock().unwrap();
        state.phase = Phase::Uninitialized;
        state.metadata = None;
        state.mode = None;
        state.queue.clear();
        state.shutdown = false;
        drop(state);
        self.shared.pool.clear();
        *self.shared.layout.lock().unwrap() = None;
    }

    fn set_listener(&self, listener: Arc<dyn DecoderListener>) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DecoderShared {
    fn listener(&self) -> Option<Arc<dyn DecoderListener>> {
        self.listener.lock().unwrap().clone()
    }
}

impl DecoderEvents for DecoderShared {
    fn buffer_created(&self, handle: Arc<dyn BufferHandle>) {
        self.pool.bind(handle);
    }

    fn frame_decoded(&self, handle: Arc<dyn BufferHandle>) -> bool {
        let mode = self.state.lock().unwrap().mode;
        let Some(listener) = self.listener() else {
            return false;
        };
        match mode {
            Some(OutputMode::ZeroCopy) => match self.pool.acquire(&handle) {
                Some(buffer) => {
                    listener.on_decoded_buffer(buffer);
                    true
                }
                // Teardown raced this callback; benign loss of the frame.
                None => false,
            },
            Some(OutputMode::Mapped) => {
                let template = self.layout.lock().unwrap().unwrap_or_else(|| handle.layout());
                let buffer = GraphicBuffer::standalone(handle);
                match buffer.map_ycbcr_with(template) {
                    Some(frame) => {
                        // The view lives only for the callback; the backend
                        // reclaims the buffer once we return.
                        listener.on_decoded_frame(&frame);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    fn buffers_released(&self) {
        self.pool.clear();
    }

    fn size_changed(&self, geometry: OutputGeometry) {
        let layout = YcbcrLayout::derive(&geometry);
        log::info!("decoder output geometry changed: {} ({})", geometry.visible, geometry.format);
        *self.layout.lock().unwrap() = Some(layout);
    }

    fn eos(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase == Phase::Running {
                state.phase = Phase::Stopped;
            }
        }
        self.space.notify_all();
        if let Some(listener) = self.listener() {
            listener.on_decoder_eos();
        }
    }

    fn error(&self, description: String) {
        log::error!("decoder error: {}", description);
        if let Some(listener) = self.listener() {
            listener.on_decoder_error(&description);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecType;
    use crate::codec::FrameType;
    use crate::video_frame::tests::TestHandle;
    use crate::video_frame::PixelFormat;
    use crate::video_frame::YcbcrFrame;
    use crate::Resolution;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::time::Duration;
    use std::time::Instant;

    fn metadata() -> DecoderMetadata {
        DecoderMetadata {
            codec: CodecType::Vp8,
            size: Resolution { width: 32, height: 32 },
            framerate: 30,
            codec_specific: Vec::new(),
        }
    }

    fn coded(timestamp_us: u64) -> CodedFrame {
        CodedFrame::new(vec![0u8; 16], timestamp_us, FrameType::Delta)
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Mapped-mode backend that turns every submitted frame into a decoded
    /// frame of the current geometry. `permits` gates `submit` so tests can
    /// stall the pipeline.
    struct MockBackend {
        stats: Arc<BackendStats>,
        geometry: OutputGeometry,
        events: Option<Arc<dyn DecoderEvents>>,
    }

    #[derive(Default)]
    struct BackendStats {
        starts: AtomicUsize,
        submits: AtomicUsize,
        stops: AtomicUsize,
        gated: AtomicBool,
        permits: Mutex<usize>,
        gate: Condvar,
    }

    impl BackendStats {
        fn allow(&self, count: usize) {
            *self.permits.lock().unwrap() += count;
            self.gate.notify_all();
        }
    }

    impl MockBackend {
        fn create(gated: bool) -> (Box<Self>, Arc<BackendStats>) {
            let stats = Arc::new(BackendStats::default());
            stats.gated.store(gated, SeqCst);
            let backend = Box::new(Self {
                stats: Arc::clone(&stats),
                geometry: OutputGeometry {
                    coded: (32, 32).into(),
                    visible: (32, 32).into(),
                    format: PixelFormat::Yuv420Planar,
                },
                events: None,
            });
            (backend, stats)
        }
    }

    impl DecoderBackend for MockBackend {
        fn start(
            &mut self,
            _metadata: &DecoderMetadata,
            events: Arc<dyn DecoderEvents>,
        ) -> CodecResult<OutputMode> {
            self.stats.starts.fetch_add(1, SeqCst);
            self.events = Some(events);
            Ok(OutputMode::Mapped)
        }

        fn submit(&mut self, frame: &CodedFrame) -> CodecResult<()> {
            if self.stats.gated.load(SeqCst) {
                let mut permits = self.stats.permits.lock().unwrap();
                while *permits == 0 {
                    permits = self.stats.gate.wait(permits).unwrap();
                }
                *permits -= 1;
            }
            self.stats.submits.fetch_add(1, SeqCst);
            if let Some(events) = &self.events {
                let handle = TestHandle::new(self.geometry, frame.timestamp_us);
                events.frame_decoded(Arc::new(handle));
            }
            Ok(())
        }

        fn drain(&mut self) -> CodecResult<()> {
            if let Some(events) = &self.events {
                events.eos();
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.stats.stops.fetch_add(1, SeqCst);
            self.events = None;
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        frames: Mutex<Vec<(u64, usize, usize)>>,
        errors: AtomicUsize,
        eos: AtomicBool,
    }

    impl DecoderListener for RecordingListener {
        fn on_decoded_frame(&self, frame: &YcbcrFrame) {
            self.frames.lock().unwrap().push((
                frame.timestamp_us(),
                frame.y_stride(),
                frame.layout().cb_offset,
            ));
        }

        fn on_decoder_error(&self, _description: &str) {
            self.errors.fetch_add(1, SeqCst);
        }

        fn on_decoder_eos(&self) {
            self.eos.store(true, SeqCst);
        }
    }

    fn session(gated: bool) -> (DecoderSession, Arc<BackendStats>, Arc<RecordingListener>) {
        let (backend, stats) = MockBackend::create(gated);
        let session = DecoderSession::new(backend).unwrap();
        let listener = Arc::new(RecordingListener::default());
        session.set_listener(listener.clone());
        (session, stats, listener)
    }

    #[test]
    fn decode_requires_init() {
        let (session, _stats, _listener) = session(false);
        assert!(matches!(session.decode(coded(0)), Err(CodecError::NotInitialized)));
    }

    #[test]
    fn codec_is_created_lazily() {
        let (session, stats, _listener) = session(false);
        session.init(metadata()).unwrap();
        assert_eq!(stats.starts.load(SeqCst), 0);

        session.decode(coded(1)).unwrap();
        wait_until("the first submit", || stats.submits.load(SeqCst) == 1);
        assert_eq!(stats.starts.load(SeqCst), 1);
    }

    #[test]
    fn frames_flow_to_the_listener_in_order() {
        let (session, _stats, listener) = session(false);
        session.init(metadata()).unwrap();
        for timestamp in [10, 20, 30] {
            session.decode(coded(timestamp)).unwrap();
        }
        wait_until("three decoded frames", || listener.frames.lock().unwrap().len() == 3);
        let timestamps: Vec<u64> =
            listener.frames.lock().unwrap().iter().map(|entry| entry.0).collect();
        assert_eq!(timestamps, [10, 20, 30]);
    }

    #[test]
    fn full_queue_blocks_the_producer_until_drained() {
        let (session, stats, _listener) = session(true);
        session.init(metadata()).unwrap();

        let session = Arc::new(session);
        let producer_done = Arc::new(AtomicBool::new(false));
        let producer = {
            let session = Arc::clone(&session);
            let done = Arc::clone(&producer_done);
            thread::spawn(move || {
                for timestamp in 0..(INPUT_QUEUE_CAPACITY as u64 + 4) {
                    session.decode(coded(timestamp)).unwrap();
                }
                done.store(true, SeqCst);
            })
        };

        // The worker is stalled in submit, so the producer must wedge on the
        // full queue rather than drop or error.
        thread::sleep(Duration::from_millis(100));
        assert!(!producer_done.load(SeqCst));
        assert!(stats.submits.load(SeqCst) <= 1);

        stats.allow(usize::MAX / 2);
        producer.join().unwrap();
        assert!(producer_done.load(SeqCst));
        wait_until("all frames submitted", || {
            stats.submits.load(SeqCst) == INPUT_QUEUE_CAPACITY + 4
        });
    }

    #[test]
    fn size_change_rederives_the_layout() {
        let (session, stats, listener) = session(false);
        session.init(metadata()).unwrap();
        session.decode(coded(1)).unwrap();
        wait_until("the first frame", || listener.frames.lock().unwrap().len() == 1);

        let events = {
            let slot = stats.starts.load(SeqCst);
            assert_eq!(slot, 1);
            Arc::clone(&session.shared) as Arc<dyn DecoderEvents>
        };
        events.size_changed(OutputGeometry {
            coded: (64, 48).into(),
            visible: (64, 48).into(),
            format: PixelFormat::Yuv420SemiPlanar,
        });

        // The backend keeps handing out 32x32 planar buffers big enough for
        // the new geometry; the session must interpret them with the
        // re-derived template.
        let big = OutputGeometry {
            coded: (64, 64).into(),
            visible: (64, 64).into(),
            format: PixelFormat::Yuv420Planar,
        };
        events.frame_decoded(Arc::new(TestHandle::new(big, 2)));

        let frames = listener.frames.lock().unwrap();
        let (_, old_stride, old_cb) = frames[0];
        let (_, new_stride, new_cb) = frames[1];
        assert_eq!((old_stride, old_cb), (32, 32 * 32));
        assert_eq!((new_stride, new_cb), (64, 64 * 48));
    }

    #[test]
    fn flush_discards_input_and_recreates_the_codec() {
        let (session, stats, _listener) = session(true);
        session.init(metadata()).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        for timestamp in 0..4 {
            let released = Arc::clone(&released);
            session
                .decode(CodedFrame::with_release(
                    vec![0u8; 16],
                    timestamp,
                    FrameType::Delta,
                    move || {
                        released.fetch_add(1, SeqCst);
                    },
                ))
                .unwrap();
        }
        wait_until("the codec to start", || stats.starts.load(SeqCst) == 1);

        stats.gated.store(false, SeqCst);
        stats.allow(1);
        session.flush();
        wait_until("all release hooks", || released.load(SeqCst) == 4);
        assert_eq!(stats.stops.load(SeqCst), 1);

        // The next decode recreates the hardware codec.
        session.decode(coded(100)).unwrap();
        wait_until("a second codec start", || stats.starts.load(SeqCst) == 2);
    }

    #[test]
    fn drain_delivers_buffered_frames_then_eos() {
        let (session, _stats, listener) = session(false);
        session.init(metadata()).unwrap();
        session.decode(coded(1)).unwrap();
        session.decode(coded(2)).unwrap();
        session.drain();

        wait_until("EOS", || listener.eos.load(SeqCst));
        assert_eq!(listener.frames.lock().unwrap().len(), 2);
        // Past EOS the session no longer accepts input.
        assert!(matches!(session.decode(coded(3)), Err(CodecError::NotInitialized)));
    }

    #[test]
    fn stop_is_idempotent_and_allows_reinit() {
        let (session, stats, listener) = session(false);
        session.init(metadata()).unwrap();
        session.decode(coded(1)).unwrap();
        wait_until("the first frame", || listener.frames.lock().unwrap().len() == 1);
        session.stop();
        session.stop();
        assert_eq!(stats.stops.load(SeqCst), 1);
        assert_eq!(listener.frames.lock().unwrap().len(), 1);

        session.init(metadata()).unwrap();
        session.decode(coded(2)).unwrap();
        wait_until("a frame after re-init", || listener.frames.lock().unwrap().len() == 2);
    }
}
