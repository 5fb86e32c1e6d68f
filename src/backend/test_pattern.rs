// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software camera producing synthetic YCbCr frames at the requested rate.
//!
//! Stands in for a real sensor so the whole capture path (arbitration,
//! pooling, delivery, teardown) can run without hardware.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use crate::camera::device::CaptureEvents;
use crate::camera::Camera;
use crate::camera::CameraError;
use crate::camera::CameraFacing;
use crate::camera::CameraInfo;
use crate::camera::CameraProvider;
use crate::camera::CameraResult;
use crate::camera::CaptureArbiter;
use crate::camera::CaptureBackend;
use crate::camera::CaptureDevice;
use crate::camera::CaptureMode;
use crate::provider::ProviderDescriptor;
use crate::utils::monotonic_timestamp_us;
use crate::video_frame::BufferHandle;
use crate::video_frame::OutputGeometry;
use crate::video_frame::PixelFormat;
use crate::video_frame::YcbcrLayout;
use crate::Resolution;

pub const CAMERA_ID: &str = "test:rear:0";

const MODE: CaptureMode = CaptureMode { width: 320, height: 240, fps: 30 };
/// Reusable buffers in flight, like a real HAL's buffer ring.
const RING_SIZE: usize = 4;

fn geometry() -> OutputGeometry {
    OutputGeometry {
        coded: Resolution { width: MODE.width, height: MODE.height },
        visible: Resolution { width: MODE.width, height: MODE.height },
        format: PixelFormat::Yuv420Planar,
    }
}

/// An in-memory frame buffer. Plane contents are fixed at creation; only
/// the timestamp changes between deliveries, since outstanding views alias
/// the data.
struct PatternHandle {
    data: Vec<u8>,
    layout: YcbcrLayout,
    timestamp_us: AtomicU64,
    tag: AtomicU64,
    releases: Arc<AtomicUsize>,
}

impl PatternHandle {
    fn new(slot: usize, releases: Arc<AtomicUsize>) -> Arc<Self> {
        let layout = YcbcrLayout::derive(&geometry());
        let mut data = vec![0u8; layout.min_buffer_size()];
        let phase = (slot * 64) as u8;
        for (index, byte) in data.iter_mut().enumerate() {
            *byte = phase.wrapping_add((index % 251) as u8);
        }
        Arc::new(Self {
            data,
            layout,
            timestamp_us: AtomicU64::new(0),
            tag: AtomicU64::new(0),
            releases,
        })
    }
}

impl Drop for PatternHandle {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl BufferHandle for PatternHandle {
    fn resolution(&self) -> Resolution {
        geometry().visible
    }

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us.load(Ordering::Acquire)
    }

    fn layout(&self) -> YcbcrLayout {
        self.layout
    }

    fn map(&self) -> anyhow::Result<&[u8]> {
        Ok(&self.data)
    }

    fn pool_tag(&self) -> u64 {
        self.tag.load(Ordering::Acquire)
    }

    fn set_pool_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Release);
    }
}

struct CaptureLoop {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

/// The software sensor behind one opened test camera.
struct TestPatternBackend {
    releases: Arc<AtomicUsize>,
    events: Option<Arc<dyn CaptureEvents>>,
    ring: Vec<Arc<PatternHandle>>,
    mode: CaptureMode,
    capture_loop: Option<CaptureLoop>,
}

impl TestPatternBackend {
    fn new(releases: Arc<AtomicUsize>) -> Self {
        Self { releases, events: None, ring: Vec::new(), mode: MODE, capture_loop: None }
    }
}

impl CaptureBackend for TestPatternBackend {
    fn connect(&mut self, events: Arc<dyn CaptureEvents>) -> CameraResult<()> {
        self.ring =
            (0..RING_SIZE).map(|slot| PatternHandle::new(slot, Arc::clone(&self.releases))).collect();
        for handle in &self.ring {
            events.buffer_created(Arc::clone(handle) as Arc<dyn BufferHandle>);
        }
        self.events = Some(events);
        Ok(())
    }

    fn apply_mode(&mut self, mode: &CaptureMode) -> CameraResult<()> {
        if *mode != MODE {
            return Err(CameraError::StartFailed(format!("unsupported mode {}", mode)));
        }
        self.mode = *mode;
        Ok(())
    }

    fn start_preview(&mut self) -> CameraResult<()> {
        Ok(())
    }

    fn start_recording(&mut self) -> CameraResult<()> {
        let events = match &self.events {
            Some(events) => Arc::clone(events),
            None => return Err(CameraError::StartFailed("not connected".to_string())),
        };
        let ring = self.ring.clone();
        let interval = Duration::from_micros(1_000_000 / self.mode.fps as u64);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("videohal-test-camera".to_string())
                .spawn(move || {
                    let mut count = 0usize;
                    while !stop.load(Ordering::Acquire) {
                        thread::sleep(interval);
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        let handle = &ring[count % RING_SIZE];
                        handle.timestamp_us.store(monotonic_timestamp_us(), Ordering::Release);
                        events.frame_available(Arc::clone(handle) as Arc<dyn BufferHandle>);
                        count += 1;
                    }
                })
                .map_err(|err| {
                    CameraError::StartFailed(format!("failed to spawn the capture loop: {}", err))
                })?
        };
        self.capture_loop = Some(CaptureLoop { stop, thread });
        Ok(())
    }

    fn stop_recording(&mut self) {
        if let Some(capture_loop) = self.capture_loop.take() {
            capture_loop.stop.store(true, Ordering::Release);
            let _ = capture_loop.thread.join();
        }
    }

    fn stop_preview(&mut self) {}

    fn disconnect(&mut self) {
        self.events = None;
        self.ring.clear();
    }

    fn capture_modes(&mut self) -> CameraResult<Vec<CaptureMode>> {
        Ok(vec![MODE])
    }
}

/// The built-in software camera provider: one rear camera, 320x240@30.
pub struct TestPatternProvider {
    arbiter: Arc<CaptureArbiter>,
    releases: Arc<AtomicUsize>,
}

impl TestPatternProvider {
    /// The process-lifetime singleton, like a loaded provider module's.
    pub fn instance() -> &'static Self {
        static INSTANCE: OnceLock<TestPatternProvider> = OnceLock::new();
        INSTANCE.get_or_init(|| Self {
            arbiter: Arc::new(CaptureArbiter::new(1)),
            releases: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Hardware buffers released so far, across all devices of this
    /// provider.
    pub fn released_buffers(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn info() -> CameraInfo {
        CameraInfo {
            id: CAMERA_ID.to_string(),
            name: "Test pattern".to_string(),
            provider: "test".to_string(),
            facing: CameraFacing::Rear,
            mount_angle: 0,
        }
    }
}

impl CameraProvider for TestPatternProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn init(&self) -> CameraResult<()> {
        Ok(())
    }

    fn num_cameras(&self) -> usize {
        1
    }

    fn camera_info(&self, index: usize) -> Option<CameraInfo> {
        (index == 0).then(Self::info)
    }

    fn query_capabilities(&self, id: &str) -> CameraResult<Vec<CaptureMode>> {
        if id != CAMERA_ID {
            return Err(CameraError::NotFound(id.to_string()));
        }
        Ok(vec![MODE])
    }

    fn open_camera(&self, id: &str) -> CameraResult<Arc<dyn Camera>> {
        if id != CAMERA_ID {
            return Err(CameraError::NotFound(id.to_string()));
        }
        Ok(Arc::new(CaptureDevice::new(
            Self::info(),
            0,
            Arc::clone(&self.arbiter),
            Box::new(TestPatternBackend::new(Arc::clone(&self.releases))),
        )))
    }
}

fn camera_provider() -> &'static dyn CameraProvider {
    TestPatternProvider::instance()
}

/// Descriptor a plugin build of this provider would return from its entry
/// symbol.
pub static DESCRIPTOR: ProviderDescriptor =
    ProviderDescriptor { name: "test", camera: Some(camera_provider), codec: None };

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_exposes_one_camera() {
        let provider = TestPatternProvider::instance();
        assert_eq!(provider.num_cameras(), 1);
        let info = provider.camera_info(0).unwrap();
        assert_eq!(info.id, CAMERA_ID);
        assert!(provider.camera_info(1).is_none());
        assert!(matches!(
            provider.open_camera("test:front:9"),
            Err(CameraError::NotFound(_))
        ));
    }

    #[test]
    fn modes_match_the_pattern_geometry() {
        let provider = TestPatternProvider::instance();
        let modes = provider.query_capabilities(CAMERA_ID).unwrap();
        assert_eq!(modes, vec![MODE]);
        let layout = YcbcrLayout::derive(&geometry());
        assert_eq!(layout.width, 320);
        assert_eq!(layout.min_buffer_size(), 320 * 240 * 3 / 2);
    }

    #[test]
    fn ring_slots_carry_distinct_patterns() {
        let releases = Arc::new(AtomicUsize::new(0));
        let first = PatternHandle::new(0, Arc::clone(&releases));
        let second = PatternHandle::new(1, Arc::clone(&releases));
        assert_ne!(first.map().unwrap()[0], second.map().unwrap()[0]);

        drop(first);
        drop(second);
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }
}
