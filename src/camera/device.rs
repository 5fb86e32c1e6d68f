// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-device capture state machine.
//!
//! A [`CaptureDevice`] drives one physical camera through a
//! [`CaptureBackend`], the seam to the platform media HAL. The device owns a
//! [`BufferPool`]; HAL callback threads deliver buffers through
//! [`CaptureEvents`], which binds them into the pool and hands
//! reference-counted frames to the registered listener.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::camera::arbiter::CaptureArbiter;
use crate::camera::arbiter::Preemptible;
use crate::camera::Camera;
use crate::camera::CameraError;
use crate::camera::CameraInfo;
use crate::camera::CameraListener;
use crate::camera::CameraResult;
use crate::camera::CaptureMode;
use crate::pool::BufferPool;
use crate::video_frame::BufferHandle;

/// Events the platform HAL pushes into an open device, from HAL-owned
/// threads. For a given handle, `buffer_created` is always delivered before
/// the first `frame_available` referencing it.
pub trait CaptureEvents: Send + Sync {
    fn buffer_created(&self, handle: Arc<dyn BufferHandle>);

    /// Returns false if the frame was not consumed, telling the HAL to
    /// release the buffer immediately instead of waiting for an application
    /// release.
    fn frame_available(&self, handle: Arc<dyn BufferHandle>) -> bool;

    /// The HAL invalidated all buffers delivered so far.
    fn buffers_released(&self);

    fn error(&self, description: String);
}

/// Interface to one physical camera of the platform media HAL.
///
/// All calls are made with the device lock held; implementations must not
/// call back into the device synchronously from them.
pub trait CaptureBackend: Send {
    /// Opens the hardware. `events` stays registered until `disconnect`.
    fn connect(&mut self, events: Arc<dyn CaptureEvents>) -> CameraResult<()>;

    fn apply_mode(&mut self, mode: &CaptureMode) -> CameraResult<()>;

    fn start_preview(&mut self) -> CameraResult<()>;

    fn start_recording(&mut self) -> CameraResult<()>;

    fn stop_recording(&mut self);

    fn stop_preview(&mut self);

    fn disconnect(&mut self);

    /// Modes the hardware supports; only valid while connected.
    fn capture_modes(&mut self) -> CameraResult<Vec<CaptureMode>>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DeviceState {
    Closed,
    Open,
    Capturing,
}

struct DeviceInner {
    state: DeviceState,
    /// Sticky: once the hardware refused a shared open, every reopen of this
    /// instance claims exclusive access.
    exclusive: bool,
    backend: Box<dyn CaptureBackend>,
}

struct DeviceShared {
    info: CameraInfo,
    slot: usize,
    arbiter: Arc<CaptureArbiter>,
    inner: Mutex<DeviceInner>,
    listener: Mutex<Option<Arc<dyn CameraListener>>>,
    pool: BufferPool,
}

/// One open camera; created by a provider, handed out as `Arc<dyn Camera>`.
pub struct CaptureDevice {
    shared: Arc<DeviceShared>,
}

impl CaptureDevice {
    pub fn new(
        info: CameraInfo,
        slot: usize,
        arbiter: Arc<CaptureArbiter>,
        backend: Box<dyn CaptureBackend>,
    ) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                info,
                slot,
                arbiter,
                inner: Mutex::new(DeviceInner {
                    state: DeviceState::Closed,
                    exclusive: false,
                    backend,
                }),
                listener: Mutex::new(None),
                pool: BufferPool::new(),
            }),
        }
    }

    /// Opens the hardware handle, arbitrating for capture access first.
    /// Idempotent if already open.
    ///
    /// A connect that fails in shared mode is retried once in exclusive
    /// mode: the HAL may simply not support driving two cameras at once.
    pub fn open(&self) -> CameraResult<()> {
        let claimant: Weak<dyn Preemptible> =
            Arc::downgrade(&(Arc::clone(&self.shared) as Arc<dyn Preemptible>));
        let mut exclusive = self.shared.inner.lock().unwrap().exclusive;

        loop {
            // Arbitration happens outside the device lock; see CaptureArbiter.
            if !self.shared.arbiter.acquire(self.shared.slot, claimant.clone(), exclusive) {
                return Err(CameraError::ConnectFailed);
            }

            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != DeviceState::Closed {
                return Ok(());
            }
            inner.exclusive = exclusive;
            let events = Arc::clone(&self.shared) as Arc<dyn CaptureEvents>;
            match inner.backend.connect(events) {
                Ok(()) => {
                    inner.state = DeviceState::Open;
                    return Ok(());
                }
                Err(err) if !exclusive => {
                    log::info!(
                        "{}: shared connect failed ({}), retrying exclusively",
                        self.shared.info.id,
                        err
                    );
                    exclusive = true;
                }
                Err(err) => {
                    log::error!("{}: error connecting the camera: {}", self.shared.info.id, err);
                    return Err(err);
                }
            }
        }
    }

    /// Queries the hardware's capture modes, opening the device if needed.
    pub fn capture_modes(&self) -> CameraResult<Vec<CaptureMode>> {
        self.open()?;
        self.shared.inner.lock().unwrap().backend.capture_modes()
    }
}

impl Camera for CaptureDevice {
    fn info(&self) -> CameraInfo {
        self.shared.info.clone()
    }

    fn start_capture(&self, mode: &CaptureMode) -> CameraResult<()> {
        self.open()?;

        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == DeviceState::Capturing {
            return Ok(());
        }
        if inner.state == DeviceState::Closed {
            // Preempted between open() and here; the caller may retry.
            return Err(CameraError::ConnectFailed);
        }

        if let Err(err) = inner.backend.apply_mode(mode) {
            log::error!("{}: failed to apply mode {}: {}", self.shared.info.id, mode, err);
            close_locked(&mut inner);
            return Err(err);
        }
        if let Err(err) = inner.backend.start_preview() {
            log::error!("{}: failed to start preview: {}", self.shared.info.id, err);
            close_locked(&mut inner);
            return Err(err);
        }
        if let Err(err) = inner.backend.start_recording() {
            // No half-started state survives a failed start: the preview
            // stream is torn down before the failure is reported.
            log::error!("{}: failed to start recording: {}", self.shared.info.id, err);
            inner.backend.stop_preview();
            close_locked(&mut inner);
            return Err(err);
        }

        inner.state = DeviceState::Capturing;
        log::info!("{}: capture started ({})", self.shared.info.id, mode);
        Ok(())
    }

    fn stop_capture(&self) {
        self.shared.stop_capture();
    }

    fn capture_started(&self) -> bool {
        self.shared.inner.lock().unwrap().state == DeviceState::Capturing
    }

    fn set_listener(&self, listener: Arc<dyn CameraListener>) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.shared.stop_capture();
    }
}

fn close_locked(inner: &mut DeviceInner) {
    if inner.state == DeviceState::Capturing {
        inner.backend.stop_recording();
        inner.backend.stop_preview();
    }
    if inner.state != DeviceState::Closed {
        inner.backend.disconnect();
    }
    inner.state = DeviceState::Closed;
}

impl DeviceShared {
    fn stop_capture(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != DeviceState::Closed {
                log::info!("{}: stopping capture", self.info.id);
            }
            close_locked(&mut inner);
        }
        self.pool.clear();
    }
}

impl Preemptible for DeviceShared {
    fn preempt(&self) {
        self.stop_capture();
    }
}

impl CaptureEvents for DeviceShared {
    fn buffer_created(&self, handle: Arc<dyn BufferHandle>) {
        self.pool.bind(handle);
    }

    fn frame_available(&self, handle: Arc<dyn BufferHandle>) -> bool {
        let listener = self.listener.lock().unwrap().clone();
        let Some(listener) = listener else {
            return false;
        };
        match self.pool.acquire(&handle) {
            Some(buffer) => {
                listener.on_frame(buffer);
                true
            }
            // The pool was cleared while this callback was in flight;
            // benign loss of the frame.
            None => false,
        }
    }

    fn buffers_released(&self) {
        self.pool.clear();
    }

    fn error(&self, description: String) {
        log::error!("{}: camera error: {}", self.info.id, description);
        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_error(&description);
        }
    }
}
