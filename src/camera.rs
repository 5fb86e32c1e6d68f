// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Camera enumeration, capture and access arbitration.

pub mod arbiter;
pub mod device;
pub mod manager;

use std::sync::Arc;

use thiserror::Error;

use crate::video_frame::GraphicBuffer;

pub use arbiter::CaptureArbiter;
pub use device::CaptureBackend;
pub use device::CaptureDevice;
pub use manager::CameraManager;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Rear,
}

/// Identity of one physical or virtual camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraInfo {
    /// Globally unique, provider-namespaced id, e.g. `"test:rear:0"`.
    pub id: String,
    pub name: String,
    pub provider: String,
    pub facing: CameraFacing,
    pub mount_angle: u32,
}

/// One physical configuration a device can be started with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CaptureMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

pub type CameraResult<T> = std::result::Result<T, CameraError>;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("no camera with id `{0}`")]
    NotFound(String),
    #[error("failed to connect to the camera hardware")]
    ConnectFailed,
    #[error("capture failed to start: {0}")]
    StartFailed(String),
    #[error("the provider failed to initialize")]
    ProviderInit,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Receives frames and errors for one open camera. Registered late, one
/// listener per device; delivery happens on HAL-owned threads.
pub trait CameraListener: Send + Sync {
    fn on_frame(&self, frame: Arc<GraphicBuffer>);
    fn on_error(&self, description: &str);
}

/// One open camera device.
pub trait Camera: Send + Sync {
    fn info(&self) -> CameraInfo;

    /// Applies `mode` and starts capturing. Idempotent while capturing.
    fn start_capture(&self, mode: &CaptureMode) -> CameraResult<()>;

    /// Stops capture and closes the hardware. Always safe to call, including
    /// when capture never started.
    fn stop_capture(&self);

    fn capture_started(&self) -> bool;

    fn set_listener(&self, listener: Arc<dyn CameraListener>);
}

/// The per-backend camera manager a provider module exposes.
///
/// Implementations are process-lifetime singletons; the root
/// [`CameraManager`] never drops them.
pub trait CameraProvider: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> CameraResult<()>;

    /// Number of cameras this provider currently exposes.
    fn num_cameras(&self) -> usize;

    fn camera_info(&self, index: usize) -> Option<CameraInfo>;

    /// Capture modes for `id`. Some backends must connect to the hardware to
    /// answer this.
    fn query_capabilities(&self, id: &str) -> CameraResult<Vec<CaptureMode>>;

    fn open_camera(&self, id: &str) -> CameraResult<Arc<dyn Camera>>;
}
