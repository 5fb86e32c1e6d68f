// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware video codec sessions and their shared types.

pub mod decoder;
pub mod encoder;
pub mod manager;

use std::sync::Arc;

use thiserror::Error;

use crate::video_frame::GraphicBuffer;
use crate::video_frame::YcbcrFrame;
use crate::Resolution;

pub use decoder::DecoderBackend;
pub use decoder::DecoderSession;
pub use decoder::OutputMode;
pub use encoder::EncoderBackend;
pub use encoder::EncoderSession;
pub use manager::CodecManager;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecType {
    Vp8,
    Vp9,
    H264,
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodecType::Vp8 => "VP8",
            CodecType::Vp9 => "VP9",
            CodecType::H264 => "H.264",
        };
        write!(f, "{}", name)
    }
}

/// Sync-point classification of one coded frame, taken directly from the
/// hardware's sync flag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Delta,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderMetadata {
    pub codec: CodecType,
    pub size: Resolution,
    pub bitrate: u32,
    pub framerate: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderMetadata {
    pub codec: CodecType,
    pub size: Resolution,
    pub framerate: u32,
    /// Out-of-band codec configuration (e.g. H.264 SPS/PPS), fed to the
    /// hardware before the first coded frame. May be empty.
    pub codec_specific: Vec<u8>,
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{0} is not supported")]
    Unsupported(CodecType),
    #[error("no input format supported by both the codec and this layer")]
    NoSupportedFormat,
    #[error("the session is not initialized")]
    NotInitialized,
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Runs a cleanup hook exactly once, when dropped. Used to hand buffer
/// ownership across the session boundary without copying: whoever ends up
/// holding the guard last triggers the release.
pub struct ReleaseGuard(Option<Box<dyn FnOnce() + Send>>);

impl ReleaseGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self(None)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// One coded (compressed) frame queued into a decoder.
///
/// The bytes stay owned by the producer; the attached [`ReleaseGuard`] fires
/// exactly once when the session is done reading them, possibly long after
/// `decode` returned, including on flush and teardown.
pub struct CodedFrame {
    data: Box<dyn AsRef<[u8]> + Send>,
    pub timestamp_us: u64,
    pub frame_type: FrameType,
    _release: ReleaseGuard,
}

impl CodedFrame {
    pub fn new(
        data: impl AsRef<[u8]> + Send + 'static,
        timestamp_us: u64,
        frame_type: FrameType,
    ) -> Self {
        Self { data: Box::new(data), timestamp_us, frame_type, _release: ReleaseGuard::noop() }
    }

    pub fn with_release(
        data: impl AsRef<[u8]> + Send + 'static,
        timestamp_us: u64,
        frame_type: FrameType,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            data: Box::new(data),
            timestamp_us,
            frame_type,
            _release: ReleaseGuard::new(release),
        }
    }

    pub fn data(&self) -> &[u8] {
        (*self.data).as_ref()
    }
}

/// One encoded frame delivered to an [`EncoderListener`]. The payload is
/// released back to the hardware when the frame is dropped.
pub struct EncodedFrame {
    data: Box<dyn AsRef<[u8]> + Send>,
    pub timestamp_us: u64,
    pub frame_type: FrameType,
    _release: ReleaseGuard,
}

impl EncodedFrame {
    pub fn new(
        data: impl AsRef<[u8]> + Send + 'static,
        timestamp_us: u64,
        frame_type: FrameType,
        release: ReleaseGuard,
    ) -> Self {
        Self { data: Box::new(data), timestamp_us, frame_type, _release: release }
    }

    pub fn data(&self) -> &[u8] {
        (*self.data).as_ref()
    }
}

pub trait EncoderListener: Send + Sync {
    fn on_encoded_frame(&self, frame: EncodedFrame);
    fn on_encoder_error(&self, description: &str);
}

/// Receives decoder output on the session's worker thread.
///
/// Which frame callback fires depends on the output mode the hardware
/// selected at codec creation; a given session only ever uses one of them.
pub trait DecoderListener: Send + Sync {
    /// Copy-mode output. The view is only valid for the duration of the
    /// callback and must not be retained.
    fn on_decoded_frame(&self, _frame: &YcbcrFrame) {}

    /// Zero-copy output; the buffer may be held for as long as needed.
    fn on_decoded_buffer(&self, _buffer: Arc<GraphicBuffer>) {}

    fn on_decoder_error(&self, description: &str);

    /// All frames queued before `drain` have been delivered.
    fn on_decoder_eos(&self);
}

pub trait VideoEncoder: Send + Sync {
    fn init(&self, metadata: EncoderMetadata) -> CodecResult<()>;

    /// Repacks and queues one raw frame. `force_sync` requests a key frame.
    fn encode(&self, frame: &YcbcrFrame, force_sync: bool) -> CodecResult<()>;

    fn set_listener(&self, listener: Arc<dyn EncoderListener>);
}

pub trait VideoDecoder: Send + Sync {
    fn init(&self, metadata: DecoderMetadata) -> CodecResult<()>;

    /// Queues one coded frame. Blocks while the input queue is full; never
    /// call from the thread that consumes this session's output.
    fn decode(&self, frame: CodedFrame) -> CodecResult<()>;

    /// Discards everything in flight. The hardware codec is recreated
    /// lazily on the next `decode`.
    fn flush(&self);

    /// Lets buffered frames emerge, then signals EOS through the listener.
    fn drain(&self);

    fn stop(&self);

    fn set_listener(&self, listener: Arc<dyn DecoderListener>);
}

/// The per-backend codec manager a provider module exposes; a
/// process-lifetime singleton like [`crate::camera::CameraProvider`].
pub trait CodecProvider: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> CodecResult<()>;

    /// May return false when all suitable hardware codecs are busy.
    fn encoder_available(&self, codec: CodecType) -> bool;
    fn decoder_available(&self, codec: CodecType) -> bool;

    fn create_encoder(&self, codec: CodecType) -> CodecResult<Arc<dyn VideoEncoder>>;
    fn create_decoder(&self, codec: CodecType) -> CodecResult<Arc<dyn VideoDecoder>>;
}
