// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software codec pair: frames are "encoded" into a small length-checked
//! container and decoded back, so encoder and decoder sessions can run end
//! to end without hardware.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::bail;

use crate::codec::decoder::DecoderEvents;
use crate::codec::decoder::OutputMode;
use crate::codec::encoder::EncoderEvents;
use crate::codec::encoder::COLOR_FORMAT_YUV420_PLANAR;
use crate::codec::CodecError;
use crate::codec::CodecProvider;
use crate::codec::CodecResult;
use crate::codec::CodecType;
use crate::codec::CodedFrame;
use crate::codec::DecoderBackend;
use crate::codec::DecoderMetadata;
use crate::codec::DecoderSession;
use crate::codec::EncodedFrame;
use crate::codec::EncoderBackend;
use crate::codec::EncoderMetadata;
use crate::codec::EncoderSession;
use crate::codec::FrameType;
use crate::codec::ReleaseGuard;
use crate::codec::VideoDecoder;
use crate::codec::VideoEncoder;
use crate::provider::ProviderDescriptor;
use crate::video_frame::BufferHandle;
use crate::video_frame::OutputGeometry;
use crate::video_frame::PixelFormat;
use crate::video_frame::YcbcrLayout;
use crate::Resolution;

const MAGIC: [u8; 4] = *b"VHL0";
const HEADER_LEN: usize = 13;
const FLAG_KEY: u8 = 1;

fn pack_container(size: Resolution, frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&size.width.to_le_bytes());
    out.extend_from_slice(&size.height.to_le_bytes());
    out.push(if frame_type == FrameType::Key { FLAG_KEY } else { 0 });
    out.extend_from_slice(payload);
    out
}

fn parse_container(data: &[u8]) -> anyhow::Result<(Resolution, &[u8])> {
    if data.len() < HEADER_LEN || data[..4] != MAGIC {
        bail!("not a loopback container ({} bytes)", data.len());
    }
    let width = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let height = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let size = Resolution { width, height };
    let layout = YcbcrLayout::derive(&planar_geometry(size));
    let payload = &data[HEADER_LEN..];
    if payload.len() < layout.min_buffer_size() {
        bail!("truncated payload for {}: {} bytes", size, payload.len());
    }
    Ok((size, payload))
}

fn planar_geometry(size: Resolution) -> OutputGeometry {
    OutputGeometry { coded: size, visible: size, format: PixelFormat::Yuv420Planar }
}

/// A decoded frame living in process memory.
struct MemoryHandle {
    data: Vec<u8>,
    layout: YcbcrLayout,
    resolution: Resolution,
    timestamp_us: u64,
    tag: AtomicU64,
}

impl MemoryHandle {
    fn new(size: Resolution, timestamp_us: u64, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            layout: YcbcrLayout::derive(&planar_geometry(size)),
            resolution: size,
            timestamp_us,
            tag: AtomicU64::new(0),
        })
    }
}

impl BufferHandle for MemoryHandle {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
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

#[derive(Default)]
struct LoopbackEncoder {
    size: Option<Resolution>,
    events: Option<Arc<dyn EncoderEvents>>,
    frames_seen: u64,
}

impl EncoderBackend for LoopbackEncoder {
    fn supported_input_formats(&mut self) -> CodecResult<Vec<u32>> {
        Ok(vec![COLOR_FORMAT_YUV420_PLANAR])
    }

    fn start(
        &mut self,
        metadata: &EncoderMetadata,
        _color_format: u32,
        events: Arc<dyn EncoderEvents>,
    ) -> CodecResult<()> {
        self.size = Some(metadata.size);
        self.events = Some(events);
        self.frames_seen = 0;
        Ok(())
    }

    fn encode(&mut self, data: Vec<u8>, timestamp_us: u64, force_sync: bool) -> CodecResult<()> {
        let size = self.size.ok_or(CodecError::NotInitialized)?;
        let events = self.events.as_ref().ok_or(CodecError::NotInitialized)?;
        // The first frame of a stream is always a sync point.
        let frame_type =
            if force_sync || self.frames_seen == 0 { FrameType::Key } else { FrameType::Delta };
        self.frames_seen += 1;
        let container = pack_container(size, frame_type, &data);
        events.encoded(EncodedFrame::new(container, timestamp_us, frame_type, ReleaseGuard::noop()));
        Ok(())
    }

    fn stop(&mut self) {
        self.events = None;
    }
}

#[derive(Default)]
struct LoopbackDecoder {
    events: Option<Arc<dyn DecoderEvents>>,
    geometry: Option<Resolution>,
}

impl DecoderBackend for LoopbackDecoder {
    fn start(
        &mut self,
        _metadata: &DecoderMetadata,
        events: Arc<dyn DecoderEvents>,
    ) -> CodecResult<OutputMode> {
        self.events = Some(events);
        self.geometry = None;
        Ok(OutputMode::Mapped)
    }

    fn submit(&mut self, frame: &CodedFrame) -> CodecResult<()> {
        let events = self.events.as_ref().ok_or(CodecError::NotInitialized)?;
        let (size, payload) = parse_container(frame.data())?;
        if self.geometry != Some(size) {
            events.size_changed(planar_geometry(size));
            self.geometry = Some(size);
        }
        let handle = MemoryHandle::new(size, frame.timestamp_us, payload.to_vec());
        events.frame_decoded(handle);
        Ok(())
    }

    fn drain(&mut self) -> CodecResult<()> {
        let events = self.events.as_ref().ok_or(CodecError::NotInitialized)?;
        events.eos();
        Ok(())
    }

    fn stop(&mut self) {
        self.events = None;
        self.geometry = None;
    }
}

/// The built-in software codec provider; accepts every codec type since it
/// never actually compresses.
pub struct LoopbackProvider;

impl LoopbackProvider {
    pub fn instance() -> &'static Self {
        static INSTANCE: OnceLock<LoopbackProvider> = OnceLock::new();
        INSTANCE.get_or_init(|| Self)
    }
}

impl CodecProvider for LoopbackProvider {
    fn name(&self) -> &str {
        "loopback"
    }

    fn init(&self) -> CodecResult<()> {
        Ok(())
    }

    fn encoder_available(&self, _codec: CodecType) -> bool {
        true
    }

    fn decoder_available(&self, _codec: CodecType) -> bool {
        true
    }

    fn create_encoder(&self, _codec: CodecType) -> CodecResult<Arc<dyn VideoEncoder>> {
        Ok(Arc::new(EncoderSession::new(Box::new(LoopbackEncoder::default()))))
    }

    fn create_decoder(&self, _codec: CodecType) -> CodecResult<Arc<dyn VideoDecoder>> {
        Ok(Arc::new(DecoderSession::new(Box::new(LoopbackDecoder::default()))?))
    }
}

fn codec_provider() -> &'static dyn CodecProvider {
    LoopbackProvider::instance()
}

/// Descriptor a plugin build of this provider would return from its entry
/// symbol.
pub static DESCRIPTOR: ProviderDescriptor =
    ProviderDescriptor { name: "loopback", camera: None, codec: Some(codec_provider) };
