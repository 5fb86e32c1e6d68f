// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder session: input layout selection and frame repacking in front of
//! a hardware encoder backend.

use std::sync::Arc;
use std::sync::Mutex;

use crate::codec::CodecError;
use crate::codec::CodecResult;
use crate::codec::EncodedFrame;
use crate::codec::EncoderListener;
use crate::codec::EncoderMetadata;
use crate::codec::VideoEncoder;
use crate::video_frame::OutputGeometry;
use crate::video_frame::PixelFormat;
use crate::video_frame::YcbcrFrame;
use crate::video_frame::YcbcrLayout;

// OMX color format codes reported by the hardware encoders we target.
pub const COLOR_FORMAT_YUV420_PLANAR: u32 = 19;
pub const COLOR_FORMAT_YUV420_SEMI_PLANAR: u32 = 21;
pub const COLOR_FORMAT_YUV420_PACKED_SEMI_PLANAR_32M: u32 = 0x7FA3_0C04;

/// The layouts this layer knows how to repack into, by hardware code.
fn pixel_format_for(color_format: u32) -> Option<PixelFormat> {
    match color_format {
        COLOR_FORMAT_YUV420_PLANAR => Some(PixelFormat::Yuv420Planar),
        COLOR_FORMAT_YUV420_SEMI_PLANAR => Some(PixelFormat::Yuv420SemiPlanar),
        COLOR_FORMAT_YUV420_PACKED_SEMI_PLANAR_32M => {
            Some(PixelFormat::Yuv420PackedSemiPlanar32m)
        }
        _ => None,
    }
}

/// Asynchronous output path of a hardware encoder.
pub trait EncoderEvents: Send + Sync {
    fn encoded(&self, frame: EncodedFrame);
    fn error(&self, description: String);
}

/// Interface to one hardware encoder instance.
pub trait EncoderBackend: Send {
    /// Input color formats the hardware accepts, most preferred first, as
    /// raw OMX codes. The order is authoritative.
    fn supported_input_formats(&mut self) -> CodecResult<Vec<u32>>;

    /// Creates and starts the hardware encoder. Output arrives through
    /// `events` on a backend-owned thread.
    fn start(
        &mut self,
        metadata: &EncoderMetadata,
        color_format: u32,
        events: Arc<dyn EncoderEvents>,
    ) -> CodecResult<()>;

    /// Queues one input buffer, already packed in the layout negotiated at
    /// `start`.
    fn encode(&mut self, data: Vec<u8>, timestamp_us: u64, force_sync: bool) -> CodecResult<()>;

    fn stop(&mut self);
}

struct EncoderInner {
    backend: Box<dyn EncoderBackend>,
    /// Input layout negotiated at init; `None` until then.
    layout: Option<YcbcrLayout>,
    format: Option<PixelFormat>,
}

struct EncoderShared {
    inner: Mutex<EncoderInner>,
    listener: Mutex<Option<Arc<dyn EncoderListener>>>,
}

/// Encoder session over a `dyn EncoderBackend`; handed out by a provider as
/// `Arc<dyn VideoEncoder>`.
pub struct EncoderSession {
    shared: Arc<EncoderShared>,
}

impl EncoderSession {
    pub fn new(backend: Box<dyn EncoderBackend>) -> Self {
        Self {
            shared: Arc::new(EncoderShared {
                inner: Mutex::new(EncoderInner { backend, layout: None, format: None }),
                listener: Mutex::new(None),
            }),
        }
    }
}

impl VideoEncoder for EncoderSession {
    fn init(&self, metadata: EncoderMetadata) -> CodecResult<()> {
        if metadata.size.get_area() == 0 {
            return Err(CodecError::InvalidMetadata(format!("empty frame size {}", metadata.size)));
        }

        let mut inner = self.shared.inner.lock().unwrap();
        let supported = inner.backend.supported_input_formats()?;
        let (color_format, format) = supported
            .iter()
            .find_map(|&code| pixel_format_for(code).map(|format| (code, format)))
            .ok_or(CodecError::NoSupportedFormat)?;
        log::info!(
            "encoder input: {} ({:#x}) for {} {} @{}kbps",
            format,
            color_format,
            metadata.codec,
            metadata.size,
            metadata.bitrate / 1000
        );

        let events = Arc::clone(&self.shared) as Arc<dyn EncoderEvents>;
        inner.backend.start(&metadata, color_format, events)?;
        inner.layout = Some(YcbcrLayout::derive(&OutputGeometry {
            coded: metadata.size,
            visible: metadata.size,
            format,
        }));
        inner.format = Some(format);
        Ok(())
    }

    fn encode(&self, frame: &YcbcrFrame, force_sync: bool) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        let (layout, format) = match (inner.layout, inner.format) {
            (Some(layout), Some(format)) => (layout, format),
            _ => return Err(CodecError::NotInitialized),
        };

        let mut packed = vec![0u8; layout.min_buffer_size()];
        match format {
            PixelFormat::Yuv420Planar => pack_planar(frame, &layout, &mut packed),
            PixelFormat::Yuv420SemiPlanar | PixelFormat::Yuv420PackedSemiPlanar32m => {
                pack_semi_planar(frame, &layout, &mut packed)
            }
        }
        inner.backend.encode(packed, frame.timestamp_us(), force_sync)
    }

    fn set_listener(&self, listener: Arc<dyn EncoderListener>) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.shared.inner.lock().unwrap().backend.stop();
    }
}

impl EncoderEvents for EncoderShared {
    fn encoded(&self, frame: EncodedFrame) {
        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_encoded_frame(frame);
        }
    }

    fn error(&self, description: String) {
        log::error!("encoder error: {}", description);
        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_encoder_error(&description);
        }
    }
}

/// Copies the source view into a contiguous planar (I420) buffer.
fn pack_planar(frame: &YcbcrFrame, layout: &YcbcrLayout, out: &mut [u8]) {
    pack_luma(frame, layout, out);

    let (width, height) = clipped_size(frame, layout);
    let chroma_w = (width + 1) / 2;
    let chroma_h = (height + 1) / 2;
    let src_step = frame.chroma_step();
    let (cb, cr) = (frame.cb(), frame.cr());
    for row in 0..chroma_h {
        let src_row = row * frame.c_stride();
        let cb_row = layout.cb_offset + row * layout.c_stride;
        let cr_row = layout.cr_offset + row * layout.c_stride;
        for col in 0..chroma_w {
            out[cb_row + col] = cb[src_row + col * src_step];
            out[cr_row + col] = cr[src_row + col * src_step];
        }
    }
}

/// Copies the source view into a semi-planar buffer with interleaved CbCr.
fn pack_semi_planar(frame: &YcbcrFrame, layout: &YcbcrLayout, out: &mut [u8]) {
    pack_luma(frame, layout, out);

    let (width, height) = clipped_size(frame, layout);
    let chroma_w = (width + 1) / 2;
    let chroma_h = (height + 1) / 2;
    let src_step = frame.chroma_step();
    let (cb, cr) = (frame.cb(), frame.cr());
    for row in 0..chroma_h {
        let src_row = row * frame.c_stride();
        let dst_row = layout.cb_offset + row * layout.c_stride;
        for col in 0..chroma_w {
            out[dst_row + 2 * col] = cb[src_row + col * src_step];
            out[dst_row + 2 * col + 1] = cr[src_row + col * src_step];
        }
    }
}

fn pack_luma(frame: &YcbcrFrame, layout: &YcbcrLayout, out: &mut [u8]) {
    let (width, height) = clipped_size(frame, layout);
    let y = frame.y();
    for row in 0..height {
        let src = &y[row * frame.y_stride()..][..width];
        out[layout.y_offset + row * layout.y_stride..][..width].copy_from_slice(src);
    }
}

/// Frames smaller than the negotiated layout are packed top-left; larger
/// ones are cropped. Init fixes the hardware geometry, so in practice the
/// dimensions match.
fn clipped_size(frame: &YcbcrFrame, layout: &YcbcrLayout) -> (usize, usize) {
    (
        (frame.width().min(layout.width)) as usize,
        (frame.height().min(layout.height)) as usize,
    )
}
