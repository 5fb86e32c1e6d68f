// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Read-only, format-specific views over hardware-owned frame buffers.
//!
//! Ownership forms a linear chain of strong references: a [`YcbcrFrame`] or
//! [`RawFrame`] keeps its [`GraphicBuffer`] alive, the buffer keeps its pool
//! slot alive (if it was minted from one), and the slot keeps the underlying
//! [`BufferHandle`]. Dropping the last link releases the hardware buffer
//! back to the platform HAL, exactly once.

use std::sync::Arc;

use crate::pool::PoolItem;
use crate::utils::align_up;
use crate::Resolution;

/// Hardware pixel layouts this layer knows how to interpret.
///
/// The variants map to the OMX color formats reported by the platforms we
/// have seen in the wild; everything else is rejected at layout derivation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// I420: three planes, luma height padded to 4 rows.
    Yuv420Planar,
    /// NV12-like: luma plane plus interleaved CbCr, stride padded to 16.
    Yuv420SemiPlanar,
    /// Qualcomm packed semi-planar: 128-byte stride, 32-row slice alignment.
    Yuv420PackedSemiPlanar32m,
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Yuv420Planar => "yuv420p",
            PixelFormat::Yuv420SemiPlanar => "nv12",
            PixelFormat::Yuv420PackedSemiPlanar32m => "nv12-32m",
        };
        write!(f, "{}", name)
    }
}

/// Output buffer geometry as reported by a camera or codec backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputGeometry {
    /// Allocated (padded) dimensions of the buffer.
    pub coded: Resolution,
    /// The part of the buffer that carries the image.
    pub visible: Resolution,
    pub format: PixelFormat,
}

/// Plane offsets and strides for one mapped YCbCr buffer.
///
/// A layout is a template: it depends only on the buffer geometry, not on
/// any single buffer, and is re-derived whenever the hardware reports a
/// geometry change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct YcbcrLayout {
    pub width: u32,
    pub height: u32,
    pub y_offset: usize,
    pub cb_offset: usize,
    pub cr_offset: usize,
    pub y_stride: usize,
    pub c_stride: usize,
    /// Distance in bytes between two consecutive chroma samples of the same
    /// component: 1 for planar layouts, 2 for interleaved CbCr.
    pub chroma_step: usize,
}

impl YcbcrLayout {
    /// Derives plane offsets from the hardware-reported geometry.
    pub fn derive(geometry: &OutputGeometry) -> YcbcrLayout {
        let coded_w = geometry.coded.width as usize;
        let visible = geometry.visible;
        match geometry.format {
            PixelFormat::Yuv420Planar => {
                let aligned_h = align_up(geometry.coded.height as usize, 4);
                let y_stride = coded_w;
                let luma = y_stride * aligned_h;
                YcbcrLayout {
                    width: visible.width,
                    height: visible.height,
                    y_offset: 0,
                    cb_offset: luma,
                    cr_offset: luma + luma / 4,
                    y_stride,
                    c_stride: coded_w / 2,
                    chroma_step: 1,
                }
            }
            PixelFormat::Yuv420SemiPlanar => {
                let y_stride = align_up(coded_w, 16);
                let luma = y_stride * geometry.coded.height as usize;
                YcbcrLayout {
                    width: visible.width,
                    height: visible.height,
                    y_offset: 0,
                    cb_offset: luma,
                    cr_offset: luma + 1,
                    y_stride,
                    c_stride: y_stride,
                    chroma_step: 2,
                }
            }
            PixelFormat::Yuv420PackedSemiPlanar32m => {
                let y_stride = align_up(coded_w, 128);
                let luma = y_stride * align_up(geometry.coded.height as usize, 32);
                YcbcrLayout {
                    width: visible.width,
                    height: visible.height,
                    y_offset: 0,
                    cb_offset: luma,
                    cr_offset: luma + 1,
                    y_stride,
                    c_stride: y_stride,
                    chroma_step: 2,
                }
            }
        }
    }

    /// Minimum size of a mapping this layout can be applied to.
    pub fn min_buffer_size(&self) -> usize {
        let chroma_rows = (self.height as usize + 1) / 2;
        let y_end = self.y_offset + self.y_stride * self.height as usize;
        let cb_end = self.cb_offset + self.c_stride * chroma_rows;
        let cr_end = self.cr_offset + self.c_stride * chroma_rows;
        y_end.max(cb_end).max(cr_end)
    }
}

/// An opaque hardware buffer owned by the platform media HAL.
///
/// Implementors release the underlying hardware buffer in their `Drop`;
/// the rest of this crate guarantees the last strong reference goes away
/// exactly once per binding.
pub trait BufferHandle: Send + Sync {
    fn resolution(&self) -> Resolution;

    /// Capture or decode timestamp, in microseconds.
    fn timestamp_us(&self) -> u64;

    /// The plane layout of this buffer's mapping.
    fn layout(&self) -> YcbcrLayout;

    /// Maps the buffer for reading.
    ///
    /// Lazy and idempotent: after the first successful call the mapping is
    /// stable for the lifetime of the handle.
    fn map(&self) -> anyhow::Result<&[u8]>;

    /// Out-of-band pool tag stored on the handle itself, so a native
    /// callback can be resolved back to its pool slot in O(1). 0 means
    /// unbound; see [`crate::pool::BufferPool`].
    fn pool_tag(&self) -> u64;
    fn set_pool_tag(&self, tag: u64);
}

/// A reference-counted frame buffer handed to application code.
///
/// Minted either from a pool slot (capture, zero-copy decode) or standalone
/// (copy-mode decode). Mapping is deferred until a view is requested.
pub struct GraphicBuffer {
    handle: Arc<dyn BufferHandle>,
    /// Keeps the originating pool slot alive; `None` for standalone buffers.
    slot: Option<Arc<PoolItem>>,
}

impl GraphicBuffer {
    pub(crate) fn from_slot(handle: Arc<dyn BufferHandle>, slot: Arc<PoolItem>) -> Arc<Self> {
        Arc::new(Self { handle, slot: Some(slot) })
    }

    /// Wraps a handle that is not managed by any pool.
    pub fn standalone(handle: Arc<dyn BufferHandle>) -> Arc<Self> {
        Arc::new(Self { handle, slot: None })
    }

    pub fn resolution(&self) -> Resolution {
        self.handle.resolution()
    }

    pub fn timestamp_us(&self) -> u64 {
        self.handle.timestamp_us()
    }

    /// Maps the buffer and overlays the handle's own plane layout.
    pub fn map_ycbcr(self: &Arc<Self>) -> Option<YcbcrFrame> {
        self.map_ycbcr_with(self.handle.layout())
    }

    /// Maps the buffer and overlays an externally derived layout.
    ///
    /// Used by the copy-mode decoder path, where the layout template comes
    /// from the session (and may have been re-derived after a geometry
    /// change) rather than from the buffer itself.
    pub fn map_ycbcr_with(self: &Arc<Self>, layout: YcbcrLayout) -> Option<YcbcrFrame> {
        let data = match self.handle.map() {
            Ok(data) => data,
            Err(err) => {
                log::debug!("buffer mapping failed: {:#}", err);
                return None;
            }
        };
        if data.len() < layout.min_buffer_size() {
            log::debug!(
                "mapping too small for layout: {} < {}",
                data.len(),
                layout.min_buffer_size()
            );
            return None;
        }
        Some(YcbcrFrame { buffer: Arc::clone(self), layout, timestamp_us: self.timestamp_us() })
    }

    /// Maps the buffer as a single opaque plane.
    pub fn map_raw(self: &Arc<Self>) -> Option<RawFrame> {
        if self.handle.map().is_err() {
            return None;
        }
        Some(RawFrame { buffer: Arc::clone(self), timestamp_us: self.timestamp_us() })
    }
}

/// Read-only YCbCr overlay over a mapped [`GraphicBuffer`].
pub struct YcbcrFrame {
    buffer: Arc<GraphicBuffer>,
    layout: YcbcrLayout,
    timestamp_us: u64,
}

impl YcbcrFrame {
    fn data(&self) -> &[u8] {
        // Mapping succeeded and was size-checked when the view was minted,
        // and a handle's mapping is stable for its lifetime.
        self.buffer.handle.map().unwrap_or(&[])
    }

    /// The luma plane, `y_stride()` bytes per row.
    pub fn y(&self) -> &[u8] {
        let start = self.layout.y_offset;
        let end = start + self.layout.y_stride * self.layout.height as usize;
        self.data().get(start..end).unwrap_or(&[])
    }

    /// The Cb plane, starting at its offset and running to the end of the
    /// mapping. For `chroma_step() == 2` the samples interleave with Cr.
    pub fn cb(&self) -> &[u8] {
        self.data().get(self.layout.cb_offset..).unwrap_or(&[])
    }

    /// The Cr plane; see [`Self::cb`].
    pub fn cr(&self) -> &[u8] {
        self.data().get(self.layout.cr_offset..).unwrap_or(&[])
    }

    pub fn y_stride(&self) -> usize {
        self.layout.y_stride
    }

    pub fn c_stride(&self) -> usize {
        self.layout.c_stride
    }

    pub fn chroma_step(&self) -> usize {
        self.layout.chroma_step
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn layout(&self) -> &YcbcrLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &Arc<GraphicBuffer> {
        &self.buffer
    }
}

/// Whole-image single-plane view for formats this layer does not interpret.
pub struct RawFrame {
    buffer: Arc<GraphicBuffer>,
    timestamp_us: u64,
}

impl RawFrame {
    pub fn data(&self) -> &[u8] {
        self.buffer.handle.map().unwrap_or(&[])
    }

    pub fn resolution(&self) -> Resolution {
        self.buffer.resolution()
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}
