// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-abstraction layer for cameras and hardware video codecs.
//!
//! `videohal` lets an application enumerate, select, and drive cameras and
//! hardware codecs across interchangeable backend providers that are loaded
//! dynamically at runtime. The platform media subsystem itself (sensor
//! control, codec execution, bit production) lives behind the backend traits
//! in [`camera::device`], [`codec::encoder`] and [`codec::decoder`]; this
//! crate owns the orchestration around it:
//!
//! - [`provider`]: the dynamic provider-module registry,
//! - [`camera`]: the root camera manager, the per-device capture state
//!   machine and exclusive-access arbitration,
//! - [`pool`] and [`video_frame`]: reference-counted, lazily-mapped views
//!   over hardware-owned frame buffers,
//! - [`codec`]: encoder/decoder session state machines with backpressured
//!   queuing and asynchronous delivery.

pub mod backend;
pub mod camera;
pub mod codec;
pub mod pool;
pub mod provider;
pub mod utils;
pub mod video_frame;

/// A frame resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
