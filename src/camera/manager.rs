// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Root camera manager, aggregating every provider behind one flat index.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::camera::Camera;
use crate::camera::CameraError;
use crate::camera::CameraInfo;
use crate::camera::CameraProvider;
use crate::camera::CameraResult;
use crate::camera::CaptureMode;
use crate::provider;

struct ManagerState {
    providers: Vec<&'static dyn CameraProvider>,
    initialized: bool,
    /// Providers whose `init` succeeded; rebuilt indexes only cover these.
    active: Vec<&'static dyn CameraProvider>,
    /// Flat index from the last enumeration pass, in provider order.
    cameras: Vec<CameraInfo>,
    /// id -> owning provider; on duplicate ids the later provider wins.
    owners: HashMap<String, &'static dyn CameraProvider>,
}

/// Aggregates the camera providers of every loaded module.
///
/// Enumeration is live: `num_cameras` re-asks every provider on each call,
/// so hot-plugged devices appear without any explicit refresh.
pub struct CameraManager {
    state: Mutex<ManagerState>,
}

impl CameraManager {
    /// A manager over the plugin modules in the plugin directory.
    pub fn new() -> Self {
        Self::with_providers(provider::list().iter().filter_map(|handle| handle.camera()))
    }

    /// A manager over an explicit provider list; used for built-in software
    /// providers and tests.
    pub fn with_providers(
        providers: impl IntoIterator<Item = &'static dyn CameraProvider>,
    ) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                providers: providers.into_iter().collect(),
                initialized: false,
                active: Vec::new(),
                cameras: Vec::new(),
                owners: HashMap::new(),
            }),
        }
    }

    fn ensure_init(state: &mut ManagerState) {
        if state.initialized {
            return;
        }
        state.initialized = true;
        for provider in &state.providers {
            match provider.init() {
                Ok(()) => state.active.push(*provider),
                Err(err) => {
                    log::warn!("camera provider `{}` failed to initialize: {}", provider.name(), err)
                }
            }
        }
    }

    fn rebuild_index(state: &mut ManagerState) {
        Self::ensure_init(state);
        state.cameras.clear();
        state.owners.clear();
        for provider in &state.active {
            for index in 0..provider.num_cameras() {
                let Some(info) = provider.camera_info(index) else {
                    continue;
                };
                state.owners.insert(info.id.clone(), *provider);
                state.cameras.push(info);
            }
        }
    }

    /// Number of cameras currently exposed by all providers. Re-enumerates
    /// on every call.
    pub fn num_cameras(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        Self::rebuild_index(&mut state);
        state.cameras.len()
    }

    /// Camera at `index` in the last enumeration pass.
    pub fn camera_info(&self, index: usize) -> Option<CameraInfo> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_init(&mut state);
        state.cameras.get(index).cloned()
    }

    /// An immutable snapshot of the current camera set. Unlike
    /// `num_cameras` plus `camera_info`, the result cannot be torn by a
    /// concurrent re-enumeration.
    pub fn enumerate(&self) -> Vec<CameraInfo> {
        let mut state = self.state.lock().unwrap();
        Self::rebuild_index(&mut state);
        state.cameras.clone()
    }

    fn owner_of(&self, id: &str) -> CameraResult<&'static dyn CameraProvider> {
        let mut state = self.state.lock().unwrap();
        if !state.owners.contains_key(id) {
            Self::rebuild_index(&mut state);
        }
        state.owners.get(id).copied().ok_or_else(|| CameraError::NotFound(id.to_string()))
    }

    pub fn query_capabilities(&self, id: &str) -> CameraResult<Vec<CaptureMode>> {
        // Delegation happens outside the index lock; providers may block on
        // hardware to answer.
        self.owner_of(id)?.query_capabilities(id)
    }

    pub fn open_camera(&self, id: &str) -> CameraResult<Arc<dyn Camera>> {
        self.owner_of(id)?.open_camera(id)
    }
}

impl Default for CameraManager {
    fn default() -> Self {
        Self::new()
    }
}
