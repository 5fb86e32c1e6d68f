// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dynamic discovery of backend provider modules.
//!
//! A provider module is a shared object exporting [`ENTRY_SYMBOL`], a
//! function returning a pointer to a process-lifetime
//! [`ProviderDescriptor`]. Modules are loaded once per process and never
//! unloaded; every singleton they hand out stays valid until exit.

use std::env;
use std::mem;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::camera::CameraProvider;
use crate::codec::CodecProvider;
use crate::utils::env_is_set;

/// Overrides the directory scanned for provider modules.
pub const PLUGIN_DIR_VAR: &str = "VIDEOHAL_PLUGIN_DIR";
/// Enables verbose diagnostics in release builds.
pub const DEBUG_VAR: &str = "VIDEOHAL_DEBUG";

const DEFAULT_PLUGIN_DIR: &str = "/usr/lib/videohal/plugins";

/// The symbol a provider module exports.
pub const ENTRY_SYMBOL: &[u8] = b"videohal_provider_entry\0";

/// `extern "C" fn() -> *const ProviderDescriptor`, returning a pointer that
/// must stay valid for the lifetime of the process.
pub type ProviderEntry = extern "C" fn() -> *const ProviderDescriptor;

/// What one provider module offers. Either part may be absent; the
/// constructors return process-lifetime singletons.
pub struct ProviderDescriptor {
    pub name: &'static str,
    pub camera: Option<fn() -> &'static dyn CameraProvider>,
    pub codec: Option<fn() -> &'static dyn CodecProvider>,
}

/// One successfully loaded provider module.
pub struct ProviderHandle {
    descriptor: &'static ProviderDescriptor,
}

impl ProviderHandle {
    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn camera(&self) -> Option<&'static dyn CameraProvider> {
        self.descriptor.camera.map(|construct| construct())
    }

    pub fn codec(&self) -> Option<&'static dyn CodecProvider> {
        self.descriptor.codec.map(|construct| construct())
    }

    /// Wraps a descriptor without going through `dlopen`; used for built-in
    /// software providers and tests.
    pub fn from_descriptor(descriptor: &'static ProviderDescriptor) -> Self {
        Self { descriptor }
    }
}

/// The plugin modules found in the plugin directory, discovered on first
/// use. Iteration order is filesystem-dependent and not contractual.
pub fn list() -> &'static [ProviderHandle] {
    static PROVIDERS: OnceLock<Vec<ProviderHandle>> = OnceLock::new();
    PROVIDERS.get_or_init(|| {
        if env_is_set(DEBUG_VAR) {
            log::info!("verbose provider diagnostics enabled");
        }
        let dir = env::var_os(PLUGIN_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_DIR));
        discover(&dir)
    })
}

/// Scans `dir` (non-recursively) and loads every file that exposes the
/// entry symbol. Files that fail to load or lack the symbol are skipped.
fn discover(dir: &Path) -> Vec<ProviderHandle> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::debug!("not scanning {}: {}", dir.display(), err);
            return Vec::new();
        }
    };

    let mut providers = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match load_module(&path) {
            Some(handle) => {
                log::info!("loaded provider `{}` from {}", handle.name(), path.display());
                providers.push(handle);
            }
            None => log::debug!("skipping {}", path.display()),
        }
    }
    providers
}

fn load_module(path: &Path) -> Option<ProviderHandle> {
    // SAFETY: a provider module's constructors run at load; we trust
    // anything placed in the plugin directory, as dlopen-based plugin
    // systems must.
    let library = match unsafe { libloading::Library::new(path) } {
        Ok(library) => library,
        Err(err) => {
            log::debug!("{}: {}", path.display(), err);
            return None;
        }
    };

    // SAFETY: the symbol type is part of the module ABI contract.
    let entry = match unsafe { library.get::<ProviderEntry>(ENTRY_SYMBOL) } {
        Ok(entry) => *entry,
        Err(err) => {
            log::debug!("{}: {}", path.display(), err);
            return None;
        }
    };

    let descriptor = entry();
    if descriptor.is_null() {
        log::warn!("{}: entry returned no descriptor", path.display());
        return None;
    }

    // Modules are never unloaded, so the descriptor and everything it hands
    // out really are 'static.
    mem::forget(library);

    // SAFETY: non-null, and the entry contract promises process lifetime.
    let descriptor = unsafe { &*descriptor };
    Some(ProviderHandle { descriptor })
}
