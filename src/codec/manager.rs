// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Root codec manager, fanning codec requests out across providers.

use std::sync::Arc;
use std::sync::Mutex;

use crate::codec::CodecError;
use crate::codec::CodecProvider;
use crate::codec::CodecResult;
use crate::codec::CodecType;
use crate::codec::VideoDecoder;
use crate::codec::VideoEncoder;
use crate::provider;

struct ManagerState {
    providers: Vec<&'static dyn CodecProvider>,
    initialized: bool,
    active: Vec<&'static dyn CodecProvider>,
}

/// Aggregates the codec providers of every loaded module. Creation requests
/// go to the first provider that succeeds, in discovery order.
pub struct CodecManager {
    state: Mutex<ManagerState>,
}

impl CodecManager {
    pub fn new() -> Self {
        Self::with_providers(provider::list().iter().filter_map(|handle| handle.codec()))
    }

    pub fn with_providers(providers: impl IntoIterator<Item = &'static dyn CodecProvider>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                providers: providers.into_iter().collect(),
                initialized: false,
                active: Vec::new(),
            }),
        }
    }

    /// Providers whose `init` succeeded; failures are excluded, not fatal.
    fn active(&self) -> Vec<&'static dyn CodecProvider> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if !state.initialized {
            state.initialized = true;
            for provider in &state.providers {
                match provider.init() {
                    Ok(()) => state.active.push(*provider),
                    Err(err) => log::warn!(
                        "codec provider `{}` failed to initialize: {}",
                        provider.name(),
                        err
                    ),
                }
            }
        }
        state.active.clone()
    }

    pub fn encoder_available(&self, codec: CodecType) -> bool {
        self.active().iter().any(|provider| provider.encoder_available(codec))
    }

    pub fn decoder_available(&self, codec: CodecType) -> bool {
        self.active().iter().any(|provider| provider.decoder_available(codec))
    }

    pub fn create_encoder(&self, codec: CodecType) -> CodecResult<Arc<dyn VideoEncoder>> {
        for provider in self.active() {
            match provider.create_encoder(codec) {
                Ok(encoder) => return Ok(encoder),
                Err(err) => {
                    log::debug!("`{}` has no {} encoder: {}", provider.name(), codec, err)
                }
            }
        }
        Err(CodecError::Unsupported(codec))
    }

    pub fn create_decoder(&self, codec: CodecType) -> CodecResult<Arc<dyn VideoDecoder>> {
        for provider in self.active() {
            match provider.create_decoder(codec) {
                Ok(decoder) => return Ok(decoder),
                Err(err) => {
                    log::debug!("`{}` has no {} decoder: {}", provider.name(), codec, err)
                }
            }
        }
        Err(CodecError::Unsupported(codec))
    }
}

impl Default for CodecManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FakeProvider {
        name: &'static str,
        init_ok: bool,
        codecs: Vec<CodecType>,
    }

    impl FakeProvider {
        fn create(name: &'static str, init_ok: bool, codecs: &[CodecType]) -> &'static Self {
            Box::leak(Box::new(Self { name, init_ok, codecs: codecs.to_vec() }))
        }
    }

    impl CodecProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn init(&self) -> CodecResult<()> {
            if self.init_ok {
                Ok(())
            } else {
                Err(CodecError::Other(anyhow!("no hardware")))
            }
        }

        fn encoder_available(&self, codec: CodecType) -> bool {
            self.codecs.contains(&codec)
        }

        fn decoder_available(&self, codec: CodecType) -> bool {
            self.codecs.contains(&codec)
        }

        fn create_encoder(&self, codec: CodecType) -> CodecResult<Arc<dyn VideoEncoder>> {
            Err(CodecError::Unsupported(codec))
        }

        fn create_decoder(&self, codec: CodecType) -> CodecResult<Arc<dyn VideoDecoder>> {
            Err(CodecError::Unsupported(codec))
        }
    }

    #[test]
    fn zero_providers() {
        let manager = CodecManager::with_providers([]);
        assert!(!manager.decoder_available(CodecType::H264));
        assert!(matches!(
            manager.create_decoder(CodecType::H264),
            Err(CodecError::Unsupported(CodecType::H264))
        ));
    }

    #[test]
    fn availability_fans_out_across_providers() {
        let a = FakeProvider::create("a", true, &[CodecType::Vp8]);
        let b = FakeProvider::create("b", true, &[CodecType::H264]);
        let manager = CodecManager::with_providers([
            a as &'static dyn CodecProvider,
            b as &'static dyn CodecProvider,
        ]);

        assert!(manager.encoder_available(CodecType::Vp8));
        assert!(manager.decoder_available(CodecType::H264));
        assert!(!manager.decoder_available(CodecType::Vp9));
    }

    #[test]
    fn failing_provider_is_excluded() {
        let bad = FakeProvider::create("bad", false, &[CodecType::H264]);
        let manager = CodecManager::with_providers([bad as &'static dyn CodecProvider]);
        assert!(!manager.decoder_available(CodecType::H264));
    }
}
