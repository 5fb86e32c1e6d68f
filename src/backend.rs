// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software providers, used for tests and hardware-free integration.

pub mod loopback;
pub mod test_pattern;
