// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec backends.
//!
//! A backend is a provider of codec sessions implementing [`crate::decoder::Codec`]. Hardware
//! accelerated backends live outside of this crate; the backends here need nothing but the CPU.

pub mod raw;
