// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding pipeline that delivers frames into a small, fixed set of externally owned native
//! buffers.
//!
//! The decoder library only decodes a frame once it has been handed a backing buffer through a
//! caller-supplied allocation callback. The [frame pool](video_frame::frame_pool) provides these
//! buffers out of the external ones, the [decode engine](decoder::engine) drives the codec session
//! and turns its completed images into output frames, and the [transfer
//! stage](decoder::transfer) makes the decoded pixels visible in the external buffer layout,
//! either by aliasing the buffer directly (surface mode) or by copying (copy mode).
//!
//! A slot of the pool is owned by the decoder while it decodes into it, by the consumer while it
//! displays it, and by the pool when idle. It is only offered to the decoder again once both the
//! decoder and the consumer have relinquished it.

pub mod backend;
pub mod bitstream_utils;
pub mod decoder;
pub mod image_processing;
pub mod utils;
pub mod video_frame;

use std::fmt;

/// Opaque identity of an external native buffer. Stable for the lifetime of the buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey(pub u64);

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// A rectangle within a frame, used to report the visible region of an output buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Position of one plane within a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Offset in bytes of the first visible texel of the plane.
    pub offset: usize,
    /// Distance in bytes between two consecutive lines of the plane.
    pub stride: usize,
}
