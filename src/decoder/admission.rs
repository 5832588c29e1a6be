// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Admission control for new decode work.
//!
//! A codec may need more than one buffer during a single decode call, e.g. to keep a reference
//! frame while reordering. Accepting work with a single free slot can deadlock the codec on a
//! second buffer that will never come, so new work is only accepted once a configurable number of
//! slots are free at the same time.

use crate::video_frame::frame_pool::FramePool;

pub const DEFAULT_MIN_FREE_SLOTS: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdmissionGate {
    min_free_slots: usize,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FREE_SLOTS)
    }
}

impl AdmissionGate {
    /// Creates a gate requiring `min_free_slots` free slots, at least one.
    pub fn new(min_free_slots: usize) -> Self {
        Self {
            min_free_slots: min_free_slots.max(1),
        }
    }

    pub fn min_free_slots(&self) -> usize {
        self.min_free_slots
    }

    /// Returns whether enough slots of `pool` are free to accept another decode request. When
    /// this returns `false`, the caller should hold its work until the consumer gives frames back.
    pub fn can_accept_more_work(&self, pool: &FramePool) -> bool {
        pool.count_available() >= self.min_free_slots
    }
}
