// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::collections::VecDeque;

use nix::unistd::sysconf;
use nix::unistd::SysconfVar;

use crate::decoder::engine::DecodeEngine;
use crate::decoder::DecodeError;
use crate::decoder::DecodeOutcome;
use crate::decoder::ErrorKind;
use crate::decoder::OutputFrame;
use crate::video_frame::frame_pool::PoolError;
use crate::BufferKey;

/// Number of dropped frames after which [`simple_playback_loop`] gives up.
pub const MAX_INTEGRITY_FAILURES: usize = 3;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Returns the number of online CPU cores, at least 1.
pub fn cpu_core_count() -> usize {
    match sysconf(SysconfVar::_NPROCESSORS_ONLN) {
        Ok(Some(count)) if count > 0 => count as usize,
        Ok(_) => 1,
        Err(e) => {
            log::warn!("failed to query the number of CPU cores: {}", e);
            1
        }
    }
}

/// Consumer side of [`simple_playback_loop`]: receives the frames and keeps the last few of them
/// on display.
struct FrameSink<'a> {
    on_new_frame: &'a mut dyn FnMut(&OutputFrame),
    /// Keys of the frames on display, oldest first.
    held: VecDeque<BufferKey>,
    render_lag: usize,
}

impl<'a> FrameSink<'a> {
    fn show(&mut self, engine: &mut DecodeEngine, frame: OutputFrame) {
        (self.on_new_frame)(&frame);
        self.held.push_back(frame.key);
        while self.held.len() > self.render_lag {
            self.release_oldest(engine);
        }
    }

    /// Stops displaying the oldest frame. Returns `false` if no frame was on display.
    fn release_oldest(&mut self, engine: &mut DecodeEngine) -> bool {
        match self.held.pop_front() {
            Some(key) => {
                engine.mark_render_done(key);
                true
            }
            None => false,
        }
    }

    /// Shows every frame coming out of `result` and the following retrieval steps. Returns the
    /// first outcome that is not a frame.
    fn show_all(
        &mut self,
        engine: &mut DecodeEngine,
        mut result: Result<DecodeOutcome, DecodeError>,
    ) -> Result<DecodeOutcome, DecodeError> {
        loop {
            match result {
                Ok(DecodeOutcome::Frame(frame)) => self.show(engine, frame),
                Err(e) if e.kind() == ErrorKind::Integrity => {
                    if engine.integrity_failures() >= MAX_INTEGRITY_FAILURES {
                        return Err(e);
                    }
                    log::warn!("frame dropped: {}", e);
                }
                outcome => return outcome,
            }
            result = engine.retrieve();
        }
    }
}

/// Simple decoding loop that plays the stream `units` until the end.
///
/// `on_new_frame` is called with every frame delivered. The last `render_lag` frames are kept on
/// display, i.e. their buffers are only given back to the pool once newer frames have been shown,
/// or when the decoder runs out of buffers. Units the codec rejects are skipped.
pub fn simple_playback_loop<R, I>(
    engine: &mut DecodeEngine,
    units: I,
    render_lag: usize,
    on_new_frame: &mut dyn FnMut(&OutputFrame),
) -> anyhow::Result<()>
where
    R: AsRef<[u8]>,
    I: Iterator<Item = R>,
{
    let mut display = FrameSink {
        on_new_frame,
        held: VecDeque::new(),
        render_lag,
    };
    let mut timestamp = 0;

    for (frame_num, unit) in units.enumerate() {
        timestamp = frame_num as u64;
        let unit = unit.as_ref();

        loop {
            // Apply backpressure by returning frames on display until enough buffers are free.
            while !engine.can_accept_more_work() && display.release_oldest(engine) {}

            let result = engine.decode(unit, timestamp, false);
            match display.show_all(engine, result) {
                Ok(_) => break,
                Err(DecodeError::Pool(PoolError::NoBufferAvailable)) => {
                    if !display.release_oldest(engine) {
                        anyhow::bail!(
                            "no buffer available to decode unit {} and no frame to give back",
                            frame_num
                        );
                    }
                }
                Err(e) if e.kind() == ErrorKind::Data => {
                    log::warn!("skipping unit {}: {}", frame_num, e);
                    break;
                }
                Err(e) => anyhow::bail!(e),
            }
        }
    }

    // Drain the frames still buffered in the codec.
    let result = engine.decode(&[], timestamp, true);
    match display.show_all(engine, result)? {
        DecodeOutcome::EndOfStream => (),
        outcome => anyhow::bail!("unexpected outcome {:?} while draining", outcome),
    }

    while display.release_oldest(engine) {}

    Ok(())
}
