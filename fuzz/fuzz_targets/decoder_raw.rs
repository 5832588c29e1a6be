// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use libfuzzer_sys::fuzz_target;
use native_buffer_decoder::backend::raw::RawCodec;
use native_buffer_decoder::bitstream_utils::IvfIterator;
use native_buffer_decoder::decoder::engine::DecodeEngine;
use native_buffer_decoder::decoder::transfer::OutputMode;
use native_buffer_decoder::decoder::DecoderConfig;
use native_buffer_decoder::utils::simple_playback_loop;
use native_buffer_decoder::video_frame::heap_buffer::HeapBufferAllocator;
use native_buffer_decoder::video_frame::BufferGeometry;
use native_buffer_decoder::Resolution;

fuzz_target!(|data: &[u8]| {
    let geometry = BufferGeometry::for_stream(Resolution::from((64, 64)), 8);
    let mut allocator = HeapBufferAllocator::new();
    let Ok(keys) = allocator.allocate_many(&geometry, 6) else {
        return;
    };
    let config = DecoderConfig::default().with_max_buffers(6).with_border(8);
    let Ok(mut engine) = DecodeEngine::new(
        config,
        OutputMode::Copy(Box::new(allocator.mapper())),
        geometry,
        keys,
    ) else {
        return;
    };
    if engine
        .initialize(&RawCodec::new().with_reorder_depth(2), Some(1))
        .is_err()
    {
        return;
    }

    let _ = simple_playback_loop(&mut engine, IvfIterator::new(data), 1, &mut |_| ());
});
