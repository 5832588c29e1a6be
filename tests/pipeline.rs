// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End to end decoding of IVF streams into external buffers, in both output modes.

use native_buffer_decoder::backend::raw::pack_frame;
use native_buffer_decoder::backend::raw::pattern_frame;
use native_buffer_decoder::backend::raw::RawCodec;
use native_buffer_decoder::bitstream_utils::write_ivf;
use native_buffer_decoder::bitstream_utils::IvfFileHeader;
use native_buffer_decoder::bitstream_utils::IvfIterator;
use native_buffer_decoder::decoder::engine::DecodeEngine;
use native_buffer_decoder::decoder::transfer::OutputMode;
use native_buffer_decoder::decoder::DecodeOutcome;
use native_buffer_decoder::decoder::DecoderConfig;
use native_buffer_decoder::image_processing::yv12_to_i420;
use native_buffer_decoder::image_processing::Yv12Layout;
use native_buffer_decoder::utils::simple_playback_loop;
use native_buffer_decoder::video_frame::heap_buffer::HeapBufferAllocator;
use native_buffer_decoder::video_frame::BufferGeometry;
use native_buffer_decoder::Resolution;

const WIDTH: u16 = 48;
const HEIGHT: u16 = 30;
const BORDER: usize = 8;
const NUM_FRAMES: u8 = 12;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn geometry() -> BufferGeometry {
    BufferGeometry::for_stream(Resolution::from((WIDTH as u32, HEIGHT as u32)), BORDER)
}

/// Builds an IVF stream of `width`x`height` frames where frame `hidden_every` is not shown.
fn ivf_stream_of_size(width: u16, height: u16, hidden_every: Option<u8>) -> Vec<u8> {
    let frames = (0..NUM_FRAMES)
        .map(|seed| {
            let show = hidden_every.map_or(true, |n| seed % n != n - 1);
            pack_frame(width, height, show, &pattern_frame(width, height, seed))
        })
        .collect::<Vec<_>>();
    let header = IvfFileHeader::new(
        IvfFileHeader::CODEC_RAW,
        width,
        height,
        30,
        NUM_FRAMES as u32,
    );

    let mut stream = Vec::new();
    write_ivf(&mut stream, &header, &frames).unwrap();
    stream
}

fn ivf_stream(hidden_every: Option<u8>) -> Vec<u8> {
    ivf_stream_of_size(WIDTH, HEIGHT, hidden_every)
}

fn expected_crcs_of_size(width: u16, height: u16, hidden_every: Option<u8>) -> Vec<String> {
    (0..NUM_FRAMES)
        .filter(|seed| hidden_every.map_or(true, |n| seed % n != n - 1))
        .map(|seed| format!("{:08x}", crc32fast::hash(&pattern_frame(width, height, seed))))
        .collect()
}

fn expected_crcs(hidden_every: Option<u8>) -> Vec<String> {
    expected_crcs_of_size(WIDTH, HEIGHT, hidden_every)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Surface,
    Copy,
}

/// Decodes `stream` and returns the CRC32 of every frame delivered, in display order.
fn decode_stream(stream: &[u8], mode: Mode, buffers: usize, codec: RawCodec) -> Vec<String> {
    init_logging();

    let mut allocator = HeapBufferAllocator::new();
    let keys = allocator.allocate_many(&geometry(), buffers).unwrap();
    let output_mode = match mode {
        Mode::Surface => OutputMode::Surface(Box::new(allocator.importer())),
        Mode::Copy => OutputMode::Copy(Box::new(allocator.mapper())),
    };
    let config = DecoderConfig::default()
        .with_max_buffers(buffers)
        .with_border(BORDER);
    let mut engine = DecodeEngine::new(config, output_mode, geometry(), keys.clone()).unwrap();
    if mode == Mode::Surface {
        for &key in &keys {
            assert!(engine.mark_render_done(key));
        }
    }
    engine.initialize(&codec, None).unwrap();

    let layout = Yv12Layout::new(
        geometry().stride as usize,
        geometry().height as usize,
        BORDER,
    );
    let mut crcs = Vec::new();
    simple_playback_loop(&mut engine, IvfIterator::new(stream), 2, &mut |frame| {
        assert_eq!(frame.filled_len, layout.size());
        assert_eq!(frame.crop.left, BORDER as u32);
        assert_eq!(frame.crop.top, BORDER as u32);

        let contents = allocator.contents(frame.key).unwrap();
        let i420 = yv12_to_i420(
            &contents,
            &layout,
            frame.crop.width as usize,
            frame.crop.height as usize,
        )
        .unwrap();
        crcs.push(format!("{:08x}", crc32fast::hash(&i420)));
    })
    .unwrap();

    assert_eq!(engine.integrity_failures(), 0);
    engine.shutdown();
    assert_eq!(engine.pool().lock().num_in_flight(), 0);

    crcs
}

#[test]
fn test_copy_mode() {
    let crcs = decode_stream(&ivf_stream(None), Mode::Copy, 4, RawCodec::new());

    assert_eq!(crcs, expected_crcs(None));
}

#[test]
fn test_surface_mode() {
    let crcs = decode_stream(&ivf_stream(None), Mode::Surface, 4, RawCodec::new());

    assert_eq!(crcs, expected_crcs(None));
}

#[test]
fn test_stream_smaller_than_buffers() {
    // 16x8 frames would fit in buffers of 32 lines, the buffers have 64. The chroma planes must
    // still be found where the buffer layout puts them.
    let stream = ivf_stream_of_size(16, 8, None);

    let copy = decode_stream(&stream, Mode::Copy, 4, RawCodec::new());
    let surface = decode_stream(&stream, Mode::Surface, 4, RawCodec::new());

    assert_eq!(copy, expected_crcs_of_size(16, 8, None));
    assert_eq!(surface, copy);
}

#[test]
fn test_both_modes_agree_with_reordering_and_hidden_frames() {
    let stream = ivf_stream(Some(4));
    let codec = RawCodec::new()
        .with_reference_frames(2)
        .with_reorder_depth(2);

    let copy = decode_stream(&stream, Mode::Copy, 8, codec);
    let surface = decode_stream(&stream, Mode::Surface, 8, codec);

    assert_eq!(copy, expected_crcs(Some(4)));
    assert_eq!(copy, surface);
}

#[test]
fn test_copy_mode_leaves_border_untouched() {
    init_logging();

    let mut allocator = HeapBufferAllocator::new();
    let keys = allocator.allocate_many(&geometry(), 3).unwrap();
    let mut engine = DecodeEngine::new(
        DecoderConfig::default().with_border(BORDER),
        OutputMode::Copy(Box::new(allocator.mapper())),
        geometry(),
        keys,
    )
    .unwrap();
    engine.initialize(&RawCodec::new(), Some(1)).unwrap();

    let unit = pack_frame(WIDTH, HEIGHT, true, &vec![0xff; 48 * 30 + 2 * 24 * 15]);
    let frame = match engine.decode(&unit, 0, true).unwrap() {
        DecodeOutcome::Frame(frame) => frame,
        outcome => panic!("unexpected outcome {:?}", outcome),
    };
    assert!(frame.draining);
    assert_eq!(engine.decode(&[], 0, true).unwrap(), DecodeOutcome::EndOfStream);

    let contents = allocator.contents(frame.key).unwrap();
    let stride = geometry().stride as usize;
    for (offset, &byte) in contents[..stride * geometry().height as usize]
        .iter()
        .enumerate()
    {
        let (x, y) = (offset % stride, offset / stride);
        let visible = (BORDER..BORDER + WIDTH as usize).contains(&x)
            && (BORDER..BORDER + HEIGHT as usize).contains(&y);
        assert_eq!(byte == 0xff, visible, "luma texel ({}, {})", x, y);
    }
}
