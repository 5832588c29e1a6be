// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! nbdec, a simple decoder program delivering frames into a fixed set of output buffers. Capable
//! of computing MD5 checksums of the decoded frames and writing them to a file.

use std::fs::File;
use std::io::Read;
use std::io::Write;

use anyhow::Context;

use native_buffer_decoder::backend::raw::pack_frame;
use native_buffer_decoder::backend::raw::pattern_frame;
use native_buffer_decoder::backend::raw::RawCodec;
use native_buffer_decoder::bitstream_utils::IvfFileHeader;
use native_buffer_decoder::bitstream_utils::IvfIterator;
use native_buffer_decoder::decoder::engine::DecodeEngine;
use native_buffer_decoder::decoder::transfer::OutputMode;
use native_buffer_decoder::image_processing::yv12_to_i420;
use native_buffer_decoder::image_processing::Yv12Layout;
use native_buffer_decoder::utils::simple_playback_loop;
use native_buffer_decoder::video_frame::heap_buffer::HeapBufferAllocator;
use native_buffer_decoder::video_frame::BufferGeometry;
use native_buffer_decoder::Resolution;

use crate::util::Args;
use crate::util::Md5Computation;
use crate::util::Mode;

mod util;

/// Returns the units to decode and the resolution of the stream.
fn load_stream(args: &Args) -> anyhow::Result<(Vec<Vec<u8>>, Resolution)> {
    if let Some(count) = args.synthesize {
        let units = (0..count)
            .map(|seed| {
                pack_frame(
                    args.width,
                    args.height,
                    true,
                    &pattern_frame(args.width, args.height, seed),
                )
            })
            .collect();
        return Ok((
            units,
            Resolution::from((args.width as u32, args.height as u32)),
        ));
    }

    let path = args
        .input
        .as_ref()
        .context("an input file is required unless --synthesize is used")?;
    let mut input = Vec::new();
    File::open(path)
        .with_context(|| format!("error opening {}", path.display()))?
        .read_to_end(&mut input)
        .context("error reading input file")?;

    let header = IvfFileHeader::parse(&input).map_err(anyhow::Error::msg)?;
    if header.codec != IvfFileHeader::CODEC_RAW {
        anyhow::bail!("unsupported codec {:?}", header.codec);
    }
    let units = IvfIterator::new(&input).map(|unit| unit.to_vec()).collect();

    Ok((
        units,
        Resolution::from((header.width as u32, header.height as u32)),
    ))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let (units, resolution) = load_stream(&args)?;

    let geometry = BufferGeometry::for_stream(resolution, args.border);
    let mut allocator = HeapBufferAllocator::new();
    let keys = allocator
        .allocate_many(&geometry, args.buffers)
        .map_err(anyhow::Error::msg)?;

    let mode = match args.mode {
        Mode::Surface => OutputMode::Surface(Box::new(allocator.importer())),
        Mode::Copy => OutputMode::Copy(Box::new(allocator.mapper())),
    };
    let mut engine = DecodeEngine::new(args.decoder_config(), mode, geometry, keys.clone())?;
    if args.mode == Mode::Surface {
        // Hand all the buffers over to the decoder.
        for &key in &keys {
            engine.mark_render_done(key);
        }
    }

    let codec = RawCodec::new()
        .with_reference_frames(args.reference_frames)
        .with_reorder_depth(args.reorder_depth);
    engine.initialize(&codec, args.threads)?;

    let mut output = args
        .output
        .as_ref()
        .map(File::create)
        .transpose()
        .context("error creating output file")?;
    let layout = Yv12Layout::new(geometry.stride as usize, geometry.height as usize, args.border);
    let mut stream_md5 = md5::Context::new();
    let mut frame_count = 0usize;
    let mut error = None;

    simple_playback_loop(&mut engine, units.iter(), args.render_lag, &mut |frame| {
        if error.is_some() {
            return;
        }

        let result = allocator
            .contents(frame.key)
            .with_context(|| format!("unknown output buffer {}", frame.key))
            .and_then(|contents| {
                yv12_to_i420(
                    &contents,
                    &layout,
                    frame.crop.width as usize,
                    frame.crop.height as usize,
                )
                .context("failed to read decoded frame")
            })
            .and_then(|i420| {
                if let Some(output) = &mut output {
                    output.write_all(&i420).context("error writing output")?;
                }
                Ok(i420)
            });

        match result {
            Ok(i420) => {
                match args.compute_md5 {
                    Some(Md5Computation::Frame) => println!("{:x}", md5::compute(&i420)),
                    Some(Md5Computation::Stream) => stream_md5.consume(&i420),
                    None => (),
                }
                frame_count += 1;
            }
            Err(e) => error = Some(e),
        }
    })?;

    if let Some(e) = error {
        return Err(e);
    }
    if args.compute_md5 == Some(Md5Computation::Stream) {
        println!("{:x}", stream_md5.compute());
    }

    log::info!(
        "decoded {} frames, {} dropped",
        frame_count,
        engine.integrity_failures()
    );

    Ok(())
}
