// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

use native_buffer_decoder::decoder::DecoderConfig;

/// How decoded frames reach the output buffers.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Mode {
    Surface,
    Copy,
}

impl FromStr for Mode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "surface" => Ok(Mode::Surface),
            "copy" => Ok(Mode::Copy),
            _ => Err("unrecognized output mode. Valid values: surface, copy"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Decodes an IVF stream of raw units into a fixed set of output buffers
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input IVF file. Required unless --synthesize is given.
    #[argh(positional)]
    pub input: Option<PathBuf>,

    /// decode a generated stream of this many frames instead of reading an input file
    #[argh(option)]
    pub synthesize: Option<u8>,

    /// width of the generated frames. Default: 320
    #[argh(option, default = "320")]
    pub width: u16,

    /// height of the generated frames. Default: 240
    #[argh(option, default = "240")]
    pub height: u16,

    /// output file to write the decoded frames to, in I420
    #[argh(option)]
    pub output: Option<PathBuf>,

    /// how frames reach the output buffers (surface or copy). Default: copy
    #[argh(option, default = "Mode::Copy")]
    pub mode: Mode,

    /// number of output buffers. Default: 8
    #[argh(option, default = "8")]
    pub buffers: usize,

    /// number of free buffers required before a unit is submitted. Default: 2
    #[argh(option, default = "2")]
    pub min_free_slots: usize,

    /// padding in texels around the visible image. Default: 32
    #[argh(option, default = "32")]
    pub border: usize,

    /// number of decoder threads. Default: one per CPU core
    #[argh(option)]
    pub threads: Option<usize>,

    /// number of frames the codec keeps as reference. Default: 1
    #[argh(option, default = "1")]
    pub reference_frames: usize,

    /// number of frames the codec holds back before output. Default: 0
    #[argh(option, default = "0")]
    pub reorder_depth: usize,

    /// number of frames kept on display before being given back. Default: 1
    #[argh(option, default = "1")]
    pub render_lag: usize,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    pub compute_md5: Option<Md5Computation>,
}

impl Args {
    pub fn decoder_config(&self) -> DecoderConfig {
        let config = DecoderConfig::default()
            .with_max_buffers(self.buffers)
            .with_min_free_slots(self.min_free_slots)
            .with_border(self.border);

        match self.threads {
            Some(threads) => config.with_threads(threads),
            None => config,
        }
    }
}
