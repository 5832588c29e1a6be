// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference codec decoding uncompressed planar units.
//!
//! Each unit is an 8 bytes header followed by a tightly packed I420 frame:
//!
//! | Offset | Size | Field                        |
//! |--------|------|------------------------------|
//! | 0      | 2    | width, little endian         |
//! | 2      | 2    | height, little endian        |
//! | 4      | 1    | flags, bit 0 is "show frame" |
//! | 5      | 3    | reserved                     |
//!
//! While there is no actual compression, sessions manage their buffers the way a block-based
//! decoder does: every decoded frame stays referenced for a number of subsequent decodes, hidden
//! frames are decoded and referenced but never output, and shown frames can be held back to
//! emulate reordering. Buffers are only given back to the provider once they are neither
//! referenced nor waiting to be output.

use std::collections::VecDeque;
use std::io::Write;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use byteorder::WriteBytesExt;

use crate::decoder::Codec;
use crate::decoder::CodecError;
use crate::decoder::CodecSession;
use crate::decoder::DecodedImage;
use crate::decoder::SessionConfig;
use crate::image_processing::chroma_dimensions;
use crate::image_processing::copy_plane;
use crate::image_processing::i420_frame_size;
use crate::image_processing::PlaneCopyError;
use crate::image_processing::Yv12Layout;
use crate::utils::align_up;
use crate::video_frame::frame_pool::BufferProvider;
use crate::video_frame::frame_pool::FrameBuffer;
use crate::video_frame::frame_pool::PoolError;
use crate::video_frame::U_PLANE;
use crate::video_frame::V_PLANE;
use crate::video_frame::Y_PLANE;
use crate::PlaneLayout;
use crate::Resolution;

pub const HEADER_SIZE: usize = 8;

const FLAG_SHOW_FRAME: u8 = 1 << 0;

/// Heights of the decoded buffers are aligned to this value.
const HEIGHT_ALIGNMENT: usize = 32;
const STRIDE_ALIGNMENT: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawFrameHeader {
    pub width: u16,
    pub height: u16,
    pub show_frame: bool,
}

impl RawFrameHeader {
    pub fn parse(unit: &[u8]) -> Result<Self, CodecError> {
        if unit.len() < HEADER_SIZE {
            return Err(CodecError::Corrupt(format!(
                "unit of {} bytes is shorter than its header",
                unit.len()
            )));
        }

        let header = Self {
            width: LittleEndian::read_u16(&unit[0..2]),
            height: LittleEndian::read_u16(&unit[2..4]),
            show_frame: unit[4] & FLAG_SHOW_FRAME != 0,
        };
        if header.width == 0 || header.height == 0 {
            return Err(CodecError::Corrupt(format!(
                "invalid frame size {}x{}",
                header.width, header.height
            )));
        }

        Ok(header)
    }

    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_u16::<LittleEndian>(self.width)?;
        writer.write_u16::<LittleEndian>(self.height)?;
        writer.write_u8(if self.show_frame { FLAG_SHOW_FRAME } else { 0 })?;
        writer.write_all(&[0u8; 3])?;

        Ok(())
    }

    /// Size of the I420 payload following the header.
    pub fn payload_size(&self) -> usize {
        i420_frame_size(self.width as usize, self.height as usize)
    }
}

/// Builds a unit out of the I420 frame `i420`.
pub fn pack_frame(width: u16, height: u16, show_frame: bool, i420: &[u8]) -> Vec<u8> {
    let mut unit = Vec::with_capacity(HEADER_SIZE + i420.len());
    let header = RawFrameHeader {
        width,
        height,
        show_frame,
    };
    // Writing into a Vec cannot fail.
    let _ = header.write_into(&mut unit);
    unit.extend_from_slice(i420);

    unit
}

/// Returns an I420 frame filled with a pattern that differs for every `seed`.
pub fn pattern_frame(width: u16, height: u16, seed: u8) -> Vec<u8> {
    let (width, height) = (width as usize, height as usize);
    let (uv_width, uv_height) = chroma_dimensions(width, height);
    let mut frame = Vec::with_capacity(i420_frame_size(width, height));

    for y in 0..height {
        frame.extend((0..width).map(|x| (x + y) as u8 ^ seed));
    }
    for plane_seed in [seed.wrapping_add(0x40), seed.wrapping_add(0x80)] {
        for y in 0..uv_height {
            frame.extend((0..uv_width).map(|x| (x * 2 + y) as u8 ^ plane_seed));
        }
    }

    frame
}

/// Codec decoding the units described in the module documentation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawCodec {
    reference_frames: usize,
    reorder_depth: usize,
}

impl Default for RawCodec {
    fn default() -> Self {
        Self {
            reference_frames: 1,
            reorder_depth: 0,
        }
    }
}

impl RawCodec {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of decodes a frame stays referenced for, at least one.
    pub fn with_reference_frames(mut self, reference_frames: usize) -> Self {
        self.reference_frames = reference_frames.max(1);
        self
    }

    /// Number of shown frames held back before being output.
    pub fn with_reorder_depth(mut self, reorder_depth: usize) -> Self {
        self.reorder_depth = reorder_depth;
        self
    }

    /// Maximum number of buffers a session may hold at the same time, including the one being
    /// decoded into.
    pub fn max_buffers_held(&self) -> usize {
        self.reference_frames + self.reorder_depth + 1
    }
}

impl Codec for RawCodec {
    fn open(
        &self,
        config: &SessionConfig,
        provider: Box<dyn BufferProvider>,
    ) -> Result<Box<dyn CodecSession>, CodecError> {
        if config.threads == 0 {
            return Err(CodecError::Unsupported(
                "a session needs at least one thread".into(),
            ));
        }
        log::debug!(
            "opening raw session: {} threads, border {}, {} reference frames, reorder depth {}",
            config.threads,
            config.border,
            self.reference_frames,
            self.reorder_depth
        );

        Ok(Box::new(RawSession {
            provider,
            border: config.border,
            reference_frames: self.reference_frames,
            reorder_depth: self.reorder_depth,
            held: Vec::new(),
            references: VecDeque::new(),
            reorder_queue: VecDeque::new(),
            ready: VecDeque::new(),
        }))
    }
}

struct RawSession {
    provider: Box<dyn BufferProvider>,
    border: usize,
    reference_frames: usize,
    reorder_depth: usize,
    /// All the buffers obtained from the provider and not given back yet.
    held: Vec<FrameBuffer>,
    /// Buffers referenced by upcoming frames, oldest first.
    references: VecDeque<FrameBuffer>,
    /// Shown frames held back for reordering.
    reorder_queue: VecDeque<DecodedImage>,
    /// Frames ready to be output.
    ready: VecDeque<DecodedImage>,
}

impl RawSession {
    fn is_needed(&self, buffer: &FrameBuffer) -> bool {
        self.references.contains(buffer)
            || self
                .reorder_queue
                .iter()
                .chain(self.ready.iter())
                .any(|image| image.slot == buffer.index)
    }

    /// Gives back the buffers that are neither referenced nor waiting to be output.
    fn free_unused_buffers(&mut self) {
        let (needed, unused): (Vec<FrameBuffer>, Vec<FrameBuffer>) = self
            .held
            .iter()
            .copied()
            .partition(|buffer| self.is_needed(buffer));

        for buffer in unused {
            if let Err(e) = self.provider.free(&buffer) {
                log::warn!("failed to free buffer {}: {}", buffer.key, e);
            }
        }
        self.held = needed;
    }

    fn write_frame(
        &mut self,
        buffer: &FrameBuffer,
        layout: &Yv12Layout,
        payload: &[u8],
        width: usize,
        height: usize,
    ) -> Result<(), CodecError> {
        let (uv_width, uv_height) = chroma_dimensions(width, height);
        let y_size = width * height;
        let uv_size = uv_width * uv_height;
        let planes = [
            (Y_PLANE, 0, width, width, height),
            (U_PLANE, y_size, uv_width, uv_width, uv_height),
            (V_PLANE, y_size + uv_size, uv_width, uv_width, uv_height),
        ];

        let mut result: Result<(), PlaneCopyError> = Ok(());
        self.provider.write(buffer, &mut |mem| {
            result = planes.iter().try_for_each(
                |&(plane, offset, stride, plane_width, plane_height)| {
                    copy_plane(
                        payload,
                        PlaneLayout { offset, stride },
                        mem,
                        layout.plane(plane),
                        layout.plane_region(plane).end,
                        plane_width,
                        plane_height,
                    )
                },
            );
        })?;

        result.map_err(|e| CodecError::Other(e.into()))
    }
}

impl CodecSession for RawSession {
    fn decode(&mut self, unit: &[u8], timestamp: u64) -> Result<(), CodecError> {
        // Images returned by `next_image` are only valid until this point.
        self.free_unused_buffers();

        let header = RawFrameHeader::parse(unit)?;
        let payload = &unit[HEADER_SIZE..];
        if payload.len() != header.payload_size() {
            return Err(CodecError::Corrupt(format!(
                "{}x{} frame needs {} bytes of payload, got {}",
                header.width,
                header.height,
                header.payload_size(),
                payload.len()
            )));
        }

        let width = header.width as usize;
        let height = header.height as usize;
        let coded_height = align_up(height + 2 * self.border, HEIGHT_ALIGNMENT);
        let min_stride = align_up(width + 2 * self.border, STRIDE_ALIGNMENT);
        let min_size = Yv12Layout::new(min_stride, coded_height, 0).size();

        let buffer = self.provider.allocate(min_size)?;
        // Frames smaller than the buffer still use the buffer's layout, which is where consumers
        // of in-place frames look for the planes.
        let layout = Yv12Layout::new(buffer.stride, buffer.height, self.border);
        let checked = if layout.size() > buffer.size {
            Err(CodecError::Allocation(PoolError::SizeMismatch {
                requested: layout.size(),
                available: buffer.size,
            }))
        } else {
            layout
                .check_visible_width(width)
                .and_then(|()| layout.check_visible_height(height))
                .map_err(|e| CodecError::Other(e.into()))
        };
        let written =
            checked.and_then(|()| self.write_frame(&buffer, &layout, payload, width, height));
        if let Err(e) = written {
            if let Err(free_err) = self.provider.free(&buffer) {
                log::warn!("failed to free buffer {}: {}", buffer.key, free_err);
            }
            return Err(e);
        }

        self.held.push(buffer);
        self.references.push_back(buffer);
        while self.references.len() > self.reference_frames {
            self.references.pop_front();
        }

        if header.show_frame {
            self.reorder_queue.push_back(DecodedImage {
                resolution: Resolution::from((header.width as u32, header.height as u32)),
                planes: layout.planes(),
                slot: buffer.index,
                key: buffer.key,
                timestamp,
            });
            while self.reorder_queue.len() > self.reorder_depth {
                if let Some(image) = self.reorder_queue.pop_front() {
                    self.ready.push_back(image);
                }
            }
        } else {
            log::trace!("hidden frame decoded into buffer {}", buffer.key);
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.ready.extend(self.reorder_queue.drain(..));

        Ok(())
    }

    fn next_image(&mut self) -> Option<DecodedImage> {
        self.ready.pop_front()
    }
}

impl Drop for RawSession {
    fn drop(&mut self) {
        for buffer in self.held.drain(..) {
            if let Err(e) = self.provider.free(&buffer) {
                log::warn!("failed to free buffer {} on close: {}", buffer.key, e);
            }
        }
    }
}
