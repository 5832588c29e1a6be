// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IVF container support. Compressed units are carried in IVF files so streams can be stored,
//! replayed and fuzzed.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use bytes::Buf;

/// Size of the IVF file header.
pub const IVF_FILE_HEADER_SIZE: usize = 32;
/// Size of the header preceding each IVF frame.
pub const IVF_FRAME_HEADER_SIZE: usize = 12;

/// Iterator over IVF packets.
pub struct IvfIterator<'a> {
    data: &'a [u8],
}

impl<'a> IvfIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        // Skip the IVF header entirely.
        let start = IVF_FILE_HEADER_SIZE.min(data.len());

        Self {
            data: &data[start..],
        }
    }
}

impl<'a> Iterator for IvfIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        // Make sure we have a header.
        if self.data.remaining() < IVF_FRAME_HEADER_SIZE {
            return None;
        }

        let len = self.data.get_u32_le() as usize;
        // Skip PTS.
        let _ = self.data.get_u64_le();

        if self.data.remaining() < len {
            self.data = &[];
            return None;
        }

        let (frame, rest) = self.data.split_at(len);
        self.data = rest;

        Some(frame)
    }
}

/// Helper struct for synthesizing and parsing IVF file headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub codec: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub framerate: u32,
    pub timescale: u32,
    pub frame_count: u32,
    pub unused: u32,
}

impl Default for IvfFileHeader {
    fn default() -> Self {
        Self {
            magic: Self::MAGIC,
            version: 0,
            header_size: IVF_FILE_HEADER_SIZE as u16,
            codec: Self::CODEC_RAW,
            width: 320,
            height: 240,
            framerate: 1,
            timescale: 1000,
            frame_count: 1,
            unused: Default::default(),
        }
    }
}

impl IvfFileHeader {
    pub const MAGIC: [u8; 4] = *b"DKIF";
    /// Units of the reference codec in [`crate::backend::raw`].
    pub const CODEC_RAW: [u8; 4] = *b"RAWF";

    pub fn new(codec: [u8; 4], width: u16, height: u16, framerate: u32, frame_count: u32) -> Self {
        let default = Self::default();

        Self {
            codec,
            width,
            height,
            framerate: framerate * default.timescale,
            frame_count,
            ..default
        }
    }

    /// Writes header into writer
    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(self.header_size)?;
        writer.write_all(&self.codec)?;
        writer.write_u16::<LittleEndian>(self.width)?;
        writer.write_u16::<LittleEndian>(self.height)?;
        writer.write_u32::<LittleEndian>(self.framerate)?;
        writer.write_u32::<LittleEndian>(self.timescale)?;
        writer.write_u32::<LittleEndian>(self.frame_count)?;
        writer.write_u32::<LittleEndian>(self.unused)?;

        Ok(())
    }

    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let mut reader = Cursor::new(data);
        let mut header = Self::default();

        let read = |reader: &mut Cursor<&[u8]>, header: &mut Self| -> std::io::Result<()> {
            reader.read_exact(&mut header.magic)?;
            header.version = reader.read_u16::<LittleEndian>()?;
            header.header_size = reader.read_u16::<LittleEndian>()?;
            reader.read_exact(&mut header.codec)?;
            header.width = reader.read_u16::<LittleEndian>()?;
            header.height = reader.read_u16::<LittleEndian>()?;
            header.framerate = reader.read_u32::<LittleEndian>()?;
            header.timescale = reader.read_u32::<LittleEndian>()?;
            header.frame_count = reader.read_u32::<LittleEndian>()?;
            header.unused = reader.read_u32::<LittleEndian>()?;
            Ok(())
        };
        read(&mut reader, &mut header).map_err(|e| format!("truncated IVF header: {}", e))?;

        if header.magic != Self::MAGIC {
            return Err(format!("invalid IVF magic {:?}", header.magic));
        }

        Ok(header)
    }
}

/// Helper struct for synthesizing IVF frame header
pub struct IvfFrameHeader {
    pub frame_size: u32,
    pub timestamp: u64,
}

impl IvfFrameHeader {
    /// Writes header into writer
    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.frame_size)?;
        writer.write_u64::<LittleEndian>(self.timestamp)?;
        Ok(())
    }
}

/// Builds an IVF stream out of `frames`.
pub fn write_ivf<F: AsRef<[u8]>>(
    writer: &mut impl Write,
    header: &IvfFileHeader,
    frames: &[F],
) -> std::io::Result<()> {
    header.write_into(writer)?;
    for (timestamp, frame) in frames.iter().enumerate() {
        let frame = frame.as_ref();
        IvfFrameHeader {
            frame_size: frame.len() as u32,
            timestamp: timestamp as u64,
        }
        .write_into(writer)?;
        writer.write_all(frame)?;
    }

    Ok(())
}
