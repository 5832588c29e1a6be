// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding session types shared by the engine and the codecs it drives.

pub mod admission;
pub mod engine;
pub mod transfer;

use thiserror::Error;

use crate::decoder::transfer::TransferError;
use crate::video_frame::frame_pool::BufferProvider;
use crate::video_frame::frame_pool::PoolError;
use crate::BufferKey;
use crate::PlaneLayout;
use crate::Rect;
use crate::Resolution;

/// Maximum number of output buffers a session can be configured with. Matches the working set of
/// a 1080p stream.
pub const DEFAULT_MAX_BUFFERS: usize = 17;
/// Padding in texels added around the visible image of every output buffer.
pub const DEFAULT_BORDER: usize = 32;

/// An image completed by a codec session.
///
/// The image lives in the memory of pool slot `slot` and is only valid until the next call to
/// [`CodecSession::decode`], after which the codec may reuse the slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedImage {
    /// Decoded (visible) size of the image.
    pub resolution: Resolution,
    /// Offset of the first visible texel and stride of the Y, U and V planes in the slot memory.
    pub planes: [PlaneLayout; 3],
    pub slot: usize,
    pub key: BufferKey,
    pub timestamp: u64,
}

/// A frame delivered into one of the external buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFrame {
    /// Index of the pool slot, and thus of the external buffer, holding the frame.
    pub slot: usize,
    /// Key of the external buffer holding the frame.
    pub key: BufferKey,
    /// Number of meaningful bytes in the buffer.
    pub filled_len: usize,
    /// Visible region of the frame within the buffer.
    pub crop: Rect,
    pub timestamp: u64,
    /// Whether the frame was emitted after the end of the input stream was signaled.
    pub draining: bool,
}

/// Result of a successful decode or retrieval step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A frame has been delivered and is now owned by the consumer until it calls
    /// [`engine::DecodeEngine::mark_render_done`] with its key.
    Frame(OutputFrame),
    /// The codec is still buffering frames. Retry the retrieval step without resubmitting input.
    Pending,
    /// All the frames of the stream have been delivered.
    EndOfStream,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupt unit: {0}")]
    Corrupt(String),
    #[error("unsupported stream: {0}")]
    Unsupported(String),
    #[error("cannot obtain a frame buffer: {0}")]
    Allocation(#[from] PoolError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Class of a [`DecodeError`], telling the caller how to react to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Setup or usage error. The session cannot proceed.
    Configuration,
    /// Expected steady-state condition. Retry once a buffer has been given back.
    Transient,
    /// The current unit could not be decoded. The session remains usable.
    Data,
    /// The frame has been dropped because the pool and the external buffers disagree, or because
    /// a buffer could not be mapped.
    Integrity,
    /// A notification referred to a buffer the pool does not know about.
    UnknownKey,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("the decoder has not been initialized")]
    NotInitialized,
    #[error("the decoder is already initialized")]
    AlreadyInitialized,
    #[error("failed to open codec session: {0}")]
    CodecInitFailed(#[source] CodecError),
    #[error("non-empty input submitted after the end of stream")]
    InputAfterEndOfStream,
    #[error("bitstream error: {0}")]
    Bitstream(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Codec(CodecError),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::NotInitialized
            | DecodeError::AlreadyInitialized
            | DecodeError::CodecInitFailed(_)
            | DecodeError::InputAfterEndOfStream => ErrorKind::Configuration,
            DecodeError::Bitstream(_) | DecodeError::Codec(_) => ErrorKind::Data,
            DecodeError::Pool(e) => match e {
                PoolError::NoBufferAvailable => ErrorKind::Transient,
                PoolError::SizeMismatch { .. } => ErrorKind::Data,
                PoolError::UnknownBuffer(_) => ErrorKind::UnknownKey,
                PoolError::NotAcquired(_) | PoolError::MapFailed { .. } => ErrorKind::Integrity,
                PoolError::CapacityExceeded { .. }
                | PoolError::AlreadyInitialized
                | PoolError::DuplicateBuffer(_)
                | PoolError::SurfaceImportFailed { .. } => ErrorKind::Configuration,
            },
            DecodeError::Transfer(_) => ErrorKind::Integrity,
        }
    }
}

impl From<CodecError> for DecodeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Corrupt(reason) => DecodeError::Bitstream(reason),
            CodecError::Allocation(e) => DecodeError::Pool(e),
            e => DecodeError::Codec(e),
        }
    }
}

/// Configuration of a decoding session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Capacity of the frame pool.
    pub max_buffers: usize,
    /// Number of free slots required before new work is accepted.
    pub min_free_slots: usize,
    /// Padding in texels around the visible image of the output buffers.
    pub border: usize,
    /// Number of codec threads. Derived from the number of CPU cores if unset.
    pub threads: Option<usize>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_buffers: DEFAULT_MAX_BUFFERS,
            min_free_slots: admission::DEFAULT_MIN_FREE_SLOTS,
            border: DEFAULT_BORDER,
            threads: None,
        }
    }
}

impl DecoderConfig {
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    pub fn with_min_free_slots(mut self, min_free_slots: usize) -> Self {
        self.min_free_slots = min_free_slots;
        self
    }

    pub fn with_border(mut self, border: usize) -> Self {
        self.border = border;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
}

/// Parameters a codec session is opened with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub threads: usize,
    pub border: usize,
}

/// An open session of a block-based decoder library.
///
/// Sessions obtain the buffers they decode into from the [`BufferProvider`] they were opened
/// with, and give them back once they no longer need them as output or reference.
pub trait CodecSession {
    /// Decodes one compressed unit. Completed images become available through
    /// [`CodecSession::next_image`].
    fn decode(&mut self, unit: &[u8], timestamp: u64) -> Result<(), CodecError>;

    /// Signals that no more input will follow, making all the buffered images available.
    fn flush(&mut self) -> Result<(), CodecError>;

    /// Returns the next completed image in output order, if any.
    fn next_image(&mut self) -> Option<DecodedImage>;
}

pub trait Codec {
    fn open(
        &self,
        config: &SessionConfig,
        provider: Box<dyn BufferProvider>,
    ) -> Result<Box<dyn CodecSession>, CodecError>;
}
