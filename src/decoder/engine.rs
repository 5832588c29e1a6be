// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode engine driving a codec session over a pool of external buffers.
//!
//! The engine owns the codec session, feeds it compressed units, and turns the images it completes
//! into [`OutputFrame`]s delivered into the external buffers. End of stream is tracked separately
//! for input and output: once the input end of stream has been seen the engine is draining, and
//! keeps emitting the frames still buffered in the codec until it can report the output end of
//! stream.

use crate::decoder::admission::AdmissionGate;
use crate::decoder::transfer::CopyTransfer;
use crate::decoder::transfer::FrameTransfer;
use crate::decoder::transfer::OutputMode;
use crate::decoder::transfer::SurfaceTransfer;
use crate::decoder::Codec;
use crate::decoder::CodecSession;
use crate::decoder::DecodeError;
use crate::decoder::DecodeOutcome;
use crate::decoder::DecoderConfig;
use crate::decoder::SessionConfig;
use crate::utils::cpu_core_count;
use crate::video_frame::frame_pool::FramePool;
use crate::video_frame::frame_pool::SharedFramePool;
use crate::video_frame::frame_pool::SlotSource;
use crate::video_frame::BufferGeometry;
use crate::BufferKey;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Accepting input.
    Running,
    /// Input end of stream seen, frames still buffered in the codec are being emitted.
    Draining,
    /// Output end of stream emitted.
    Drained,
}

pub struct DecodeEngine {
    config: DecoderConfig,
    pool: SharedFramePool,
    /// External buffers, indexed by slot.
    keys: Vec<BufferKey>,
    transfer: Box<dyn FrameTransfer>,
    gate: AdmissionGate,
    session: Option<Box<dyn CodecSession>>,
    state: StreamState,
    integrity_failures: usize,
}

impl DecodeEngine {
    /// Creates an engine delivering frames into the external buffers `keys`, all of `geometry`.
    ///
    /// In surface mode the buffers are imported as surfaces right away, in copy mode the pool
    /// allocates its scratch memory.
    pub fn new(
        config: DecoderConfig,
        mode: OutputMode,
        geometry: BufferGeometry,
        keys: Vec<BufferKey>,
    ) -> Result<Self, DecodeError> {
        let mut pool = FramePool::new(config.max_buffers);
        let transfer: Box<dyn FrameTransfer> = match mode {
            OutputMode::Surface(mut importer) => {
                pool.initialize(geometry, &keys, SlotSource::Surface(importer.as_mut()))?;
                Box::new(SurfaceTransfer::new(&geometry, config.border))
            }
            OutputMode::Copy(mapper) => {
                pool.initialize(geometry, &keys, SlotSource::Scratch)?;
                Box::new(CopyTransfer::new(mapper, &geometry, config.border))
            }
        };

        Ok(Self {
            gate: AdmissionGate::new(config.min_free_slots),
            config,
            pool: SharedFramePool::new(pool),
            keys,
            transfer,
            session: None,
            state: StreamState::Running,
            integrity_failures: 0,
        })
    }

    /// Opens a session of `codec` using `thread_hint` threads, or the configured number of threads,
    /// or one thread per CPU core.
    pub fn initialize(
        &mut self,
        codec: &dyn Codec,
        thread_hint: Option<usize>,
    ) -> Result<(), DecodeError> {
        if self.session.is_some() {
            return Err(DecodeError::AlreadyInitialized);
        }

        let threads = thread_hint
            .or(self.config.threads)
            .unwrap_or_else(cpu_core_count)
            .max(1);
        let session_config = SessionConfig {
            threads,
            border: self.config.border,
        };
        let session = codec
            .open(&session_config, Box::new(self.pool.clone()))
            .map_err(|e| {
                log::error!("failed to open codec session: {}", e);
                DecodeError::CodecInitFailed(e)
            })?;

        log::info!(
            "decode session opened with {} threads over {} buffers",
            threads,
            self.keys.len()
        );
        self.session = Some(session);
        self.state = StreamState::Running;

        Ok(())
    }

    /// Submits `unit` for decoding and tries to retrieve a frame.
    ///
    /// An empty `unit` with `end_of_stream` set does not reach the codec: it starts draining, and
    /// so does a non-empty unit with `end_of_stream` set once it has been decoded. While draining,
    /// calls must carry an empty unit and each of them emits one of the frames left in the codec,
    /// until [`DecodeOutcome::EndOfStream`] is returned.
    pub fn decode(
        &mut self,
        unit: &[u8],
        timestamp: u64,
        end_of_stream: bool,
    ) -> Result<DecodeOutcome, DecodeError> {
        let session = self.session.as_mut().ok_or(DecodeError::NotInitialized)?;

        match self.state {
            StreamState::Running => (),
            StreamState::Draining | StreamState::Drained if !unit.is_empty() => {
                log::warn!("{} bytes submitted after the end of stream", unit.len());
                return Err(DecodeError::InputAfterEndOfStream);
            }
            StreamState::Draining | StreamState::Drained => return self.retrieve(),
        }

        if !unit.is_empty() {
            session.decode(unit, timestamp).map_err(|e| {
                let e = DecodeError::from(e);
                match e {
                    DecodeError::Pool(_) => log::debug!("unit {} not decoded: {}", timestamp, e),
                    _ => log::warn!("failed to decode unit {}: {}", timestamp, e),
                }
                e
            })?;
        }

        if end_of_stream {
            session.flush()?;
            log::debug!("input end of stream, draining");
            self.state = StreamState::Draining;
        }

        self.retrieve()
    }

    /// Retrieves the next frame completed by the codec without submitting new input.
    ///
    /// Use it after [`DecodeOutcome::Pending`], or to collect the other frames a decode call may
    /// have completed.
    pub fn retrieve(&mut self) -> Result<DecodeOutcome, DecodeError> {
        let session = self.session.as_mut().ok_or(DecodeError::NotInitialized)?;
        if self.state == StreamState::Drained {
            return Ok(DecodeOutcome::EndOfStream);
        }

        let image = match session.next_image() {
            Some(image) => image,
            None if self.state == StreamState::Draining => {
                log::info!("output end of stream");
                self.state = StreamState::Drained;
                return Ok(DecodeOutcome::EndOfStream);
            }
            None => return Ok(DecodeOutcome::Pending),
        };

        let mut pool = self.pool.lock();
        match self.transfer.transfer(&pool, &self.keys, &image) {
            Ok(mut frame) => {
                pool.mark_delivered(image.slot);
                frame.draining = self.state == StreamState::Draining;
                log::trace!("frame {} delivered in slot {}", frame.timestamp, frame.slot);

                Ok(DecodeOutcome::Frame(frame))
            }
            Err(e) => {
                self.integrity_failures += 1;
                log::error!(
                    "dropping frame {} from slot {}: {} ({} failures so far)",
                    image.timestamp,
                    image.slot,
                    e,
                    self.integrity_failures
                );

                Err(e.into())
            }
        }
    }

    /// Whether the input end of stream must be held by the caller and offered again, with an empty
    /// payload, until the output end of stream has been emitted.
    pub fn input_retained(&self) -> bool {
        self.state == StreamState::Draining
    }

    pub fn stream_state(&self) -> StreamState {
        self.state
    }

    /// Records that the consumer is done with the frame in buffer `key`. Returns `false` if `key`
    /// is not one of the session's buffers.
    pub fn mark_render_done(&mut self, key: BufferKey) -> bool {
        self.pool.lock().mark_render_done(key)
    }

    /// Whether enough buffers are free to accept another decode request.
    pub fn can_accept_more_work(&self) -> bool {
        self.gate.can_accept_more_work(&self.pool.lock())
    }

    pub fn pool(&self) -> &SharedFramePool {
        &self.pool
    }

    /// External buffers of the session, indexed by slot.
    pub fn keys(&self) -> &[BufferKey] {
        &self.keys
    }

    /// Number of frames dropped because they could not be delivered.
    pub fn integrity_failures(&self) -> usize {
        self.integrity_failures
    }

    /// Closes the codec session. Does nothing if no session is open.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session);
            log::info!(
                "decode session closed, {} buffers still held by the decoder",
                self.pool.lock().num_in_flight()
            );
        }
    }
}

impl Drop for DecodeEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::raw::pack_frame;
    use crate::backend::raw::pattern_frame;
    use crate::backend::raw::RawCodec;
    use crate::decoder::CodecError;
    use crate::decoder::ErrorKind;
    use crate::decoder::OutputFrame;
    use crate::video_frame::frame_pool::BufferProvider;
    use crate::video_frame::frame_pool::PoolError;
    use crate::video_frame::heap_buffer::HeapBufferAllocator;
    use crate::Resolution;

    const BORDER: usize = 8;

    fn geometry() -> BufferGeometry {
        BufferGeometry::for_stream(Resolution::from((16, 16)), BORDER)
    }

    fn unit(seed: u8) -> Vec<u8> {
        pack_frame(16, 16, true, &pattern_frame(16, 16, seed))
    }

    fn copy_engine(buffers: usize, codec: RawCodec) -> (DecodeEngine, HeapBufferAllocator) {
        let mut allocator = HeapBufferAllocator::new();
        let keys = allocator.allocate_many(&geometry(), buffers).unwrap();
        let config = DecoderConfig::default()
            .with_border(BORDER)
            .with_max_buffers(buffers);
        let mut engine = DecodeEngine::new(
            config,
            OutputMode::Copy(Box::new(allocator.mapper())),
            geometry(),
            keys,
        )
        .unwrap();
        engine.initialize(&codec, Some(1)).unwrap();

        (engine, allocator)
    }

    fn expect_frame(outcome: DecodeOutcome) -> OutputFrame {
        match outcome {
            DecodeOutcome::Frame(frame) => frame,
            outcome => panic!("expected a frame, got {:?}", outcome),
        }
    }

    #[test]
    fn test_not_initialized() {
        let mut allocator = HeapBufferAllocator::new();
        let keys = allocator.allocate_many(&geometry(), 2).unwrap();
        let mut engine = DecodeEngine::new(
            DecoderConfig::default().with_border(BORDER),
            OutputMode::Copy(Box::new(allocator.mapper())),
            geometry(),
            keys,
        )
        .unwrap();

        assert!(matches!(
            engine.decode(&unit(0), 0, false),
            Err(DecodeError::NotInitialized)
        ));
        engine.initialize(&RawCodec::new(), None).unwrap();
        assert!(matches!(
            engine.initialize(&RawCodec::new(), None),
            Err(DecodeError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_decode_delivers_frame() {
        let (mut engine, _allocator) = copy_engine(4, RawCodec::new());

        let frame = expect_frame(engine.decode(&unit(1), 5, false).unwrap());
        assert_eq!(frame.timestamp, 5);
        assert_eq!(frame.slot, 0);
        assert_eq!(frame.key, engine.keys()[0]);
        assert!(!frame.draining);
        assert_eq!(frame.crop.left, BORDER as u32);
        assert_eq!(frame.crop.width, 16);

        // Delivered frames belong to the consumer until it is done with them.
        let pool = engine.pool().lock();
        assert!(!pool.slot(0).unwrap().render_done());
        drop(pool);
        assert_eq!(engine.retrieve().unwrap(), DecodeOutcome::Pending);
    }

    #[test]
    fn test_pending_while_codec_buffers() {
        let (mut engine, _allocator) = copy_engine(6, RawCodec::new().with_reorder_depth(1));

        assert_eq!(engine.decode(&unit(0), 0, false).unwrap(), DecodeOutcome::Pending);
        assert_eq!(engine.retrieve().unwrap(), DecodeOutcome::Pending);
        assert!(!engine.input_retained());

        let frame = expect_frame(engine.decode(&unit(1), 1, false).unwrap());
        assert_eq!(frame.timestamp, 0);
    }

    #[test]
    fn test_drain_emits_buffered_frames() {
        let (mut engine, _allocator) = copy_engine(8, RawCodec::new().with_reorder_depth(3));

        for timestamp in 0..3 {
            assert_eq!(
                engine.decode(&unit(timestamp as u8), timestamp, false).unwrap(),
                DecodeOutcome::Pending
            );
        }

        // Empty end of stream input: the codec is not fed but flushed, and drain starts at once.
        let mut drained = vec![expect_frame(engine.decode(&[], 3, true).unwrap())];
        assert!(engine.input_retained());
        assert!(matches!(
            engine.decode(&unit(9), 9, false),
            Err(DecodeError::InputAfterEndOfStream)
        ));

        loop {
            match engine.decode(&[], 3, true).unwrap() {
                DecodeOutcome::Frame(frame) => drained.push(frame),
                DecodeOutcome::EndOfStream => break,
                DecodeOutcome::Pending => panic!("pending while draining"),
            }
        }

        assert_eq!(
            drained.iter().map(|f| f.timestamp).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(drained.iter().all(|f| f.draining));
        assert!(!engine.input_retained());
        assert_eq!(engine.stream_state(), StreamState::Drained);
        assert_eq!(engine.decode(&[], 3, true).unwrap(), DecodeOutcome::EndOfStream);
    }

    #[test]
    fn test_end_of_stream_with_nothing_buffered() {
        let (mut engine, _allocator) = copy_engine(4, RawCodec::new());

        expect_frame(engine.decode(&unit(0), 0, false).unwrap());
        assert_eq!(engine.decode(&[], 1, true).unwrap(), DecodeOutcome::EndOfStream);
        assert!(!engine.input_retained());
    }

    #[test]
    fn test_end_of_stream_on_last_unit() {
        let (mut engine, _allocator) = copy_engine(6, RawCodec::new().with_reorder_depth(1));

        assert_eq!(engine.decode(&unit(0), 0, false).unwrap(), DecodeOutcome::Pending);
        let frame = expect_frame(engine.decode(&unit(1), 1, true).unwrap());
        assert_eq!(frame.timestamp, 0);
        assert!(frame.draining);

        let frame = expect_frame(engine.decode(&[], 1, true).unwrap());
        assert_eq!(frame.timestamp, 1);
        assert_eq!(engine.decode(&[], 1, true).unwrap(), DecodeOutcome::EndOfStream);
    }

    #[test]
    fn test_corrupt_unit_keeps_session_usable() {
        let (mut engine, _allocator) = copy_engine(4, RawCodec::new());

        let err = engine.decode(&[0, 1, 2], 0, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);

        expect_frame(engine.decode(&unit(1), 1, false).unwrap());
    }

    #[test]
    fn test_admission_and_backpressure() {
        let (mut engine, _allocator) = copy_engine(3, RawCodec::new());
        assert!(engine.can_accept_more_work());

        let first = expect_frame(engine.decode(&unit(0), 0, false).unwrap());
        // Slot 0 is held by the consumer and referenced by the codec.
        assert!(engine.can_accept_more_work());

        let second = expect_frame(engine.decode(&unit(1), 1, false).unwrap());
        assert!(!engine.can_accept_more_work());

        // Slot 0 is given back by the codec on this decode, but still displayed.
        let third = expect_frame(engine.decode(&unit(2), 2, false).unwrap());
        assert_eq!(third.slot, 2);
        let err = engine.decode(&unit(3), 3, false).unwrap_err();
        assert!(matches!(err, DecodeError::Pool(PoolError::NoBufferAvailable)));
        assert_eq!(err.kind(), ErrorKind::Transient);

        assert!(engine.mark_render_done(first.key));
        assert!(engine.mark_render_done(second.key));
        assert!(!engine.mark_render_done(BufferKey(0xdead)));
        assert!(engine.can_accept_more_work());

        let fourth = expect_frame(engine.decode(&unit(3), 3, false).unwrap());
        assert_eq!(fourth.slot, 0);
    }

    #[test]
    fn test_surface_mode_decodes_in_place() {
        let mut allocator = HeapBufferAllocator::new();
        let keys = allocator.allocate_many(&geometry(), 3).unwrap();
        let mut engine = DecodeEngine::new(
            DecoderConfig::default().with_border(BORDER),
            OutputMode::Surface(Box::new(allocator.importer())),
            geometry(),
            keys.clone(),
        )
        .unwrap();
        engine.initialize(&RawCodec::new(), Some(2)).unwrap();

        // The external buffers start in the consumer's hands.
        assert!(matches!(
            engine.decode(&unit(0), 0, false),
            Err(DecodeError::Pool(PoolError::NoBufferAvailable))
        ));
        for &key in &keys {
            engine.mark_render_done(key);
        }

        let frame = expect_frame(engine.decode(&unit(7), 0, false).unwrap());
        assert_eq!(frame.key, keys[0]);

        let layout = crate::image_processing::Yv12Layout::new(
            geometry().stride as usize,
            geometry().height as usize,
            BORDER,
        );
        let contents = allocator.contents(frame.key).unwrap();
        assert_eq!(
            crate::image_processing::yv12_to_i420(&contents, &layout, 16, 16).unwrap(),
            pattern_frame(16, 16, 7)
        );
    }

    #[test]
    fn test_frames_smaller_than_buffers() {
        // 80x96 buffers with a stride of 96, receiving 16x16 frames.
        let large = BufferGeometry::for_stream(Resolution::from((64, 64)), BORDER);
        let layout = crate::image_processing::Yv12Layout::new(
            large.stride as usize,
            large.height as usize,
            BORDER,
        );

        for surface in [false, true] {
            let mut allocator = HeapBufferAllocator::new();
            let keys = allocator.allocate_many(&large, 2).unwrap();
            let mode = if surface {
                OutputMode::Surface(Box::new(allocator.importer()))
            } else {
                OutputMode::Copy(Box::new(allocator.mapper()))
            };
            let mut engine = DecodeEngine::new(
                DecoderConfig::default().with_border(BORDER),
                mode,
                large,
                keys.clone(),
            )
            .unwrap();
            for &key in &keys {
                engine.mark_render_done(key);
            }
            engine.initialize(&RawCodec::new(), Some(1)).unwrap();

            let frame = expect_frame(engine.decode(&unit(9), 0, false).unwrap());
            assert_eq!(frame.filled_len, layout.size());
            assert_eq!(frame.crop.width, 16);
            assert_eq!(frame.crop.height, 16);

            let contents = allocator.contents(frame.key).unwrap();
            assert_eq!(
                crate::image_processing::yv12_to_i420(&contents, &layout, 16, 16).unwrap(),
                pattern_frame(16, 16, 9),
                "surface mode: {}",
                surface
            );
        }
    }

    /// A codec whose sessions hand out images claiming to come from another buffer.
    struct LyingCodec;

    struct LyingSession {
        provider: Box<dyn BufferProvider>,
        pending: Option<crate::decoder::DecodedImage>,
    }

    impl CodecSession for LyingSession {
        fn decode(&mut self, _unit: &[u8], timestamp: u64) -> Result<(), CodecError> {
            let buffer = self.provider.allocate(0)?;
            self.pending = Some(crate::decoder::DecodedImage {
                resolution: Resolution::from((16, 16)),
                planes: Default::default(),
                slot: buffer.index,
                key: BufferKey(buffer.key.0 + 1),
                timestamp,
            });
            self.provider.free(&buffer)?;
            Ok(())
        }

        fn flush(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn next_image(&mut self) -> Option<crate::decoder::DecodedImage> {
            self.pending.take()
        }
    }

    impl Codec for LyingCodec {
        fn open(
            &self,
            _config: &SessionConfig,
            provider: Box<dyn BufferProvider>,
        ) -> Result<Box<dyn CodecSession>, CodecError> {
            Ok(Box::new(LyingSession {
                provider,
                pending: None,
            }))
        }
    }

    #[test]
    fn test_integrity_failure_drops_frame() {
        let mut allocator = HeapBufferAllocator::new();
        let keys = allocator.allocate_many(&geometry(), 2).unwrap();
        let mut engine = DecodeEngine::new(
            DecoderConfig::default().with_border(BORDER),
            OutputMode::Copy(Box::new(allocator.mapper())),
            geometry(),
            keys,
        )
        .unwrap();
        engine.initialize(&LyingCodec, None).unwrap();

        let err = engine.decode(&[1], 0, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(engine.integrity_failures(), 1);
        // The frame was not delivered, so the slot can be reused right away.
        assert_eq!(engine.pool().lock().count_available(), 2);
    }

    struct BrokenCodec;

    impl Codec for BrokenCodec {
        fn open(
            &self,
            _config: &SessionConfig,
            _provider: Box<dyn BufferProvider>,
        ) -> Result<Box<dyn CodecSession>, CodecError> {
            Err(CodecError::Unsupported("no hardware".into()))
        }
    }

    #[test]
    fn test_codec_init_failure() {
        let (mut engine, _allocator) = copy_engine(2, RawCodec::new());
        engine.shutdown();

        let err = engine.initialize(&BrokenCodec, None).unwrap_err();
        assert!(matches!(err, DecodeError::CodecInitFailed(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_shutdown_gives_buffers_back() {
        let (mut engine, _allocator) = copy_engine(4, RawCodec::new().with_reorder_depth(1));
        engine.decode(&unit(0), 0, false).unwrap();
        engine.decode(&unit(1), 1, false).unwrap();
        assert!(engine.pool().lock().num_in_flight() > 0);

        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.pool().lock().num_in_flight(), 0);
        assert!(matches!(
            engine.retrieve(),
            Err(DecodeError::NotInitialized)
        ));
    }

    #[test]
    fn test_too_many_buffers() {
        let mut allocator = HeapBufferAllocator::new();
        let keys = allocator.allocate_many(&geometry(), 3).unwrap();

        let result = DecodeEngine::new(
            DecoderConfig::default().with_max_buffers(2),
            OutputMode::Copy(Box::new(allocator.mapper())),
            geometry(),
            keys,
        );
        assert!(matches!(
            result,
            Err(DecodeError::Pool(PoolError::CapacityExceeded { .. }))
        ));
    }
}
