//! Source pulling from an incremental decoder through a format converter.

use std::collections::VecDeque;

use crate::constants::STREAM_PREFETCH_BUFFERS;
use crate::error::{Error, ErrorCode, Result};
use crate::object_pool::ObjectPool;
use crate::pool::Handle;
use crate::source::{ReadCtx, SourceBase};
use crate::spec::{AudioSpec, SampleFormat, TimeUnit};

/// An opened incremental decoder.
///
/// Implementations produce interleaved frames in their own format, described
/// by `spec()`. The stream source wraps the decoder in a [`FormatConverter`]
/// to reach the engine format; the decoder's sample rate must already match
/// the engine rate, since the mix path performs no rate conversion.
pub trait AudioDecoder: Send {
    /// Format of the frames this decoder produces.
    fn spec(&self) -> AudioSpec;

    /// Decode up to `out.len() / spec().frame_bytes()` frames into `out`.
    /// Returns the number of frames written; 0 at end of stream.
    fn read_frames(&mut self, out: &mut [u8]) -> Result<usize>;

    /// Seek to `position`, expressed in `unit`.
    fn set_position(&mut self, unit: TimeUnit, position: u64) -> Result<()>;

    /// Current position, expressed in `unit`.
    fn position(&self, unit: TimeUnit) -> Result<f64>;

    /// Whether the decoder has reached the end of its data.
    fn is_ended(&self) -> bool;
}

/// Converts decoder-format frames to the engine's interleaved stereo f32.
///
/// Sample formats convert per [`SampleFormat`]; mono duplicates into both
/// channels and anything above stereo keeps its first two channels.
pub(crate) struct FormatConverter {
    source: AudioSpec,
}

impl FormatConverter {
    pub(crate) fn new(source: AudioSpec, target: &AudioSpec) -> Result<Self> {
        if source.freq != target.freq {
            return Err(Error::new(
                ErrorCode::Unsupported,
                "decoder rate differs from engine rate; resample at load time",
            ));
        }
        if source.channels == 0 {
            return Err(Error::new(ErrorCode::UnexpectedData, "decoder has no channels"));
        }
        match (source.format.bits(), source.format.is_float()) {
            (32, true) | (16, false) | (32, false) | (8, false) => {}
            _ => {
                return Err(Error::new(
                    ErrorCode::Unsupported,
                    "unsupported decoder sample format",
                ))
            }
        }
        Ok(Self { source })
    }

    fn sample_at(&self, bytes: &[u8]) -> f32 {
        let format = self.source.format;
        match (format.bits(), format.is_float()) {
            (32, true) => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (16, false) => {
                i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / -(i16::MIN as f32)
            }
            (32, false) => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / -(i32::MIN as f32)
            }
            // 8-bit PCM is unsigned with a 128 bias.
            _ => (bytes[0] as f32 - 128.0) / 128.0,
        }
    }

    /// Append `input` (whole frames, decoder format) to `out` as stereo f32.
    pub(crate) fn convert_into(&self, input: &[u8], out: &mut VecDeque<f32>) {
        let frame_bytes = self.source.frame_bytes();
        let sample_bytes = self.source.format.bytes();

        for frame in input.chunks_exact(frame_bytes) {
            let left = self.sample_at(&frame[..sample_bytes]);
            let right = if self.source.channels > 1 {
                self.sample_at(&frame[sample_bytes..sample_bytes * 2])
            } else {
                left
            };
            out.push_back(left);
            out.push_back(right);
        }
    }
}

/// Streams audio from a decoder, keeping a small prefetch of converted
/// samples ahead of the play head. Until enough data has buffered the source
/// emits silence rather than a short read.
pub struct StreamSource {
    pub(crate) base: SourceBase,
    decoder: Option<Box<dyn AudioDecoder>>,
    converter: FormatConverter,
    raw: Vec<u8>,
    pending: VecDeque<f32>,
    looping: bool,
    one_shot: bool,
}

impl StreamSource {
    pub(crate) fn new(
        base: SourceBase,
        decoder: Box<dyn AudioDecoder>,
        engine_spec: &AudioSpec,
        buffer_frames: u32,
        looping: bool,
        one_shot: bool,
    ) -> Result<Self> {
        let source_spec = decoder.spec();
        let converter = FormatConverter::new(source_spec, engine_spec)?;
        let chunk = buffer_frames as usize * source_spec.frame_bytes();
        Ok(Self {
            base,
            decoder: Some(decoder),
            converter,
            raw: vec![0; chunk.max(source_spec.frame_bytes())],
            pending: VecDeque::with_capacity(
                buffer_frames as usize * 2 * STREAM_PREFETCH_BUFFERS,
            ),
            looping,
            one_shot,
        })
    }

    pub fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn position(&self, unit: TimeUnit) -> Result<f64> {
        match &self.decoder {
            Some(decoder) => decoder.position(unit),
            None => Err(Error::bare(ErrorCode::StreamUninit)),
        }
    }

    pub fn set_position(&mut self, unit: TimeUnit, position: u64) -> Result<()> {
        match &mut self.decoder {
            Some(decoder) => {
                decoder.set_position(unit, position)?;
                self.pending.clear();
                Ok(())
            }
            None => Err(Error::bare(ErrorCode::StreamUninit)),
        }
    }

    /// Drop the decoder. Safe to call repeatedly.
    pub(crate) fn close(&mut self) {
        self.decoder = None;
        self.pending.clear();
    }

    /// Top up the prefetch until `goal` samples are pending, the decoder runs
    /// dry, or (when looping) the decoder has been rewound.
    fn prefetch(&mut self, goal: usize) {
        let Some(decoder) = &mut self.decoder else {
            return;
        };

        while self.pending.len() < goal {
            if decoder.is_ended() {
                if !self.looping {
                    break;
                }
                if decoder.set_position(TimeUnit::PcmFrames, 0).is_err() {
                    break;
                }
            }

            match decoder.read_frames(&mut self.raw) {
                // A decoder yielding nothing is dry, rewound or not.
                Ok(0) => break,
                Ok(frames) => {
                    let bytes = frames * self.converter.source.frame_bytes();
                    self.converter.convert_into(&self.raw[..bytes], &mut self.pending);
                }
                Err(error) => {
                    crate::error::push_error(error);
                    break;
                }
            }
        }
    }
}

/// Serve converted samples out of the prefetch. While the stream is still
/// buffering the full request is reported as produced silence; once the
/// decoder is drained the source returns short and, for one-shots, closes
/// itself.
pub(crate) fn read_impl(
    objects: &mut ObjectPool,
    ctx: &mut ReadCtx,
    handle: Handle<StreamSource>,
    out: &mut [f32],
) -> usize {
    let Some(source) = objects.get_mut(handle) else {
        return 0;
    };
    if source.decoder.is_none() {
        return 0;
    }

    source.prefetch(out.len().max(source.raw.len() / source.converter.source.frame_bytes() * 2));

    let drained = source
        .decoder
        .as_ref()
        .map_or(true, |decoder| decoder.is_ended() && !source.looping);

    if source.pending.len() < out.len() && !drained {
        // Still buffering; emit a full silent chunk.
        return out.len();
    }

    let take = out.len().min(source.pending.len());
    for sample in out.iter_mut().take(take) {
        *sample = source.pending.pop_front().unwrap_or(0.0);
    }

    if drained && source.pending.is_empty() {
        if source.one_shot {
            ctx.self_close(handle.into());
        }
        return take;
    }

    out.len().max(take)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command as Cmd;

    /// Decoder producing a known i16 mono ramp.
    struct RampDecoder {
        frames: usize,
        at: usize,
        spec: AudioSpec,
    }

    impl RampDecoder {
        fn new(frames: usize) -> Self {
            Self {
                frames,
                at: 0,
                spec: AudioSpec::new(48_000, 1, SampleFormat::I16),
            }
        }
    }

    impl AudioDecoder for RampDecoder {
        fn spec(&self) -> AudioSpec {
            self.spec
        }

        fn read_frames(&mut self, out: &mut [u8]) -> Result<usize> {
            let want = out.len() / 2;
            let frames = want.min(self.frames - self.at);
            for i in 0..frames {
                let value = (self.at + i) as i16;
                out[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
            }
            self.at += frames;
            Ok(frames)
        }

        fn set_position(&mut self, _unit: TimeUnit, position: u64) -> Result<()> {
            self.at = (position as usize).min(self.frames);
            Ok(())
        }

        fn position(&self, _unit: TimeUnit) -> Result<f64> {
            Ok(self.at as f64)
        }

        fn is_ended(&self) -> bool {
            self.at >= self.frames
        }
    }

    fn spawn(
        objects: &mut ObjectPool,
        frames: usize,
        looping: bool,
        one_shot: bool,
    ) -> Handle<StreamSource> {
        let base = SourceBase::new(objects, 0, false);
        let stream = StreamSource::new(
            base,
            Box::new(RampDecoder::new(frames)),
            &AudioSpec::engine(48_000),
            64,
            looping,
            one_shot,
        )
        .unwrap();
        objects.insert(stream)
    }

    #[test]
    fn converts_mono_i16_to_stereo_f32() {
        let mut objects = ObjectPool::new();
        let handle = spawn(&mut objects, 1024, false, false);
        let (tx, _rx) = crossbeam_channel::unbounded::<Cmd>();
        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };

        let mut out = vec![0.0; 64];
        assert_eq!(read_impl(&mut objects, &mut ctx, handle, &mut out), 64);
        // Mono duplicates into both channels; i16 scales by 1/32768.
        for frame in 0..32 {
            let expected = frame as f32 / 32_768.0;
            assert!((out[frame * 2] - expected).abs() < 1e-7);
            assert_eq!(out[frame * 2], out[frame * 2 + 1]);
        }
    }

    #[test]
    fn drained_one_shot_closes_itself() {
        let mut objects = ObjectPool::new();
        let handle = spawn(&mut objects, 32, false, true);
        let (tx, rx) = crossbeam_channel::unbounded::<Cmd>();
        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };

        let mut out = vec![0.0; 256];
        let produced = read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert_eq!(produced, 64);
        assert!(discard);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn looping_stream_rewinds_at_the_end() {
        let mut objects = ObjectPool::new();
        let handle = spawn(&mut objects, 32, true, false);
        let (tx, _rx) = crossbeam_channel::unbounded::<Cmd>();
        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };

        let mut out = vec![0.0; 256];
        assert_eq!(read_impl(&mut objects, &mut ctx, handle, &mut out), 256);
        // Frame 32 wraps back to the ramp start.
        assert_eq!(out[0], 0.0);
        assert!((out[31 * 2] - 31.0 / 32_768.0).abs() < 1e-7);
        assert_eq!(out[32 * 2], 0.0);
    }

    #[test]
    fn rate_mismatch_is_rejected() {
        let mut objects = ObjectPool::new();
        let base = SourceBase::new(&mut objects, 0, false);
        let mut decoder = RampDecoder::new(16);
        decoder.spec.freq = 44_100;
        let result = StreamSource::new(
            base,
            Box::new(decoder),
            &AudioSpec::engine(48_000),
            64,
            false,
            false,
        );
        assert!(result.is_err());
    }
}
