//! Audio format description and time unit conversions.
//!
//! The engine itself always runs interleaved stereo `f32` at the device rate;
//! [`SampleFormat`] exists to describe *decoder-side* data handed to the
//! stream converter, and [`TimeUnit`] conversions go through the engine's
//! [`AudioSpec`] so every internal clock can stay in PCM frames.

use crate::error::{Error, ErrorCode, Result};

/// Description of one sample of PCM data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    bits: u8,
    is_float: bool,
    is_signed: bool,
}

impl SampleFormat {
    pub const fn new(bits: u8, is_float: bool, is_signed: bool) -> Self {
        Self {
            bits,
            is_float,
            is_signed,
        }
    }

    /// 32-bit float, the engine's native format.
    pub const F32: Self = Self::new(32, true, true);
    /// 16-bit signed integer, the common WAV format.
    pub const I16: Self = Self::new(16, false, true);
    /// 32-bit signed integer.
    pub const I32: Self = Self::new(32, false, true);
    /// 8-bit unsigned integer.
    pub const U8: Self = Self::new(8, false, false);

    pub const fn bits(&self) -> u8 {
        self.bits
    }

    pub const fn bytes(&self) -> usize {
        (self.bits / 8) as usize
    }

    pub const fn is_float(&self) -> bool {
        self.is_float
    }

    pub const fn is_signed(&self) -> bool {
        self.is_signed
    }
}

/// Description for data in a buffer or stream of audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    /// Sample frames per second.
    pub freq: u32,
    /// Interleaved channels per frame.
    pub channels: u16,
    /// Sample type of the data.
    pub format: SampleFormat,
}

impl AudioSpec {
    pub const fn new(freq: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            freq,
            channels,
            format,
        }
    }

    /// The engine's output spec at a given rate: stereo f32.
    pub const fn engine(freq: u32) -> Self {
        Self::new(freq, 2, SampleFormat::F32)
    }

    /// Bytes per interleaved frame.
    pub const fn frame_bytes(&self) -> usize {
        self.format.bytes() * self.channels as usize
    }
}

/// Units to measure time in.
/// All internal clocks are PCM frames, with the sample rate as source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum TimeUnit {
    /// Microseconds.
    Micros,
    /// Milliseconds.
    Millis,
    /// PCM sample frames: `samplerate * seconds`.
    PcmFrames,
    /// PCM bytes: `frames * channels * sample width`.
    PcmBytes,
}

/// Convert a time value from one unit to another through an audio spec.
///
/// Returns a double so the caller can round or truncate as needed.
pub fn convert(value: u64, source: TimeUnit, target: TimeUnit, spec: &AudioSpec) -> Result<f64> {
    if spec.freq == 0 {
        return Err(Error::new(ErrorCode::InvalidArgument, "spec has zero rate"));
    }

    let frame_bytes = spec.frame_bytes() as f64;

    // Normalize to seconds first; every unit is defined against the spec rate.
    let seconds = match source {
        TimeUnit::Micros => value as f64 / 1_000_000.0,
        TimeUnit::Millis => value as f64 / 1_000.0,
        TimeUnit::PcmFrames => value as f64 / spec.freq as f64,
        TimeUnit::PcmBytes => value as f64 / frame_bytes / spec.freq as f64,
    };

    Ok(match target {
        TimeUnit::Micros => seconds * 1_000_000.0,
        TimeUnit::Millis => seconds * 1_000.0,
        TimeUnit::PcmFrames => seconds * spec.freq as f64,
        TimeUnit::PcmBytes => seconds * spec.freq as f64 * frame_bytes,
    })
}
