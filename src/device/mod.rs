//! Audio output backends.
//!
//! A device opens with a requested sample rate and buffer size, then invokes
//! the engine's pull callback from its own realtime context whenever the
//! hardware wants audio. [`CpalDevice`] drives real hardware; [`MockDevice`]
//! is pumped by hand, which is what the test suite and headless hosts use.

mod cpal;
mod mock;

pub use self::cpal::{list_output_devices, CpalDevice};
pub use mock::{MockDevice, MockDeviceController};

use std::sync::Arc;

use crate::constants::{MAX_BUFFER_FRAMES, MIN_BUFFER_FRAMES};
use crate::error::Result;
use crate::spec::AudioSpec;

/// Callback invoked on the device thread with the interleaved stereo f32
/// output buffer to fill.
pub type PullFn = Arc<dyn Fn(&mut [f32]) + Send + Sync>;

/// Requested device parameters. Zero sample rate asks for the device default.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub buffer_frames: u32,
}

impl DeviceConfig {
    pub fn new(sample_rate: u32, buffer_frames: u32) -> Self {
        Self {
            sample_rate,
            buffer_frames: buffer_frames.clamp(MIN_BUFFER_FRAMES, MAX_BUFFER_FRAMES),
        }
    }
}

/// Abstraction over an audio output backend.
pub trait AudioDevice: Send {
    /// Open the device and start invoking `pull`. Returns the effective spec.
    fn open(&mut self, config: DeviceConfig, pull: PullFn) -> Result<AudioSpec>;

    /// Close the device. Safe to call if already closed.
    fn close(&mut self);

    /// Stop invoking the pull callback without closing.
    fn suspend(&mut self);

    /// Resume a suspended device.
    fn resume(&mut self);

    /// Whether the device is open and not suspended.
    fn is_running(&self) -> bool;

    /// Whether the device was opened.
    fn is_open(&self) -> bool;

    /// Output spec negotiated at open.
    fn spec(&self) -> AudioSpec;

    /// Frames per output buffer negotiated at open.
    fn buffer_frames(&self) -> u32;
}
