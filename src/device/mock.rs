//! Hand-pumped device for tests and headless hosts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AudioDevice, DeviceConfig, PullFn};
use crate::constants::DEFAULT_SAMPLE_RATE;
use crate::error::Result;
use crate::spec::AudioSpec;

struct Inner {
    pull: Mutex<Option<PullFn>>,
    running: AtomicBool,
    open: AtomicBool,
    frames_pumped: AtomicU64,
    spec: Mutex<AudioSpec>,
    buffer_frames: Mutex<u32>,
}

/// Device backend with no hardware behind it. The owner of the paired
/// [`MockDeviceController`] decides when "the hardware" asks for audio by
/// calling `pump`.
pub struct MockDevice {
    inner: Arc<Inner>,
}

/// Pump handle shared with the test or host driving the device.
#[derive(Clone)]
pub struct MockDeviceController {
    inner: Arc<Inner>,
}

impl MockDevice {
    pub fn new() -> (Self, MockDeviceController) {
        let inner = Arc::new(Inner {
            pull: Mutex::new(None),
            running: AtomicBool::new(false),
            open: AtomicBool::new(false),
            frames_pumped: AtomicU64::new(0),
            spec: Mutex::new(AudioSpec::engine(DEFAULT_SAMPLE_RATE)),
            buffer_frames: Mutex::new(0),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MockDeviceController { inner },
        )
    }
}

impl AudioDevice for MockDevice {
    fn open(&mut self, config: DeviceConfig, pull: PullFn) -> Result<AudioSpec> {
        let rate = if config.sample_rate == 0 {
            DEFAULT_SAMPLE_RATE
        } else {
            config.sample_rate
        };
        let spec = AudioSpec::engine(rate);
        *self.inner.spec.lock() = spec;
        *self.inner.buffer_frames.lock() = config.buffer_frames;
        *self.inner.pull.lock() = Some(pull);
        self.inner.open.store(true, Ordering::Release);
        self.inner.running.store(false, Ordering::Release);
        Ok(spec)
    }

    fn close(&mut self) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.running.store(false, Ordering::Release);
        *self.inner.pull.lock() = None;
    }

    fn suspend(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }

    fn resume(&mut self) {
        if self.inner.open.load(Ordering::Acquire) {
            self.inner.running.store(true, Ordering::Release);
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    fn spec(&self) -> AudioSpec {
        *self.inner.spec.lock()
    }

    fn buffer_frames(&self) -> u32 {
        *self.inner.buffer_frames.lock()
    }
}

impl MockDeviceController {
    /// Invoke the pull callback for `frames` stereo frames, returning the
    /// produced samples. A suspended or closed device returns silence.
    pub fn pump(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames * 2];
        self.pump_into(&mut out);
        out
    }

    /// Invoke the pull callback on a caller-provided buffer.
    pub fn pump_into(&self, out: &mut [f32]) {
        if !self.inner.running.load(Ordering::Acquire) {
            out.fill(0.0);
            return;
        }
        let pull = self.inner.pull.lock().clone();
        if let Some(pull) = pull {
            pull(out);
            self.inner
                .frames_pumped
                .fetch_add((out.len() / 2) as u64, Ordering::Relaxed);
        } else {
            out.fill(0.0);
        }
    }

    /// Total frames pumped since open.
    pub fn frames_pumped(&self) -> u64 {
        self.inner.frames_pumped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_reaches_the_callback_only_while_running() {
        let (mut device, controller) = MockDevice::new();
        let pulled = Arc::new(AtomicU64::new(0));
        let pulled_in_cb = Arc::clone(&pulled);

        let pull: PullFn = Arc::new(move |out: &mut [f32]| {
            pulled_in_cb.fetch_add(1, Ordering::Relaxed);
            out.fill(0.25);
        });
        device.open(DeviceConfig::new(48_000, 256), pull).unwrap();

        // Not yet resumed: silence, no callback.
        let out = controller.pump(16);
        assert_eq!(pulled.load(Ordering::Relaxed), 0);
        assert!(out.iter().all(|&s| s == 0.0));

        device.resume();
        let out = controller.pump(16);
        assert_eq!(pulled.load(Ordering::Relaxed), 1);
        assert!(out.iter().all(|&s| s == 0.25));
        assert_eq!(controller.frames_pumped(), 16);

        device.suspend();
        controller.pump(16);
        assert_eq!(pulled.load(Ordering::Relaxed), 1);
    }
}
