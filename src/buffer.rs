//! Decoded PCM containers shared with the mix thread.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, Result};
use crate::spec::{self, AudioSpec, TimeUnit};

/// Labeled cue point inside a sound buffer, in PCM frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub label: String,
    pub frame: u64,
}

/// Container holding decoded PCM sound data.
///
/// Data must already be in the engine's output format (interleaved stereo
/// `f32` at the device rate); conversion is the loader's job. The sample data
/// sits behind an atomic pointer: sources re-read it on every pull, so a
/// buffer may be swapped or unloaded while sources reference it and in-flight
/// reads observe either the old or the new data, never a torn state.
pub struct SoundBuffer {
    data: ArcSwapOption<Vec<f32>>,
    spec: AudioSpec,
    markers: Mutex<Vec<Marker>>,
}

impl SoundBuffer {
    /// Wrap already-converted samples. `samples` is interleaved stereo, so its
    /// length must be even.
    pub fn new(samples: Vec<f32>, spec: AudioSpec) -> Result<Self> {
        if samples.len() % 2 != 0 {
            return Err(Error::new(
                ErrorCode::InvalidSoundBuffer,
                "sample data is not interleaved stereo",
            ));
        }
        Ok(Self {
            data: ArcSwapOption::from_pointee(samples),
            spec,
            markers: Mutex::new(Vec::new()),
        })
    }

    /// An unloaded buffer; playable only after `swap` provides data.
    pub fn empty(spec: AudioSpec) -> Self {
        Self {
            data: ArcSwapOption::const_empty(),
            spec,
            markers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.data.load().is_some()
    }

    /// Snapshot of the current sample data.
    pub fn data(&self) -> Option<Arc<Vec<f32>>> {
        self.data.load_full()
    }

    /// Frames currently held; zero when unloaded.
    pub fn frame_count(&self) -> u64 {
        self.data.load().as_ref().map_or(0, |d| d.len() as u64 / 2)
    }

    pub fn spec(&self) -> &AudioSpec {
        &self.spec
    }

    /// Replace the sample data. Swapping during playback is allowed but not
    /// encouraged; readers pick up the new data on their next pull.
    pub fn swap(&self, samples: Vec<f32>) -> Result<()> {
        if samples.len() % 2 != 0 {
            return Err(Error::new(
                ErrorCode::InvalidSoundBuffer,
                "sample data is not interleaved stereo",
            ));
        }
        self.data.store(Some(Arc::new(samples)));
        Ok(())
    }

    /// Drop the sample data. Live sources reading this buffer go silent.
    pub fn unload(&self) {
        self.data.store(None);
    }

    /// Buffer length converted to `unit`.
    pub fn duration(&self, unit: TimeUnit) -> Result<f64> {
        spec::convert(self.frame_count(), TimeUnit::PcmFrames, unit, &self.spec)
    }

    pub fn add_marker(&self, label: impl Into<String>, unit: TimeUnit, position: u64) -> Result<()> {
        let frame = spec::convert(position, unit, TimeUnit::PcmFrames, &self.spec)? as u64;
        self.markers.lock().push(Marker {
            label: label.into(),
            frame,
        });
        Ok(())
    }

    pub fn marker(&self, index: usize) -> Option<Marker> {
        self.markers.lock().get(index).cloned()
    }

    pub fn marker_count(&self) -> usize {
        self.markers.lock().len()
    }
}
