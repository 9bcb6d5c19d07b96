//! mixbus: a real-time audio mixing engine.
//!
//! Decoded or streamed PCM sources are composed into a hierarchical bus
//! graph with per-source effect chains, sample-accurate pause and fade
//! scheduling, and a deferred command protocol that lets any thread mutate
//! the graph while the audio device keeps pulling mixed output.
//!
//! ```no_run
//! use mixbus::{Engine, EngineConfig, SoundBuffer, AudioSpec};
//! use std::sync::Arc;
//!
//! let mut engine = Engine::new();
//! let spec = engine.open(EngineConfig::default()).unwrap();
//!
//! let samples = vec![0.0f32; spec.freq as usize * 2];
//! let buffer = Arc::new(SoundBuffer::new(samples, spec).unwrap());
//! let sound = engine.play_sound(&buffer, false, false, true, None).unwrap();
//! engine.fade_to(sound, 0.0, spec.freq).unwrap();
//!
//! loop {
//!     engine.update().unwrap();
//!     if !engine.is_valid(sound) {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

pub mod buffer;
pub mod bus;
pub mod command;
pub mod constants;
pub mod device;
pub mod effects;
pub mod engine;
pub mod error;
pub mod object_pool;
pub mod pcm;
pub mod pool;
pub mod source;
pub mod spec;
pub mod stream;

pub use buffer::{Marker, SoundBuffer};
pub use bus::Bus;
pub use command::{Command, CLOCK_NOW};
pub use device::{AudioDevice, DeviceConfig, MockDeviceController};
pub use effects::{DelayEffect, Effect, PanEffect, VolumeEffect};
pub use engine::{Engine, EngineConfig};
pub use error::{pop_error, Error, ErrorCode, Result};
pub use object_pool::{EffectRef, SourceRef};
pub use pcm::PcmSource;
pub use pool::Handle;
pub use source::FadePoint;
pub use spec::{convert, AudioSpec, SampleFormat, TimeUnit};
pub use stream::{AudioDecoder, StreamSource};
