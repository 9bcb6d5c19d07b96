//! Centralized constants for the mixbus engine.
//! Contains only the constants that are actually used throughout the codebase.

// Device defaults - Used in engine.rs, device/ and main.rs CLI defaults
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BUFFER_FRAMES: u32 = 1024;
pub const MIN_BUFFER_FRAMES: u32 = 128;
pub const MAX_BUFFER_FRAMES: u32 = 4096;

// Mix format - the whole mix path runs interleaved stereo f32
pub const CHANNELS: usize = 2;
pub const SAMPLES_PER_FRAME: usize = CHANNELS;

// Effect chain slots every source carries from init until release
pub const PANNER_SLOT: usize = 0;
pub const VOLUME_SLOT: usize = 1;
pub const DEFAULT_EFFECT_COUNT: usize = 2;

// Delay effect floor, samples per WebAudio render quantum
pub const MIN_DELAY_FRAMES: u32 = 256;

// Pool pre-allocation - Used in object_pool.rs
pub const DEFAULT_SOURCE_CAPACITY: usize = 64;
pub const DEFAULT_EFFECT_CAPACITY: usize = 128;

// Error reporting - Used in error.rs
pub const MAX_ERROR_STACK_DEPTH: usize = 32;

// Stream prefetch - Used in stream.rs
pub const STREAM_PREFETCH_BUFFERS: usize = 4;
