//! The engine: owns the mix graph, the object pool, the command queues, and
//! the device, and serves the device's pull callback.
//!
//! One mutex guards the mix state. The audio callback takes it, drains the
//! immediate queue, renders the master bus, advances the engine clock, and
//! copies the master scratch into the device buffer. Client threads take the
//! same mutex only inside the public API; command enqueue itself is
//! channel-based and never blocks the audio thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::buffer::SoundBuffer;
use crate::bus::{self, Bus};
use crate::command::{Command, EngineCommand, CLOCK_NOW};
use crate::constants::{DEFAULT_BUFFER_FRAMES, DEFAULT_SAMPLE_RATE};
use crate::device::{AudioDevice, CpalDevice, DeviceConfig, MockDevice, MockDeviceController, PullFn};
use crate::effects::{DelayEffect, Effect, PanEffect, ParamValue, VolumeEffect};
use crate::error::{push_error, Error, ErrorCode, Result};
use crate::object_pool::{EffectRef, ObjectPool, SourceRef, UserEffect};
use crate::pcm::PcmSource;
use crate::pool::Handle;
use crate::source::{self, ReadCtx, SourceBase};
use crate::spec::{self, AudioSpec, TimeUnit};
use crate::stream::{AudioDecoder, StreamSource};

/// Requested engine parameters; zero sample rate asks for the device default.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub buffer_frames: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_frames: DEFAULT_BUFFER_FRAMES,
        }
    }
}

/// Everything the mix thread touches, behind the mix mutex.
struct MixState {
    objects: ObjectPool,
    master: Handle<Bus>,
    clock: u32,
    discard_flag: bool,
    spec: AudioSpec,
    buffer_frames: u32,
}

struct Shared {
    mix: Mutex<MixState>,
    deferred_tx: Sender<Command>,
    deferred_rx: Receiver<Command>,
    immediate_tx: Sender<Command>,
    immediate_rx: Receiver<Command>,
    open: AtomicBool,
}

/// The audio engine.
///
/// Create one, `open` it, attach sources, and call [`Engine::update`]
/// periodically from a client thread to apply deferred graph changes and
/// sweep released sources.
pub struct Engine {
    shared: Arc<Shared>,
    device: Box<dyn AudioDevice>,
}

impl Engine {
    /// Engine on the default cpal output device.
    pub fn new() -> Self {
        Self::with_device(Box::new(CpalDevice::new()))
    }

    /// Engine on a caller-provided device backend.
    pub fn with_device(device: Box<dyn AudioDevice>) -> Self {
        let (deferred_tx, deferred_rx) = unbounded();
        let (immediate_tx, immediate_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                mix: Mutex::new(MixState {
                    objects: ObjectPool::new(),
                    master: Handle::null(),
                    clock: 0,
                    discard_flag: false,
                    spec: AudioSpec::engine(0),
                    buffer_frames: 0,
                }),
                deferred_tx,
                deferred_rx,
                immediate_tx,
                immediate_rx,
                open: AtomicBool::new(false),
            }),
            device,
        }
    }

    /// Engine on a hand-pumped mock device, plus its pump handle.
    pub fn with_mock_device() -> (Self, MockDeviceController) {
        let (device, controller) = MockDevice::new();
        (Self::with_device(Box::new(device)), controller)
    }

    /// Open the device, allocate the master bus, and start the stream.
    pub fn open(&mut self, config: EngineConfig) -> Result<AudioSpec> {
        if self.is_open() {
            return Err(Error::new(ErrorCode::Logic, "engine is already open"));
        }

        let pull = make_pull(Arc::clone(&self.shared));
        let device_spec = self
            .device
            .open(DeviceConfig::new(config.sample_rate, config.buffer_frames), pull)?;

        {
            let mut state = self.shared.mix.lock();
            state.spec = device_spec;
            state.buffer_frames = self.device.buffer_frames();
            state.clock = 0;
            let base = SourceBase::new(&mut state.objects, 0, false);
            state.master = state.objects.insert(Bus::new(base, None, true));
        }

        self.shared.open.store(true, Ordering::Release);
        self.device.resume();
        tracing::info!(
            rate = device_spec.freq,
            buffer_frames = self.device.buffer_frames(),
            "engine opened"
        );
        Ok(device_spec)
    }

    /// Tear the graph down and close the device. Idempotent.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }

        {
            let mut state = self.shared.mix.lock();
            let master = state.master;
            if state.objects.is_valid(master) {
                // The privileged path: unset the master flag so the ordinary
                // release machinery accepts the root bus.
                if let Some(bus) = state.objects.get_mut(master) {
                    bus.is_master = false;
                }
                apply_command(
                    &mut state,
                    &self.shared.deferred_tx,
                    Command::release_source(SourceRef::Bus(master), true),
                );
                drain_queue(&mut state, &self.shared.immediate_rx, &self.shared.deferred_tx);
                drain_queue(&mut state, &self.shared.deferred_rx, &self.shared.deferred_tx);
                bus::process_removals(&mut state.objects, master);
                bus::destroy_source(&mut state.objects, SourceRef::Bus(master));
            }
            state.master = Handle::null();
            state.clock = 0;
            state.discard_flag = false;
        }

        self.shared.open.store(false, Ordering::Release);
        self.device.close();
        tracing::info!("engine closed");
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Output spec negotiated with the device.
    pub fn spec(&self) -> Result<AudioSpec> {
        self.ensure_open("spec")?;
        Ok(self.shared.mix.lock().spec)
    }

    /// Frames per device buffer.
    pub fn buffer_frames(&self) -> Result<u32> {
        self.ensure_open("buffer_frames")?;
        Ok(self.shared.mix.lock().buffer_frames)
    }

    /// Engine clock in frames, advanced once per pull.
    pub fn clock(&self) -> Result<u32> {
        self.ensure_open("clock")?;
        Ok(self.shared.mix.lock().clock)
    }

    /// Suspend the output device; the graph stops being pulled.
    pub fn suspend(&mut self) -> Result<()> {
        self.ensure_open("suspend")?;
        self.device.suspend();
        Ok(())
    }

    /// Resume a suspended device.
    pub fn resume(&mut self) -> Result<()> {
        self.ensure_open("resume")?;
        self.device.resume();
        Ok(())
    }

    /// Whether the device is currently running (not suspended).
    pub fn device_running(&self) -> bool {
        self.device.is_running()
    }

    /// Drain the deferred queue and, if anything was released, sweep the
    /// graph. Call periodically from a client thread.
    pub fn update(&self) -> Result<()> {
        self.ensure_open("update")?;
        let mut state = self.shared.mix.lock();
        drain_queue(&mut state, &self.shared.deferred_rx, &self.shared.deferred_tx);

        if state.discard_flag {
            let master = state.master;
            if state.objects.is_valid(master) {
                bus::process_removals(&mut state.objects, master);
            } else {
                push_error(Error::new(
                    ErrorCode::InvalidHandle,
                    "master bus invalidated outside close",
                ));
            }
            state.discard_flag = false;
        }
        Ok(())
    }

    /// Thread-safe enqueue on the deferred queue.
    pub fn push_command(&self, command: Command) -> Result<()> {
        self.ensure_open("push_command")?;
        self.shared
            .deferred_tx
            .send(command)
            .map_err(|_| Error::bare(ErrorCode::Runtime))
    }

    /// Thread-safe enqueue on the immediate queue, drained at the top of the
    /// next audio pull.
    pub fn push_immediate_command(&self, command: Command) -> Result<()> {
        self.ensure_open("push_immediate_command")?;
        self.shared
            .immediate_tx
            .send(command)
            .map_err(|_| Error::bare(ErrorCode::Runtime))
    }

    // ===== Graph construction ==============================================

    /// Root of the mix graph.
    pub fn master_bus(&self) -> Result<Handle<Bus>> {
        self.ensure_open("master_bus")?;
        Ok(self.shared.mix.lock().master)
    }

    /// Start a buffer playing on `bus` (master when `None`).
    ///
    /// The source is attached synchronously under the mix lock, so it is
    /// audible on the very next pull.
    pub fn play_sound(
        &self,
        buffer: &Arc<SoundBuffer>,
        paused: bool,
        looping: bool,
        one_shot: bool,
        bus: Option<Handle<Bus>>,
    ) -> Result<Handle<PcmSource>> {
        self.ensure_open("play_sound")?;
        if !buffer.is_loaded() {
            return Err(Error::new(ErrorCode::InvalidSoundBuffer, "play_sound"));
        }

        let mut state = self.shared.mix.lock();
        let target = bus.unwrap_or(state.master);
        let clock = state
            .objects
            .get(target)
            .map(|b| b.base.clock())
            .ok_or_else(|| Error::invalid_handle("play_sound"))?;

        let base = SourceBase::new(&mut state.objects, clock, paused);
        let handle = state.objects.insert(PcmSource::new(
            base,
            Arc::clone(buffer),
            looping,
            one_shot,
            1.0,
        ));
        bus::apply_append_source(&mut state.objects, target, handle.into());
        Ok(handle)
    }

    /// Start a decoder streaming on `bus` (master when `None`).
    pub fn play_stream(
        &self,
        decoder: Box<dyn AudioDecoder>,
        paused: bool,
        looping: bool,
        one_shot: bool,
        bus: Option<Handle<Bus>>,
    ) -> Result<Handle<StreamSource>> {
        self.ensure_open("play_stream")?;

        let mut state = self.shared.mix.lock();
        let target = bus.unwrap_or(state.master);
        let clock = state
            .objects
            .get(target)
            .map(|b| b.base.clock())
            .ok_or_else(|| Error::invalid_handle("play_stream"))?;

        let spec = state.spec;
        let buffer_frames = state.buffer_frames;
        let base = SourceBase::new(&mut state.objects, clock, paused);
        let stream = StreamSource::new(base, decoder, &spec, buffer_frames, looping, one_shot)?;
        let handle = state.objects.insert(stream);
        bus::apply_append_source(&mut state.objects, target, handle.into());
        Ok(handle)
    }

    /// Create a bus feeding `output` (master when `None`). The attachment is
    /// deferred to the next `update`.
    pub fn create_bus(&self, paused: bool, output: Option<Handle<Bus>>) -> Result<Handle<Bus>> {
        self.ensure_open("create_bus")?;

        let mut state = self.shared.mix.lock();
        let target = output.unwrap_or(state.master);
        let clock = state
            .objects
            .get(target)
            .map(|b| b.base.clock())
            .ok_or_else(|| Error::invalid_handle("create_bus"))?;

        let base = SourceBase::new(&mut state.objects, clock, paused);
        let handle = state.objects.insert(Bus::new(base, Some(target), false));
        drop(state);

        self.push_command(Command::bus_append_source(target, handle.into()))?;
        Ok(handle)
    }

    /// Move `source` onto `bus`. A sub-bus leaves its previous parent first.
    pub fn connect(&self, bus: Handle<Bus>, source: impl Into<SourceRef>) -> Result<()> {
        let source = source.into();
        self.ensure_open("connect")?;
        {
            let state = self.shared.mix.lock();
            if !state.objects.is_valid(bus) || !source.is_valid(&state.objects) {
                return Err(Error::invalid_handle("connect"));
            }
        }
        self.push_command(Command::bus_append_source(bus, source))
    }

    /// Detach `source` from `bus` without releasing it.
    pub fn disconnect(&self, bus: Handle<Bus>, source: impl Into<SourceRef>) -> Result<()> {
        let source = source.into();
        self.ensure_open("disconnect")?;
        {
            let state = self.shared.mix.lock();
            if !state.objects.is_valid(bus) || !source.is_valid(&state.objects) {
                return Err(Error::invalid_handle("disconnect"));
            }
        }
        self.push_command(Command::bus_remove_source(bus, source))
    }

    /// Release a source. The handle stays valid until the next `update`
    /// sweeps the graph.
    pub fn release(&self, source: impl Into<SourceRef>) -> Result<()> {
        let source = source.into();
        self.ensure_open("release")?;
        if let Some(handle) = source.as_bus() {
            return self.release_bus(handle, false);
        }
        {
            let state = self.shared.mix.lock();
            if !source.is_valid(&state.objects) {
                return Err(Error::invalid_handle("release"));
            }
        }
        self.push_command(Command::release_source(source, false))
    }

    /// Release a bus. Non-recursive release re-parents its children onto the
    /// master bus; recursive release takes the whole subtree down.
    pub fn release_bus(&self, bus: Handle<Bus>, recursive: bool) -> Result<()> {
        self.ensure_open("release_bus")?;
        {
            let state = self.shared.mix.lock();
            match state.objects.get(bus) {
                Some(b) if b.is_master() => {
                    return Err(Error::new(ErrorCode::Logic, "cannot release the master bus"));
                }
                Some(_) => {}
                None => return Err(Error::invalid_handle("release_bus")),
            }
        }
        self.push_command(Command::release_source(SourceRef::Bus(bus), recursive))
    }

    /// Whether a handle still refers to a live object.
    pub fn is_valid(&self, source: impl Into<SourceRef>) -> bool {
        let source = source.into();
        self.is_open() && source.is_valid(&self.shared.mix.lock().objects)
    }

    // ===== Source state ====================================================

    /// Pause or unpause immediately (on the next pull).
    pub fn set_paused(&self, source: impl Into<SourceRef>, paused: bool) -> Result<()> {
        let source = source.into();
        if paused {
            self.pause_at(source, CLOCK_NOW, false)
        } else {
            self.unpause_at(source, CLOCK_NOW)
        }
    }

    /// Schedule a pause at `clock` parent frames. [`CLOCK_NOW`] pauses on the
    /// next read; clock 0 cancels a pending pause. With `release_on_pause`
    /// the source closes itself when the pause fires.
    pub fn pause_at(
        &self,
        source: impl Into<SourceRef>,
        clock: u32,
        release_on_pause: bool,
    ) -> Result<()> {
        let source = source.into();
        self.with_base(source, "pause_at", |_| ())?;
        self.push_immediate_command(Command::set_pause(source, true, clock, release_on_pause))
    }

    /// Schedule an unpause at `clock` parent frames. [`CLOCK_NOW`] resumes on
    /// the next read; clock 0 cancels a pending unpause.
    pub fn unpause_at(&self, source: impl Into<SourceRef>, clock: u32) -> Result<()> {
        let source = source.into();
        self.with_base(source, "unpause_at", |_| ())?;
        self.push_immediate_command(Command::set_pause(source, false, clock, false))
    }

    pub fn source_paused(&self, source: impl Into<SourceRef>) -> Result<bool> {
        self.with_base(source.into(), "source_paused", |base| base.paused())
    }

    /// Frames this source has produced since creation.
    pub fn source_clock(&self, source: impl Into<SourceRef>) -> Result<u32> {
        self.with_base(source.into(), "source_clock", |base| base.clock())
    }

    /// The clock value the parent assigned this source on the last pull.
    pub fn source_parent_clock(&self, source: impl Into<SourceRef>) -> Result<u32> {
        self.with_base(source.into(), "source_parent_clock", |base| {
            base.parent_clock()
        })
    }

    // ===== Fades ===========================================================

    /// Add a linear fade point at `clock` parent frames.
    pub fn add_fade_point(
        &self,
        source: impl Into<SourceRef>,
        clock: u32,
        value: f32,
    ) -> Result<()> {
        let source = source.into();
        {
            let state = self.shared.mix.lock();
            if !source.is_valid(&state.objects) {
                return Err(Error::invalid_handle("add_fade_point"));
            }
        }
        self.push_immediate_command(Command::add_fade_point(source, clock, value))
    }

    /// Fade from the current envelope value to `value` over `length` frames.
    pub fn fade_to(&self, source: impl Into<SourceRef>, value: f32, length: u32) -> Result<()> {
        let source = source.into();
        let target = self
            .with_base(source, "fade_to", |base| base.parent_clock())?
            .wrapping_add(length);
        self.push_immediate_command(Command::fade_to(source, target, value))
    }

    /// Remove fade points with clocks in `[start, end)`.
    pub fn remove_fade_points(
        &self,
        source: impl Into<SourceRef>,
        start: u32,
        end: u32,
    ) -> Result<()> {
        let source = source.into();
        {
            let state = self.shared.mix.lock();
            if !source.is_valid(&state.objects) {
                return Err(Error::invalid_handle("remove_fade_points"));
            }
        }
        self.push_immediate_command(Command::remove_fade_points(source, start, end))
    }

    /// Current fade envelope multiplier.
    pub fn fade_value(&self, source: impl Into<SourceRef>) -> Result<f32> {
        self.with_base(source.into(), "fade_value", |base| base.fade_value())
    }

    // ===== Volume and pan ==================================================

    pub fn volume(&self, source: impl Into<SourceRef>) -> Result<f32> {
        let source = source.into();
        self.ensure_open("volume")?;
        let state = self.shared.mix.lock();
        let handle = source
            .base(&state.objects)
            .map(|base| base.volume())
            .ok_or_else(|| Error::invalid_handle("volume"))?;
        state
            .objects
            .get(handle)
            .map(VolumeEffect::volume)
            .ok_or_else(|| Error::invalid_handle("volume"))
    }

    /// Set the source's volume; 1.0 is unity. Applied on the next `update`.
    pub fn set_volume(&self, source: impl Into<SourceRef>, value: f32) -> Result<()> {
        let source = source.into();
        let handle = self.with_base(source, "set_volume", |base| base.volume())?;
        self.push_command(Command::effect_param(
            EffectRef::Volume(handle),
            VolumeEffect::PARAM_VOLUME,
            ParamValue::Float(value),
        ))
    }

    pub fn pan(&self, source: impl Into<SourceRef>) -> Result<(f32, f32)> {
        let source = source.into();
        self.ensure_open("pan")?;
        let state = self.shared.mix.lock();
        let handle = source
            .base(&state.objects)
            .map(|base| base.panner())
            .ok_or_else(|| Error::invalid_handle("pan"))?;
        state
            .objects
            .get(handle)
            .map(|pan| (pan.left(), pan.right()))
            .ok_or_else(|| Error::invalid_handle("pan"))
    }

    /// Set per-channel pan gains, clamped to `[0, 1]`. Applied on the next
    /// `update`.
    pub fn set_pan(&self, source: impl Into<SourceRef>, left: f32, right: f32) -> Result<()> {
        let source = source.into();
        let handle = self.with_base(source, "set_pan", |base| base.panner())?;
        self.push_command(Command::effect_param(
            EffectRef::Pan(handle),
            PanEffect::PARAM_LEFT,
            ParamValue::Float(left.clamp(0.0, 1.0)),
        ))?;
        self.push_command(Command::effect_param(
            EffectRef::Pan(handle),
            PanEffect::PARAM_RIGHT,
            ParamValue::Float(right.clamp(0.0, 1.0)),
        ))
    }

    // ===== Effect chain ====================================================

    /// Insert a delay into the source's chain at `position`.
    pub fn add_delay(
        &self,
        source: impl Into<SourceRef>,
        position: usize,
        delay_frames: u32,
        wet: f32,
        feedback: f32,
    ) -> Result<Handle<DelayEffect>> {
        let source = source.into();
        self.ensure_open("add_delay")?;
        let handle = {
            let mut state = self.shared.mix.lock();
            if !source.is_valid(&state.objects) {
                return Err(Error::invalid_handle("add_delay"));
            }
            state
                .objects
                .insert(DelayEffect::new(delay_frames, wet, feedback))
        };
        self.push_command(Command::add_effect(source, EffectRef::Delay(handle), position))?;
        Ok(handle)
    }

    /// Insert a user-defined effect into the source's chain at `position`.
    pub fn add_effect(
        &self,
        source: impl Into<SourceRef>,
        effect: Box<dyn Effect>,
        position: usize,
    ) -> Result<Handle<UserEffect>> {
        let source = source.into();
        self.ensure_open("add_effect")?;
        let handle = {
            let mut state = self.shared.mix.lock();
            if !source.is_valid(&state.objects) {
                return Err(Error::invalid_handle("add_effect"));
            }
            state.objects.insert(effect)
        };
        self.push_command(Command::add_effect(source, EffectRef::User(handle), position))?;
        Ok(handle)
    }

    /// Remove an effect from the chain and deallocate it. The default pan and
    /// volume cannot be removed.
    pub fn remove_effect(&self, source: impl Into<SourceRef>, effect: EffectRef) -> Result<()> {
        let source = source.into();
        self.ensure_open("remove_effect")?;
        self.push_command(Command::remove_effect(source, effect))
    }

    pub fn source_effect_count(&self, source: impl Into<SourceRef>) -> Result<usize> {
        self.with_base(source.into(), "source_effect_count", |base| {
            base.effect_count()
        })
    }

    pub fn source_effect_at(
        &self,
        source: impl Into<SourceRef>,
        position: usize,
    ) -> Result<EffectRef> {
        self.with_base(source.into(), "source_effect_at", |base| {
            base.effect_at(position)
        })?
        .ok_or_else(|| Error::new(ErrorCode::OutOfRange, "source_effect_at"))
    }

    pub fn source_panner(&self, source: impl Into<SourceRef>) -> Result<Handle<PanEffect>> {
        self.with_base(source.into(), "source_panner", |base| base.panner())
    }

    /// Send a float parameter to an effect's mailbox.
    pub fn send_effect_float(
        &self,
        effect: impl Into<EffectRef>,
        index: usize,
        value: f32,
    ) -> Result<()> {
        self.push_command(Command::effect_param(
            effect.into(),
            index,
            ParamValue::Float(value),
        ))
    }

    /// Send an integer parameter to an effect's mailbox.
    pub fn send_effect_int(
        &self,
        effect: impl Into<EffectRef>,
        index: usize,
        value: i32,
    ) -> Result<()> {
        self.push_command(Command::effect_param(
            effect.into(),
            index,
            ParamValue::Int(value),
        ))
    }

    /// Send a string parameter to an effect's mailbox.
    pub fn send_effect_str(
        &self,
        effect: impl Into<EffectRef>,
        index: usize,
        value: impl Into<String>,
    ) -> Result<()> {
        self.push_command(Command::effect_param(
            effect.into(),
            index,
            ParamValue::Str(value.into()),
        ))
    }

    // ===== PCM source state ================================================

    /// Seek to a fractional frame position, sample-accurately.
    pub fn pcm_set_position(&self, source: Handle<PcmSource>, frames: f64) -> Result<()> {
        self.ensure_valid(source, "pcm_set_position")?;
        self.push_immediate_command(Command::pcm_set_position(source, frames))
    }

    /// Seek, with the position expressed in `unit`.
    pub fn pcm_set_position_as(
        &self,
        source: Handle<PcmSource>,
        unit: TimeUnit,
        position: u64,
    ) -> Result<()> {
        let engine_spec = self.spec()?;
        let frames = spec::convert(position, unit, TimeUnit::PcmFrames, &engine_spec)?;
        self.pcm_set_position(source, frames)
    }

    pub fn pcm_position(&self, source: Handle<PcmSource>) -> Result<f64> {
        self.with_pcm(source, "pcm_position", PcmSource::position)
    }

    pub fn pcm_set_speed(&self, source: Handle<PcmSource>, speed: f32) -> Result<()> {
        self.ensure_valid(source, "pcm_set_speed")?;
        self.push_command(Command::pcm_set_speed(source, speed))
    }

    pub fn pcm_speed(&self, source: Handle<PcmSource>) -> Result<f32> {
        self.with_pcm(source, "pcm_speed", PcmSource::speed)
    }

    pub fn pcm_set_looping(&self, source: Handle<PcmSource>, looping: bool) -> Result<()> {
        self.ensure_valid(source, "pcm_set_looping")?;
        self.push_command(Command::pcm_set_looping(source, looping))
    }

    pub fn pcm_looping(&self, source: Handle<PcmSource>) -> Result<bool> {
        self.with_pcm(source, "pcm_looping", PcmSource::looping)
    }

    pub fn pcm_set_one_shot(&self, source: Handle<PcmSource>, one_shot: bool) -> Result<()> {
        self.ensure_valid(source, "pcm_set_one_shot")?;
        self.push_command(Command::pcm_set_one_shot(source, one_shot))
    }

    pub fn pcm_one_shot(&self, source: Handle<PcmSource>) -> Result<bool> {
        self.with_pcm(source, "pcm_one_shot", PcmSource::one_shot)
    }

    // ===== Stream source state =============================================

    pub fn stream_position(&self, source: Handle<StreamSource>, unit: TimeUnit) -> Result<f64> {
        self.ensure_open("stream_position")?;
        let state = self.shared.mix.lock();
        state
            .objects
            .get(source)
            .ok_or_else(|| Error::invalid_handle("stream_position"))?
            .position(unit)
    }

    pub fn stream_set_position(
        &self,
        source: Handle<StreamSource>,
        unit: TimeUnit,
        position: u64,
    ) -> Result<()> {
        self.ensure_open("stream_set_position")?;
        let mut state = self.shared.mix.lock();
        state
            .objects
            .get_mut(source)
            .ok_or_else(|| Error::invalid_handle("stream_set_position"))?
            .set_position(unit, position)
    }

    pub fn stream_set_looping(&self, source: Handle<StreamSource>, looping: bool) -> Result<()> {
        self.ensure_open("stream_set_looping")?;
        let mut state = self.shared.mix.lock();
        state
            .objects
            .get_mut(source)
            .ok_or_else(|| Error::invalid_handle("stream_set_looping"))?
            .set_looping(looping);
        Ok(())
    }

    pub fn stream_looping(&self, source: Handle<StreamSource>) -> Result<bool> {
        self.ensure_open("stream_looping")?;
        let state = self.shared.mix.lock();
        state
            .objects
            .get(source)
            .map(StreamSource::looping)
            .ok_or_else(|| Error::invalid_handle("stream_looping"))
    }

    // ===== Bus state =======================================================

    pub fn bus_child_count(&self, bus: Handle<Bus>) -> Result<usize> {
        self.ensure_open("bus_child_count")?;
        let state = self.shared.mix.lock();
        state
            .objects
            .get(bus)
            .map(Bus::child_count)
            .ok_or_else(|| Error::invalid_handle("bus_child_count"))
    }

    pub fn bus_output(&self, bus: Handle<Bus>) -> Result<Option<Handle<Bus>>> {
        self.ensure_open("bus_output")?;
        let state = self.shared.mix.lock();
        state
            .objects
            .get(bus)
            .map(Bus::parent)
            .ok_or_else(|| Error::invalid_handle("bus_output"))
    }

    // ===== Internals =======================================================

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::new(ErrorCode::EngineUninit, op))
        }
    }

    fn ensure_valid(&self, source: Handle<PcmSource>, op: &str) -> Result<()> {
        self.ensure_open(op)?;
        if self.shared.mix.lock().objects.is_valid(source) {
            Ok(())
        } else {
            Err(Error::invalid_handle(op))
        }
    }

    fn with_base<R>(
        &self,
        source: SourceRef,
        op: &str,
        read: impl FnOnce(&SourceBase) -> R,
    ) -> Result<R> {
        self.ensure_open(op)?;
        let state = self.shared.mix.lock();
        source
            .base(&state.objects)
            .map(read)
            .ok_or_else(|| Error::invalid_handle(op))
    }

    fn with_pcm<R>(
        &self,
        source: Handle<PcmSource>,
        op: &str,
        read: impl FnOnce(&PcmSource) -> R,
    ) -> Result<R> {
        self.ensure_open(op)?;
        let state = self.shared.mix.lock();
        state
            .objects
            .get(source)
            .map(read)
            .ok_or_else(|| Error::invalid_handle(op))
    }

}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// The device-facing pull callback: drain the immediate queue, render the
/// master bus, advance the clock tree, and hand the mix to the device.
fn make_pull(shared: Arc<Shared>) -> PullFn {
    Arc::new(move |out: &mut [f32]| {
        if !shared.open.load(Ordering::Acquire) {
            out.fill(0.0);
            return;
        }

        let mut state = shared.mix.lock();

        drain_queue(&mut state, &shared.immediate_rx, &shared.deferred_tx);

        // Effects require multiples of four samples; any ragged tail of the
        // device buffer is zeroed instead of mixed.
        let len = out.len() & !3;
        let master = state.master;

        {
            let MixState {
                objects,
                discard_flag,
                ..
            } = &mut *state;
            let mut ctx = ReadCtx {
                deferred: &shared.deferred_tx,
                discard_flag,
            };
            source::read_source(objects, &mut ctx, SourceRef::Bus(master), len);
        }

        state.clock = state.clock.wrapping_add((len / 2) as u32);
        let clock = state.clock;
        bus::update_parent_clock(&mut state.objects, SourceRef::Bus(master), clock);

        match SourceRef::Bus(master).base(&state.objects) {
            Some(base) => out[..len].copy_from_slice(&base.out_buffer[..len]),
            None => out[..len].fill(0.0),
        }
        out[len..].fill(0.0);
    })
}

fn drain_queue(state: &mut MixState, queue: &Receiver<Command>, deferred_tx: &Sender<Command>) {
    while let Ok(command) = queue.try_recv() {
        apply_command(state, deferred_tx, command);
    }
}

fn apply_command(state: &mut MixState, deferred_tx: &Sender<Command>, command: Command) {
    match command {
        Command::Engine(EngineCommand::ReleaseSource { source, recursive }) => {
            if !source.is_valid(&state.objects) {
                return;
            }
            match source {
                SourceRef::Bus(handle) => {
                    let is_master = state.objects.get(handle).is_some_and(Bus::is_master);
                    if is_master {
                        push_error(Error::new(ErrorCode::Logic, "cannot release the master bus"));
                        return;
                    }
                    let master = state.master;
                    bus::release_bus(&mut state.objects, deferred_tx, master, handle, recursive);
                }
                other => source::release_source_base(&mut state.objects, other),
            }
            state.discard_flag = true;
        }
        Command::Source(command) => {
            source::apply_source_command(&mut state.objects, command.target, command.kind);
        }
        Command::Pcm(command) => {
            if let Some(pcm) = state.objects.get_mut(command.target) {
                pcm.apply_command(command.kind);
            }
        }
        Command::Bus(command) => {
            bus::apply_bus_command(&mut state.objects, command.target, command.kind);
        }
        Command::Effect(command) => {
            command
                .target
                .deliver(&mut state.objects, command.index, &command.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_buffer(frames: usize, value: f32) -> Arc<SoundBuffer> {
        Arc::new(SoundBuffer::new(vec![value; frames * 2], AudioSpec::engine(48_000)).unwrap())
    }

    fn open_engine() -> (Engine, MockDeviceController) {
        let (mut engine, controller) = Engine::with_mock_device();
        engine
            .open(EngineConfig {
                sample_rate: 48_000,
                buffer_frames: 256,
            })
            .unwrap();
        (engine, controller)
    }

    #[test]
    fn open_allocates_master_and_close_is_idempotent() {
        let (mut engine, _controller) = open_engine();
        let master = engine.master_bus().unwrap();
        assert!(engine.is_valid(master));

        engine.close();
        assert!(!engine.is_open());
        engine.close();
        assert!(engine.master_bus().is_err());
    }

    #[test]
    fn operations_before_open_report_uninit() {
        let (engine, _controller) = Engine::with_mock_device();
        let err = engine.master_bus().unwrap_err();
        assert_eq!(err.code, ErrorCode::EngineUninit);
        assert!(engine.update().is_err());
    }

    #[test]
    fn play_sound_is_audible_on_the_next_pull() {
        let (engine, controller) = open_engine();
        let buffer = constant_buffer(48_000, 0.5);
        engine
            .play_sound(&buffer, false, true, false, None)
            .unwrap();

        let out = controller.pump(64);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn play_sound_rejects_unloaded_buffers() {
        let (engine, _controller) = open_engine();
        let buffer = constant_buffer(16, 0.5);
        buffer.unload();
        let err = engine
            .play_sound(&buffer, false, false, false, None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSoundBuffer);
    }

    #[test]
    fn engine_clock_advances_per_pull() {
        let (engine, controller) = open_engine();
        controller.pump(256);
        controller.pump(256);
        assert_eq!(engine.clock().unwrap(), 512);

        let master = engine.master_bus().unwrap();
        assert_eq!(engine.source_parent_clock(master).unwrap(), 512);
    }

    #[test]
    fn update_without_commands_is_a_no_op() {
        let (engine, controller) = open_engine();
        let buffer = constant_buffer(4096, 0.25);
        let sound = engine
            .play_sound(&buffer, false, true, false, None)
            .unwrap();

        engine.update().unwrap();
        engine.update().unwrap();
        assert!(engine.is_valid(sound));
        assert_eq!(engine.bus_child_count(engine.master_bus().unwrap()).unwrap(), 1);

        let out = controller.pump(32);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn released_source_is_swept_on_update() {
        let (engine, _controller) = open_engine();
        let buffer = constant_buffer(128, 0.5);
        let sound = engine
            .play_sound(&buffer, false, false, false, None)
            .unwrap();

        engine.release(sound).unwrap();
        assert!(engine.is_valid(sound));
        engine.update().unwrap();
        assert!(!engine.is_valid(sound));
        assert_eq!(engine.bus_child_count(engine.master_bus().unwrap()).unwrap(), 0);
    }

    #[test]
    fn master_bus_cannot_be_released() {
        let (engine, _controller) = open_engine();
        let master = engine.master_bus().unwrap();
        let err = engine.release_bus(master, true).unwrap_err();
        assert_eq!(err.code, ErrorCode::Logic);
        assert_eq!(engine.release(master).unwrap_err().code, ErrorCode::Logic);
    }

    #[test]
    fn volume_and_pan_apply_through_update() {
        let (engine, controller) = open_engine();
        let buffer = constant_buffer(4096, 0.5);
        let sound = engine
            .play_sound(&buffer, false, true, false, None)
            .unwrap();

        engine.set_volume(sound, 0.5).unwrap();
        engine.set_pan(sound, 1.0, 0.0).unwrap();
        engine.update().unwrap();
        assert_eq!(engine.volume(sound).unwrap(), 0.5);
        assert_eq!(engine.pan(sound).unwrap(), (1.0, 0.0));

        let out = controller.pump(64);
        for frame in out.chunks_exact(2) {
            // Pan runs before volume: both channels fold left, then scale.
            assert!((frame[0] - 0.5).abs() < 1e-6);
            assert_eq!(frame[1], 0.0);
        }
    }

    #[test]
    fn create_bus_attaches_after_update() {
        let (engine, controller) = open_engine();
        let bus = engine.create_bus(false, None).unwrap();
        let master = engine.master_bus().unwrap();
        assert_eq!(engine.bus_child_count(master).unwrap(), 0);

        engine.update().unwrap();
        assert_eq!(engine.bus_child_count(master).unwrap(), 1);
        assert_eq!(engine.bus_output(bus).unwrap(), Some(master));

        let buffer = constant_buffer(4096, 0.25);
        engine
            .play_sound(&buffer, false, true, false, Some(bus))
            .unwrap();
        let out = controller.pump(64);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn commands_on_stale_handles_are_dropped_silently() {
        let (engine, controller) = open_engine();
        let buffer = constant_buffer(128, 0.5);
        let sound = engine
            .play_sound(&buffer, false, false, false, None)
            .unwrap();

        // Enqueue first, release and sweep before the next pull drains it.
        engine
            .push_immediate_command(Command::pcm_set_position(sound, 10.0))
            .unwrap();
        engine.release(sound).unwrap();
        engine.update().unwrap();
        assert!(!engine.is_valid(sound));

        // The stale command is consumed without effect.
        controller.pump(32);
        engine.update().unwrap();
    }
}
