//! The deferred command protocol.
//!
//! A command is a value describing one mutation of the mix graph, targeted at
//! a specific node. Clients enqueue commands from any thread; they are applied
//! in FIFO order on the mix thread, either at the top of an audio pull
//! (immediate queue) or inside `Engine::update` (deferred queue). A command
//! whose target handle went stale between enqueue and apply is dropped
//! silently; that is expected, not an error.

use crate::bus::Bus;
use crate::effects::ParamValue;
use crate::object_pool::{EffectRef, SourceRef};
use crate::pcm::PcmSource;
use crate::pool::Handle;

/// Clock argument meaning "now" (resolved against the target's parent clock).
pub const CLOCK_NOW: u32 = u32::MAX;

/// Top-level command, routed by target type.
#[derive(Debug, Clone)]
pub enum Command {
    Engine(EngineCommand),
    Source(SourceCommand),
    Pcm(PcmCommand),
    Bus(BusCommand),
    Effect(EffectCommand),
}

/// Commands applied by the engine itself.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Run release logic on a source and flag the graph for a removal sweep.
    ReleaseSource { source: SourceRef, recursive: bool },
}

/// Commands applied to any source node's shared state.
#[derive(Debug, Clone)]
pub struct SourceCommand {
    pub target: SourceRef,
    pub kind: SourceCommandKind,
}

#[derive(Debug, Clone)]
pub enum SourceCommandKind {
    /// Schedule a pause (`paused == true`) or unpause at `clock` in parent
    /// frames. Clock 0 cancels the pending event; [`CLOCK_NOW`] was resolved
    /// at enqueue. Replacing a pause clock also replaces `release_on_pause`.
    SetPause {
        paused: bool,
        clock: u32,
        release_on_pause: bool,
    },
    AddEffect {
        effect: EffectRef,
        position: usize,
    },
    RemoveEffect {
        effect: EffectRef,
    },
    AddFadePoint {
        clock: u32,
        value: f32,
    },
    /// Fade from the current envelope value to `value`, arriving at `clock`.
    FadeTo {
        clock: u32,
        value: f32,
    },
    /// Remove fade points in `[start, end)`.
    RemoveFadePoints {
        start: u32,
        end: u32,
    },
}

/// Commands applied to a PCM source.
#[derive(Debug, Clone)]
pub struct PcmCommand {
    pub target: Handle<PcmSource>,
    pub kind: PcmCommandKind,
}

#[derive(Debug, Clone)]
pub enum PcmCommandKind {
    SetPosition { frames: f64 },
    SetSpeed { speed: f32 },
    SetLooping { looping: bool },
    SetOneShot { one_shot: bool },
}

/// Commands applied to a bus.
#[derive(Debug, Clone)]
pub struct BusCommand {
    pub target: Handle<Bus>,
    pub kind: BusCommandKind,
}

#[derive(Debug, Clone)]
pub enum BusCommandKind {
    AppendSource { source: SourceRef },
    RemoveSource { source: SourceRef },
}

/// Parameter write delivered to an effect's mailbox on the mix thread.
#[derive(Debug, Clone)]
pub struct EffectCommand {
    pub target: EffectRef,
    pub index: usize,
    pub value: ParamValue,
}

impl Command {
    pub fn release_source(source: SourceRef, recursive: bool) -> Self {
        Self::Engine(EngineCommand::ReleaseSource { source, recursive })
    }

    pub fn set_pause(
        target: SourceRef,
        paused: bool,
        clock: u32,
        release_on_pause: bool,
    ) -> Self {
        Self::Source(SourceCommand {
            target,
            kind: SourceCommandKind::SetPause {
                paused,
                clock,
                release_on_pause,
            },
        })
    }

    pub fn add_effect(target: SourceRef, effect: EffectRef, position: usize) -> Self {
        Self::Source(SourceCommand {
            target,
            kind: SourceCommandKind::AddEffect { effect, position },
        })
    }

    pub fn remove_effect(target: SourceRef, effect: EffectRef) -> Self {
        Self::Source(SourceCommand {
            target,
            kind: SourceCommandKind::RemoveEffect { effect },
        })
    }

    pub fn add_fade_point(target: SourceRef, clock: u32, value: f32) -> Self {
        Self::Source(SourceCommand {
            target,
            kind: SourceCommandKind::AddFadePoint { clock, value },
        })
    }

    pub fn fade_to(target: SourceRef, clock: u32, value: f32) -> Self {
        Self::Source(SourceCommand {
            target,
            kind: SourceCommandKind::FadeTo { clock, value },
        })
    }

    pub fn remove_fade_points(target: SourceRef, start: u32, end: u32) -> Self {
        Self::Source(SourceCommand {
            target,
            kind: SourceCommandKind::RemoveFadePoints { start, end },
        })
    }

    pub fn pcm_set_position(target: Handle<PcmSource>, frames: f64) -> Self {
        Self::Pcm(PcmCommand {
            target,
            kind: PcmCommandKind::SetPosition { frames },
        })
    }

    pub fn pcm_set_speed(target: Handle<PcmSource>, speed: f32) -> Self {
        Self::Pcm(PcmCommand {
            target,
            kind: PcmCommandKind::SetSpeed { speed },
        })
    }

    pub fn pcm_set_looping(target: Handle<PcmSource>, looping: bool) -> Self {
        Self::Pcm(PcmCommand {
            target,
            kind: PcmCommandKind::SetLooping { looping },
        })
    }

    pub fn pcm_set_one_shot(target: Handle<PcmSource>, one_shot: bool) -> Self {
        Self::Pcm(PcmCommand {
            target,
            kind: PcmCommandKind::SetOneShot { one_shot },
        })
    }

    pub fn bus_append_source(target: Handle<Bus>, source: SourceRef) -> Self {
        Self::Bus(BusCommand {
            target,
            kind: BusCommandKind::AppendSource { source },
        })
    }

    pub fn bus_remove_source(target: Handle<Bus>, source: SourceRef) -> Self {
        Self::Bus(BusCommand {
            target,
            kind: BusCommandKind::RemoveSource { source },
        })
    }

    pub fn effect_param(target: EffectRef, index: usize, value: ParamValue) -> Self {
        Self::Effect(EffectCommand {
            target,
            index,
            value,
        })
    }
}
