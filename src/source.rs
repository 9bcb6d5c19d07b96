//! Shared state and the read pipeline common to every source node.
//!
//! Every node in the mix graph (PCM, stream, bus) embeds a [`SourceBase`].
//! [`read_source`] is the single entry point the graph uses to pull audio out
//! of a node: it walks the request across pending pause/unpause boundaries,
//! lets the node's `read_impl` fill the running stretches, runs the effect
//! chain, applies the fade envelope, and advances the node's sample clock.

use crossbeam_channel::Sender;

use crate::command::Command;
use crate::constants::{DEFAULT_EFFECT_COUNT, PANNER_SLOT, VOLUME_SLOT};
use crate::effects::{PanEffect, VolumeEffect};
use crate::error::{push_error, Error, ErrorCode};
use crate::object_pool::{EffectRef, ObjectPool, SourceRef};
use crate::pool::Handle;

/// One endpoint of a linear fade segment, in parent-clock frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadePoint {
    pub clock: u32,
    pub value: f32,
}

/// State shared by every source node.
///
/// Clocks are in sample frames and wrap. `clock` counts frames this node has
/// produced since creation; `parent_clock` is assigned by the parent after
/// every pull, so scheduled pauses and fade points are expressed on the
/// parent's timeline.
pub struct SourceBase {
    pub(crate) clock: u32,
    pub(crate) parent_clock: u32,
    pub(crate) paused: bool,
    pub(crate) pause_clock: Option<u32>,
    pub(crate) unpause_clock: Option<u32>,
    pub(crate) release_on_pause: bool,
    pub(crate) fade_value: f32,
    pub(crate) fade_points: Vec<FadePoint>,
    pub(crate) effects: Vec<EffectRef>,
    pub(crate) panner: Handle<PanEffect>,
    pub(crate) volume: Handle<VolumeEffect>,
    pub(crate) out_buffer: Vec<f32>,
    pub(crate) in_buffer: Vec<f32>,
    pub(crate) should_discard: bool,
}

impl SourceBase {
    /// Allocate the default pan and volume effects and assemble the base.
    pub(crate) fn new(objects: &mut ObjectPool, parent_clock: u32, paused: bool) -> Self {
        let panner = objects.insert(PanEffect::new());
        let volume = objects.insert(VolumeEffect::default());

        let mut effects = Vec::with_capacity(DEFAULT_EFFECT_COUNT);
        effects.insert(PANNER_SLOT, EffectRef::Pan(panner));
        effects.insert(VOLUME_SLOT, EffectRef::Volume(volume));

        Self {
            clock: 0,
            parent_clock,
            paused,
            pause_clock: None,
            unpause_clock: None,
            release_on_pause: false,
            fade_value: 1.0,
            fade_points: Vec::new(),
            effects,
            panner,
            volume,
            out_buffer: Vec::new(),
            in_buffer: Vec::new(),
            should_discard: false,
        }
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    pub fn parent_clock(&self) -> u32 {
        self.parent_clock
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn fade_value(&self) -> f32 {
        self.fade_value
    }

    pub fn should_discard(&self) -> bool {
        self.should_discard
    }

    pub fn panner(&self) -> Handle<PanEffect> {
        self.panner
    }

    pub fn volume(&self) -> Handle<VolumeEffect> {
        self.volume
    }

    pub fn effect_count(&self) -> usize {
        self.effects.len()
    }

    pub fn effect_at(&self, position: usize) -> Option<EffectRef> {
        self.effects.get(position).copied()
    }

    /// Apply a scheduled pause or unpause.
    ///
    /// Clock 0 cancels the pending event and [`CLOCK_NOW`] means the current
    /// parent clock. A clock in the past snaps to the current parent clock so
    /// it fires on the next read. Replacing the pause clock replaces the
    /// release flag as well, so a stale release cannot outlive the pause it
    /// was attached to.
    pub(crate) fn apply_set_pause(&mut self, paused: bool, clock: u32, release_on_pause: bool) {
        if paused {
            if clock == 0 {
                self.pause_clock = None;
                self.release_on_pause = false;
            } else {
                self.pause_clock = Some(self.schedule_clock(clock));
                self.release_on_pause = release_on_pause;
            }
        } else if clock == 0 {
            self.unpause_clock = None;
        } else {
            self.unpause_clock = Some(self.schedule_clock(clock));
        }
    }

    fn schedule_clock(&self, clock: u32) -> u32 {
        if clock == crate::command::CLOCK_NOW {
            self.parent_clock
        } else {
            clock.max(self.parent_clock)
        }
    }

    /// Insert a fade point keeping the sequence strictly sorted by clock;
    /// a point at an existing clock replaces that point's value.
    pub(crate) fn apply_add_fade_point(&mut self, clock: u32, value: f32) {
        match self.fade_points.binary_search_by_key(&clock, |p| p.clock) {
            Ok(at) => self.fade_points[at].value = value,
            Err(at) => self.fade_points.insert(at, FadePoint { clock, value }),
        }
    }

    /// Remove fade points with clocks in `[start, end)`.
    pub(crate) fn apply_remove_fade_points(&mut self, start: u32, end: u32) {
        self.fade_points
            .retain(|p| p.clock < start || p.clock >= end);
    }

    /// Fade from the current envelope value to `value`, arriving at `clock`.
    pub(crate) fn apply_fade_to(&mut self, clock: u32, value: f32) {
        self.apply_remove_fade_points(self.parent_clock, clock);
        self.apply_add_fade_point(self.parent_clock, self.fade_value);
        self.apply_add_fade_point(clock, value);
    }

    fn apply_add_effect(&mut self, effect: EffectRef, position: usize) {
        let position = position.min(self.effects.len());
        self.effects.insert(position, effect);
    }
}

/// Context threaded through a pull so deep nodes can schedule their own
/// release without a reference back to the engine.
pub(crate) struct ReadCtx<'a> {
    pub deferred: &'a Sender<Command>,
    pub discard_flag: &'a mut bool,
}

impl ReadCtx<'_> {
    /// Enqueue a release for `source` and flag the graph for a sweep.
    pub(crate) fn self_close(&mut self, source: SourceRef) {
        let _ = self.deferred.send(Command::release_source(source, false));
        *self.discard_flag = true;
    }
}

/// Apply a source command on the mix thread. Stale targets are skipped.
pub(crate) fn apply_source_command(
    objects: &mut ObjectPool,
    target: SourceRef,
    kind: crate::command::SourceCommandKind,
) {
    use crate::command::SourceCommandKind as Kind;

    // Effect removal needs pool access; everything else is base-local.
    if let Kind::RemoveEffect { effect } = kind {
        let Some(base) = target.base_mut(objects) else {
            return;
        };
        if effect == EffectRef::Pan(base.panner) || effect == EffectRef::Volume(base.volume) {
            push_error(Error::new(
                ErrorCode::Logic,
                "default pan and volume effects cannot be removed",
            ));
            return;
        }
        let before = base.effects.len();
        base.effects.retain(|e| *e != effect);
        if base.effects.len() != before {
            effect.remove(objects);
        }
        return;
    }

    let Some(base) = target.base_mut(objects) else {
        return;
    };
    match kind {
        Kind::SetPause {
            paused,
            clock,
            release_on_pause,
        } => base.apply_set_pause(paused, clock, release_on_pause),
        Kind::AddEffect { effect, position } => base.apply_add_effect(effect, position),
        Kind::AddFadePoint { clock, value } => base.apply_add_fade_point(clock, value),
        Kind::FadeTo { clock, value } => base.apply_fade_to(clock, value),
        Kind::RemoveFadePoints { start, end } => base.apply_remove_fade_points(start, end),
        Kind::RemoveEffect { .. } => unreachable!("handled above"),
    }
}

/// Run release logic on a source: deallocate its owned effects and mark it
/// for the next removal sweep. The slot itself is returned to the pool by the
/// owning bus's sweep, not here.
pub(crate) fn release_source_base(objects: &mut ObjectPool, source: SourceRef) {
    let effects = {
        let Some(base) = source.base_mut(objects) else {
            return;
        };
        base.should_discard = true;
        std::mem::take(&mut base.effects)
    };
    for effect in effects {
        effect.remove(objects);
    }

    // A stream gives its decoder back eagerly instead of waiting for the
    // sweep to drop the node.
    if let SourceRef::Stream(handle) = source {
        if let Some(stream) = objects.get_mut(handle) {
            stream.close();
        }
    }
}

/// Pull `len` samples (interleaved stereo f32, `len` a multiple of 4) out of
/// a source node into its own output scratch. Returns the samples produced;
/// the produced data is in the node's `out_buffer`.
pub(crate) fn read_source(
    objects: &mut ObjectPool,
    ctx: &mut ReadCtx,
    source: SourceRef,
    len: usize,
) -> usize {
    debug_assert!(len % 2 == 0, "read length must be whole stereo frames");

    // Detach the scratch buffers and snapshot pause state so the node can be
    // re-borrowed (and recursed into) while this frame of the pipeline runs.
    let (mut out, mut inb, mut paused, pause_clock, unpause_clock, mut release_on_pause, parent_clock) = {
        let Some(base) = source.base_mut(objects) else {
            return 0;
        };
        let mut out = std::mem::take(&mut base.out_buffer);
        let mut inb = std::mem::take(&mut base.in_buffer);
        if out.len() < len {
            out.resize(len, 0.0);
        }
        if inb.len() < len {
            inb.resize(len, 0.0);
        }
        out[..len].fill(0.0);
        (
            out,
            inb,
            base.paused,
            base.pause_clock,
            base.unpause_clock,
            base.release_on_pause,
            base.parent_clock,
        )
    };

    // Offsets of the scheduled events relative to the start of this request,
    // in frames. Clocks already in the past snap to "now".
    let offset_of = |clock: Option<u32>| -> Option<i64> {
        clock.map(|c| (c as i64 - parent_clock as i64).max(0))
    };
    let mut pause_off = offset_of(pause_clock);
    let mut unpause_off = offset_of(unpause_clock);
    let mut pause_abs = pause_clock;
    let mut unpause_abs = unpause_clock;

    let mut i = 0usize;
    let mut closed = false;
    while i < len {
        let remaining_frames = ((len - i) / 2) as i64;

        if paused {
            // Silent until an unpause lands inside this chunk.
            let Some(off) = unpause_off.filter(|off| *off < remaining_frames) else {
                break;
            };
            i += off as usize * 2;
            if pause_off.is_some_and(|p| p < off) {
                // A pause scheduled before the unpause is already stale.
                pause_off = None;
                pause_abs = None;
            }
            if let Some(p) = &mut pause_off {
                *p -= off;
            }
            unpause_off = None;
            unpause_abs = None;
            paused = false;
            continue;
        }

        let pause_now = pause_off.is_some_and(|p| p < remaining_frames);
        let to_read = if pause_now {
            pause_off.unwrap_or(0) as usize * 2
        } else {
            len - i
        };

        let mut produced = 0;
        if to_read > 0 {
            produced = read_impl(objects, ctx, source, &mut out[i..i + to_read]);
        }
        i += produced;

        if pause_now {
            if unpause_off.is_some_and(|u| u < pause_off.unwrap_or(0)) {
                // An unpause scheduled before the pause is already stale.
                unpause_off = None;
                unpause_abs = None;
            }
            paused = true;
            pause_off = None;
            pause_abs = None;
            if release_on_pause {
                release_on_pause = false;
                closed = true;
                break;
            }
        }

        let consumed = (to_read / 2) as i64;
        if let Some(p) = &mut pause_off {
            *p -= consumed;
        }
        if let Some(u) = &mut unpause_off {
            *u -= consumed;
        }

        if produced < to_read {
            // Node ran out of data; the rest of the request stays silent.
            break;
        }
    }

    // Write pause bookkeeping back before the effect chain runs.
    let effects = {
        let Some(base) = source.base_mut(objects) else {
            // The node released itself mid-read; drop the detached buffers.
            return 0;
        };
        base.paused = paused;
        base.pause_clock = pause_abs;
        base.unpause_clock = unpause_abs;
        base.release_on_pause = release_on_pause;
        std::mem::take(&mut base.effects)
    };

    if closed {
        ctx.self_close(source);
    }

    // Effect chain: each effect that writes swaps the scratch buffers; a
    // bypassing effect costs nothing.
    for effect in &effects {
        match effect.process(objects, &out[..len], &mut inb[..len]) {
            Some(true) => {
                std::mem::swap(&mut out, &mut inb);
                inb[..len].fill(0.0);
            }
            Some(false) | None => {}
        }
    }

    if let Some(base) = source.base_mut(objects) {
        base.effects = effects;
        apply_fade(base, &mut out[..len]);
        base.clock = base.clock.wrapping_add((len / 2) as u32);
        base.out_buffer = out;
        base.in_buffer = inb;
        len
    } else {
        0
    }
}

fn read_impl(objects: &mut ObjectPool, ctx: &mut ReadCtx, source: SourceRef, out: &mut [f32]) -> usize {
    match source {
        SourceRef::Pcm(handle) => crate::pcm::read_impl(objects, ctx, handle, out),
        SourceRef::Stream(handle) => crate::stream::read_impl(objects, ctx, handle, out),
        SourceRef::Bus(handle) => crate::bus::read_impl(objects, ctx, handle, out),
    }
}

/// Index of the last fade point with `clock <= target` (-1 when none), and
/// whether a following point exists to interpolate toward.
fn find_fade_segment(points: &[FadePoint], clock: u32) -> (isize, bool) {
    let after = points.partition_point(|p| p.clock <= clock);
    (after as isize - 1, after < points.len())
}

/// Multiply the produced samples by the fade envelope, frame by frame, then
/// drop every fade point fully behind the segment active at the end of the
/// buffer.
fn apply_fade(base: &mut SourceBase, out: &mut [f32]) {
    let mut fade_clock = base.parent_clock;
    let mut last_index: isize = -1;
    let mut s = 0usize;
    let total = out.len();

    while s < total {
        let (index, in_fade) = find_fade_segment(&base.fade_points, fade_clock);
        last_index = last_index.max(index);
        let remaining_frames = (total - s) / 2;

        if in_fade {
            let p0 = base.fade_points[index as usize];
            let p1 = base.fade_points[index as usize + 1];
            let span = (p1.clock - p0.clock) as f32;
            let value_diff = p1.value - p0.value;

            // Interpolate up to and including the segment's end point.
            let seg_frames = (p1.clock - fade_clock) as usize + 1;
            let n = remaining_frames.min(seg_frames);
            for _ in 0..n {
                let amount = (fade_clock - p0.clock) as f32 / span;
                let value = p0.value + value_diff * amount;
                out[s] *= value;
                out[s + 1] *= value;
                base.fade_value = value;
                s += 2;
                fade_clock = fade_clock.wrapping_add(1);
            }
            if fade_clock > p1.clock {
                base.fade_value = p1.value;
            }
        } else {
            // Flat region: hold the current value until the next point.
            let n = match base.fade_points.get((index + 1) as usize) {
                Some(next) => remaining_frames.min((next.clock - fade_clock) as usize),
                None => remaining_frames,
            };
            if base.fade_value != 1.0 {
                let value = base.fade_value;
                for frame in out[s..s + n * 2].chunks_exact_mut(2) {
                    frame[0] *= value;
                    frame[1] *= value;
                }
            }
            s += n * 2;
            fade_clock = fade_clock.wrapping_add(n as u32);
        }
    }

    if last_index > 0 {
        base.fade_points.drain(0..last_index as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SoundBuffer;
    use crate::pcm::PcmSource;
    use crate::spec::AudioSpec;
    use std::sync::Arc;

    fn constant_buffer(frames: usize, value: f32) -> Arc<SoundBuffer> {
        Arc::new(SoundBuffer::new(vec![value; frames * 2], AudioSpec::engine(48_000)).unwrap())
    }

    struct Harness {
        objects: ObjectPool,
        deferred: (Sender<Command>, crossbeam_channel::Receiver<Command>),
        discard: bool,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                objects: ObjectPool::new(),
                deferred: crossbeam_channel::unbounded(),
                discard: false,
            }
        }

        fn spawn(&mut self, frames: usize, value: f32, looping: bool) -> Handle<PcmSource> {
            let buffer = constant_buffer(frames, value);
            let base = SourceBase::new(&mut self.objects, 0, false);
            self.objects
                .insert(PcmSource::new(base, buffer, looping, false, 1.0))
        }

        fn read(&mut self, source: SourceRef, len: usize) -> Vec<f32> {
            let mut ctx = ReadCtx {
                deferred: &self.deferred.0,
                discard_flag: &mut self.discard,
            };
            let produced = read_source(&mut self.objects, &mut ctx, source, len);
            assert_eq!(produced, len);
            source.base(&self.objects).unwrap().out_buffer[..len].to_vec()
        }

        fn base_mut(&mut self, source: SourceRef) -> &mut SourceBase {
            source.base_mut(&mut self.objects).unwrap()
        }

        fn advance_parent(&mut self, source: SourceRef, frames: u32) {
            let base = self.base_mut(source);
            base.parent_clock = base.parent_clock.wrapping_add(frames);
        }
    }

    #[test]
    fn clock_advances_by_frames_read() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 0.5, true));

        h.read(src, 512);
        assert_eq!(h.base_mut(src).clock, 256);
        h.read(src, 128);
        assert_eq!(h.base_mut(src).clock, 320);
    }

    #[test]
    fn fade_points_stay_sorted_and_deduped() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(64, 0.0, true));
        let base = h.base_mut(src);

        base.apply_add_fade_point(500, 0.5);
        base.apply_add_fade_point(100, 0.1);
        base.apply_add_fade_point(300, 0.3);
        base.apply_add_fade_point(300, 0.9);

        let clocks: Vec<u32> = base.fade_points.iter().map(|p| p.clock).collect();
        assert_eq!(clocks, vec![100, 300, 500]);
        assert_eq!(base.fade_points[1].value, 0.9);

        base.apply_remove_fade_points(100, 500);
        let clocks: Vec<u32> = base.fade_points.iter().map(|p| p.clock).collect();
        assert_eq!(clocks, vec![500]);
    }

    #[test]
    fn fade_interpolates_linearly_between_points() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        let base = h.base_mut(src);
        base.apply_add_fade_point(0, 1.0);
        base.apply_add_fade_point(1000, 0.0);

        let out = h.read(src, 2048);
        // Frame f is scaled by 1 - f/1000.
        assert!((out[0] - 1.0).abs() < 1e-6);
        let frame = 500;
        assert!((out[frame * 2] - 0.5).abs() < 1e-6);
        // Past the last point the envelope holds its final value.
        assert_eq!(out[1001 * 2], 0.0);
        assert_eq!(out[1023 * 2], 0.0);
        assert_eq!(h.base_mut(src).fade_value, 0.0);
    }

    #[test]
    fn fade_to_builds_segment_from_current_value() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        let base = h.base_mut(src);
        base.apply_fade_to(1000, 0.0);

        let clocks: Vec<u32> = base.fade_points.iter().map(|p| p.clock).collect();
        assert_eq!(clocks, vec![0, 1000]);
        assert_eq!(base.fade_points[0].value, 1.0);
        assert_eq!(base.fade_points[1].value, 0.0);
    }

    #[test]
    fn passed_fade_points_are_compacted() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        let base = h.base_mut(src);
        base.apply_add_fade_point(0, 1.0);
        base.apply_add_fade_point(10, 0.5);
        base.apply_add_fade_point(2000, 0.25);

        h.read(src, 512);
        // Frames 0..256 passed the (0, 1.0) and (10, 0.5) points; the active
        // segment is (10, 0.5) -> (2000, 0.25), so exactly one stale point is
        // dropped and the segment start survives.
        let clocks: Vec<u32> = h
            .base_mut(src)
            .fade_points
            .iter()
            .map(|p| p.clock)
            .collect();
        assert_eq!(clocks, vec![10, 2000]);
    }

    #[test]
    fn scheduled_pause_zeroes_the_tail() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        h.base_mut(src).apply_set_pause(true, 100, false);

        let out = h.read(src, 512);
        assert!(out[..200].iter().all(|&s| s == 1.0));
        assert!(out[200..].iter().all(|&s| s == 0.0));
        assert!(h.base_mut(src).paused);
        assert_eq!(h.base_mut(src).pause_clock, None);
    }

    #[test]
    fn scheduled_unpause_fills_the_tail() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        {
            let base = h.base_mut(src);
            base.paused = true;
            base.apply_set_pause(false, 64, false);
        }

        let out = h.read(src, 512);
        assert!(out[..128].iter().all(|&s| s == 0.0));
        assert!(out[128..].iter().all(|&s| s == 1.0));
        assert!(!h.base_mut(src).paused);
    }

    #[test]
    fn pause_then_unpause_in_one_chunk_resumes() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        {
            let base = h.base_mut(src);
            base.apply_set_pause(true, 50, false);
            base.apply_set_pause(false, 100, false);
        }

        let out = h.read(src, 512);
        assert!(out[..100].iter().all(|&s| s == 1.0));
        assert!(out[100..200].iter().all(|&s| s == 0.0));
        assert!(out[200..].iter().all(|&s| s == 1.0));
        assert!(!h.base_mut(src).paused);
    }

    #[test]
    fn past_pause_clock_snaps_to_parent_clock() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        h.read(src, 512);
        h.advance_parent(src, 256);

        let base = h.base_mut(src);
        base.apply_set_pause(true, 10, false);
        assert_eq!(base.pause_clock, Some(256));

        // Pause fires on the very first frame of the next read.
        let out = h.read(src, 512);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(h.base_mut(src).paused);
    }

    #[test]
    fn replacing_a_pause_clears_release_flag() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        let base = h.base_mut(src);

        base.apply_set_pause(true, 1000, true);
        assert!(base.release_on_pause);
        base.apply_set_pause(true, 2000, false);
        assert!(!base.release_on_pause);

        // Cancelling outright clears both.
        base.apply_set_pause(true, 500, true);
        base.apply_set_pause(true, 0, false);
        assert_eq!(base.pause_clock, None);
        assert!(!base.release_on_pause);
    }

    #[test]
    fn release_on_pause_closes_the_source() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        h.base_mut(src).apply_set_pause(true, 100, true);

        h.read(src, 512);
        assert!(h.discard);
        let queued = h.deferred.1.try_recv().expect("release command queued");
        assert!(matches!(
            queued,
            Command::Engine(crate::command::EngineCommand::ReleaseSource { recursive: false, .. })
        ));
    }

    #[test]
    fn paused_source_produces_silence_but_keeps_clocking() {
        let mut h = Harness::new();
        let src = SourceRef::from(h.spawn(4096, 1.0, true));
        h.base_mut(src).paused = true;

        let out = h.read(src, 256);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.base_mut(src).clock, 128);
    }
}
