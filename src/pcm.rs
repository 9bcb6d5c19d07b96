//! Source playing a decoded in-memory buffer.

use std::sync::Arc;

use crate::buffer::SoundBuffer;
use crate::command::PcmCommandKind;
use crate::object_pool::ObjectPool;
use crate::pool::Handle;
use crate::source::{ReadCtx, SourceBase};

/// Plays a [`SoundBuffer`], optionally looping, at a fractional frame
/// position.
///
/// `speed` advances the read position but the copy itself does not resample;
/// playback data is read at unit rate. A non-looping one-shot source closes
/// itself once the position passes the end of the buffer.
pub struct PcmSource {
    pub(crate) base: SourceBase,
    buffer: Arc<SoundBuffer>,
    position: f64,
    looping: bool,
    one_shot: bool,
    speed: f32,
}

impl PcmSource {
    pub(crate) fn new(
        base: SourceBase,
        buffer: Arc<SoundBuffer>,
        looping: bool,
        one_shot: bool,
        speed: f32,
    ) -> Self {
        Self {
            base,
            buffer,
            position: 0.0,
            looping,
            one_shot,
            speed: speed.max(0.0),
        }
    }

    /// Current play head in fractional frames.
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn buffer(&self) -> &Arc<SoundBuffer> {
        &self.buffer
    }

    pub(crate) fn apply_command(&mut self, kind: PcmCommandKind) {
        match kind {
            PcmCommandKind::SetPosition { frames } => self.position = frames.max(0.0),
            PcmCommandKind::SetSpeed { speed } => self.speed = speed.max(0.0),
            PcmCommandKind::SetLooping { looping } => self.looping = looping,
            PcmCommandKind::SetOneShot { one_shot } => self.one_shot = one_shot,
        }
    }
}

/// Copy buffer data into `out` (pre-zeroed by the caller). Returns samples
/// produced; anything short of `out.len()` means the source ran out of data.
pub(crate) fn read_impl(
    objects: &mut ObjectPool,
    ctx: &mut ReadCtx,
    handle: Handle<PcmSource>,
    out: &mut [f32],
) -> usize {
    let Some(source) = objects.get_mut(handle) else {
        return 0;
    };
    let Some(data) = source.buffer.data() else {
        return 0;
    };

    let samples = data.len();
    let frames = samples / 2;
    if frames == 0 {
        return 0;
    }
    if !source.looping && source.position >= frames as f64 {
        return 0;
    }

    let out_frames = out.len() / 2;
    let frames_to_read = if source.looping {
        out_frames
    } else {
        out_frames.min(frames - source.position.ceil() as usize)
    };
    if frames_to_read == 0 {
        return 0;
    }

    // Straight copy from the play head, wrapping on the ring when looping.
    let start = (source.position as usize % frames) * 2;
    let want = frames_to_read * 2;
    let mut written = 0;
    while written < want {
        let at = (start + written) % samples;
        let run = (samples - at).min(want - written);
        out[written..written + run].copy_from_slice(&data[at..at + run]);
        written += run;
        if !source.looping {
            break;
        }
    }

    let advance = frames_to_read as f64 * source.speed as f64;
    if source.looping {
        source.position = (source.position + advance) % frames as f64;
    } else {
        source.position += advance;
        if source.one_shot && source.position >= frames as f64 {
            ctx.self_close(handle.into());
        }
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::spec::AudioSpec;

    fn setup() -> (
        ObjectPool,
        crossbeam_channel::Sender<Command>,
        crossbeam_channel::Receiver<Command>,
    ) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ObjectPool::new(), tx, rx)
    }

    fn ramp_buffer(frames: usize) -> Arc<SoundBuffer> {
        // Frame n carries (n, -n) so positions are recognizable.
        let mut samples = Vec::with_capacity(frames * 2);
        for n in 0..frames {
            samples.push(n as f32);
            samples.push(-(n as f32));
        }
        Arc::new(SoundBuffer::new(samples, AudioSpec::engine(48_000)).unwrap())
    }

    fn spawn(
        objects: &mut ObjectPool,
        frames: usize,
        looping: bool,
        one_shot: bool,
    ) -> Handle<PcmSource> {
        let base = SourceBase::new(objects, 0, false);
        objects.insert(PcmSource::new(base, ramp_buffer(frames), looping, one_shot, 1.0))
    }

    #[test]
    fn reads_stop_at_the_end_when_not_looping() {
        let (mut objects, tx, _rx) = setup();
        let handle = spawn(&mut objects, 100, false, false);
        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };

        let mut out = vec![0.0; 512];
        let produced = read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert_eq!(produced, 200);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[198], 99.0);
        assert_eq!(out[199], -99.0);

        // Ended source yields nothing further.
        let produced = read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert_eq!(produced, 0);
        assert!(!discard);
    }

    #[test]
    fn looping_read_wraps_around_the_ring() {
        let (mut objects, tx, _rx) = setup();
        let handle = spawn(&mut objects, 64, true, false);
        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };

        let mut out = vec![0.0; 256];
        let produced = read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert_eq!(produced, 256);
        // 128 frames over a 64-frame ring: two full cycles.
        assert_eq!(out[0], 0.0);
        assert_eq!(out[126], 63.0);
        assert_eq!(out[128], 0.0);
        assert_eq!(out[254], 63.0);
        assert_eq!(objects.get(handle).unwrap().position(), 0.0);
    }

    #[test]
    fn one_shot_closes_itself_exactly_once() {
        let (mut objects, tx, rx) = setup();
        let handle = spawn(&mut objects, 100, false, true);
        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };

        let mut out = vec![0.0; 600 * 2];
        read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert!(*ctx.discard_flag);
        assert!(rx.try_recv().is_ok());

        // Subsequent reads return silence without re-queuing a release.
        read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_position_moves_the_play_head() {
        let (mut objects, tx, _rx) = setup();
        let handle = spawn(&mut objects, 100, false, false);

        objects
            .get_mut(handle)
            .unwrap()
            .apply_command(PcmCommandKind::SetPosition { frames: 50.0 });

        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };
        let mut out = vec![0.0; 8];
        read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert_eq!(out[0], 50.0);

        // Past-the-end position reads as ended.
        objects
            .get_mut(handle)
            .unwrap()
            .apply_command(PcmCommandKind::SetPosition { frames: 1000.0 });
        assert_eq!(read_impl(&mut objects, &mut ctx, handle, &mut out), 0);
    }

    #[test]
    fn speed_scales_position_advance() {
        let (mut objects, tx, _rx) = setup();
        let handle = spawn(&mut objects, 1000, false, false);
        objects
            .get_mut(handle)
            .unwrap()
            .apply_command(PcmCommandKind::SetSpeed { speed: 2.0 });

        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };
        let mut out = vec![0.0; 64];
        read_impl(&mut objects, &mut ctx, handle, &mut out);
        assert_eq!(objects.get(handle).unwrap().position(), 64.0);
    }

    #[test]
    fn unloaded_buffer_reads_as_silence() {
        let (mut objects, tx, _rx) = setup();
        let handle = spawn(&mut objects, 100, true, false);
        objects.get(handle).unwrap().buffer().unload();

        let mut discard = false;
        let mut ctx = ReadCtx {
            deferred: &tx,
            discard_flag: &mut discard,
        };
        let mut out = vec![0.0; 64];
        assert_eq!(read_impl(&mut objects, &mut ctx, handle, &mut out), 0);
    }
}
