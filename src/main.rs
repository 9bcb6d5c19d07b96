//! Demo player: mixes a WAV file (or a generated tone) through the engine
//! with optional pan, volume, and fade-out, standing in for the external
//! loader and host the library normally serves.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mixbus::{device, Engine, EngineConfig, SoundBuffer, TimeUnit};

#[derive(Parser)]
#[command(name = "mixbus", about = "Play a WAV file or a test tone through the mix engine")]
struct Args {
    /// WAV file to play; a sine tone is generated when omitted
    wav: Option<String>,

    /// Output sample rate in Hz (0 = device default)
    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,

    /// Device buffer size in frames
    #[arg(long, default_value_t = 1024)]
    buffer_frames: u32,

    /// Tone frequency in Hz when no WAV is given
    #[arg(long, default_value_t = 440.0)]
    tone_hz: f32,

    /// Playback length in seconds for the generated tone
    #[arg(long, default_value_t = 2.0)]
    tone_secs: f32,

    /// Linear volume, 1.0 = unity
    #[arg(long, default_value_t = 1.0)]
    volume: f32,

    /// Left channel pan gain in [0, 1]
    #[arg(long, default_value_t = 1.0)]
    pan_left: f32,

    /// Right channel pan gain in [0, 1]
    #[arg(long, default_value_t = 1.0)]
    pan_right: f32,

    /// Fade out over this many milliseconds at the end
    #[arg(long, default_value_t = 250)]
    fade_out_ms: u32,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        match device::list_output_devices() {
            Ok(names) => {
                println!("Available output devices:");
                for name in names {
                    println!("  {name}");
                }
            }
            Err(error) => {
                eprintln!("failed to list devices: {error}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(error) = run(&args) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> mixbus::Result<()> {
    let mut engine = Engine::new();
    let spec = engine.open(EngineConfig {
        sample_rate: args.sample_rate,
        buffer_frames: args.buffer_frames,
    })?;
    tracing::info!(rate = spec.freq, "device open");

    let buffer = match &args.wav {
        Some(path) => Arc::new(load_wav(path, spec.freq)?),
        None => Arc::new(sine_buffer(spec.freq, args.tone_hz, args.tone_secs)?),
    };

    let seconds = buffer.duration(TimeUnit::Millis)? / 1000.0;
    tracing::info!(seconds, "playing");

    let sound = engine.play_sound(&buffer, true, false, true, None)?;
    engine.set_volume(sound, args.volume)?;
    engine.set_pan(sound, args.pan_left, args.pan_right)?;

    // Parameters land on the next update; unpause once they are in place.
    engine.update()?;

    if args.fade_out_ms > 0 {
        let total_frames = buffer.frame_count() as u32;
        let fade_frames =
            (args.fade_out_ms as u64 * spec.freq as u64 / 1000).min(total_frames as u64) as u32;
        // Fade clocks live on the parent bus's timeline, counted from the
        // point playback starts.
        let start = engine.source_parent_clock(sound)?;
        engine.add_fade_point(
            sound,
            start.wrapping_add(total_frames - fade_frames),
            1.0,
        )?;
        engine.add_fade_point(sound, start.wrapping_add(total_frames), 0.0)?;
    }

    engine.set_paused(sound, false)?;

    // The one-shot source releases itself at the end; updates sweep it out.
    while engine.is_valid(sound) {
        engine.update()?;
        std::thread::sleep(Duration::from_millis(10));
    }
    engine.update()?;
    engine.close();
    Ok(())
}

/// Load a WAV into the engine format. The demo refuses rate mismatches
/// instead of resampling.
fn load_wav(path: &str, engine_rate: u32) -> mixbus::Result<SoundBuffer> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| mixbus::Error::new(mixbus::ErrorCode::FileOpen, e.to_string()))?;
    let wav_spec = reader.spec();

    if wav_spec.sample_rate != engine_rate {
        return Err(mixbus::Error::new(
            mixbus::ErrorCode::Unsupported,
            format!(
                "WAV is {} Hz but the device is {} Hz; resample it first",
                wav_spec.sample_rate, engine_rate
            ),
        ));
    }

    let to_f32: Box<dyn Iterator<Item = f32> + '_> = match wav_spec.sample_format {
        hound::SampleFormat::Float => Box::new(
            reader
                .samples::<f32>()
                .map(|s| s.unwrap_or(0.0)),
        ),
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (wav_spec.bits_per_sample - 1)) as f32;
            Box::new(
                reader
                    .samples::<i32>()
                    .map(move |s| s.unwrap_or(0) as f32 * scale),
            )
        }
    };

    let mut samples = Vec::new();
    match wav_spec.channels {
        1 => {
            for sample in to_f32 {
                samples.push(sample);
                samples.push(sample);
            }
        }
        2 => samples.extend(to_f32),
        n => {
            // Keep the first two channels of anything wider.
            let n = n as usize;
            for (i, sample) in to_f32.enumerate() {
                if i % n < 2 {
                    samples.push(sample);
                }
            }
        }
    }

    SoundBuffer::new(samples, mixbus::AudioSpec::engine(engine_rate))
}

fn sine_buffer(rate: u32, hz: f32, seconds: f32) -> mixbus::Result<SoundBuffer> {
    let frames = (rate as f32 * seconds) as usize;
    let mut samples = Vec::with_capacity(frames * 2);
    for n in 0..frames {
        let t = n as f32 / rate as f32;
        let value = (t * hz * std::f32::consts::TAU).sin() * 0.5;
        samples.push(value);
        samples.push(value);
    }
    SoundBuffer::new(samples, mixbus::AudioSpec::engine(rate))
}
