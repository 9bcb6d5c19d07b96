//! cpal-backed output device.
//!
//! The public handle is Send; a worker thread owns the cpal `Stream` (which
//! is not) and manages its lifecycle through a control channel.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use thread_priority::{set_current_thread_priority, ThreadPriority};

use super::{AudioDevice, DeviceConfig, PullFn};
use crate::error::{Error, ErrorCode, Result};
use crate::spec::AudioSpec;

enum CtrlMsg {
    Open {
        config: DeviceConfig,
        pull: PullFn,
        reply: Sender<Result<AudioSpec>>,
    },
    Suspend,
    Resume,
    Close,
    Shutdown,
}

struct State {
    open: AtomicBool,
    running: AtomicBool,
    sample_rate: AtomicU32,
    buffer_frames: AtomicU32,
}

/// Send-safe handle to a cpal output stream living on a worker thread.
pub struct CpalDevice {
    ctrl_tx: Sender<CtrlMsg>,
    state: Arc<State>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CpalDevice {
    pub fn new() -> Self {
        let (ctrl_tx, ctrl_rx) = unbounded();
        let state = Arc::new(State {
            open: AtomicBool::new(false),
            running: AtomicBool::new(false),
            sample_rate: AtomicU32::new(0),
            buffer_frames: AtomicU32::new(0),
        });

        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name("mixbus-device".to_string())
            .spawn(move || worker_loop(ctrl_rx, worker_state))
            .expect("failed to spawn device worker thread");

        Self {
            ctrl_tx,
            state,
            worker: Some(worker),
        }
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalDevice {
    fn open(&mut self, config: DeviceConfig, pull: PullFn) -> Result<AudioSpec> {
        let (reply_tx, reply_rx) = bounded(1);
        self.ctrl_tx
            .send(CtrlMsg::Open {
                config,
                pull,
                reply: reply_tx,
            })
            .map_err(|_| Error::new(ErrorCode::Backend, "device worker is gone"))?;
        reply_rx
            .recv()
            .map_err(|_| Error::new(ErrorCode::Backend, "device worker dropped the reply"))?
    }

    fn close(&mut self) {
        let _ = self.ctrl_tx.send(CtrlMsg::Close);
    }

    fn suspend(&mut self) {
        let _ = self.ctrl_tx.send(CtrlMsg::Suspend);
    }

    fn resume(&mut self) {
        let _ = self.ctrl_tx.send(CtrlMsg::Resume);
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    fn spec(&self) -> AudioSpec {
        AudioSpec::engine(self.state.sample_rate.load(Ordering::Acquire))
    }

    fn buffer_frames(&self) -> u32 {
        self.state.buffer_frames.load(Ordering::Acquire)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        let _ = self.ctrl_tx.send(CtrlMsg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(ctrl_rx: Receiver<CtrlMsg>, state: Arc<State>) {
    // The stream must stay on this thread; it is not Send.
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(msg) = ctrl_rx.recv() {
        match msg {
            CtrlMsg::Open {
                config,
                pull,
                reply,
            } => {
                let result = build_stream(config, pull);
                let result = match result {
                    Ok((new_stream, spec, frames)) => {
                        // Streams start paused; Resume starts playback.
                        let _ = new_stream.pause();
                        stream = Some(new_stream);
                        state.sample_rate.store(spec.freq, Ordering::Release);
                        state.buffer_frames.store(frames, Ordering::Release);
                        state.open.store(true, Ordering::Release);
                        state.running.store(false, Ordering::Release);
                        Ok(spec)
                    }
                    Err(error) => Err(error),
                };
                let _ = reply.send(result);
            }
            CtrlMsg::Suspend => {
                if let Some(stream) = &stream {
                    if let Err(error) = stream.pause() {
                        tracing::warn!(%error, "failed to pause output stream");
                    } else {
                        state.running.store(false, Ordering::Release);
                    }
                }
            }
            CtrlMsg::Resume => {
                if let Some(stream) = &stream {
                    if let Err(error) = stream.play() {
                        tracing::warn!(%error, "failed to start output stream");
                    } else {
                        state.running.store(true, Ordering::Release);
                    }
                }
            }
            CtrlMsg::Close => {
                stream = None;
                state.open.store(false, Ordering::Release);
                state.running.store(false, Ordering::Release);
            }
            CtrlMsg::Shutdown => break,
        }
    }
}

type BuiltStream = (cpal::Stream, AudioSpec, u32);

fn build_stream(config: DeviceConfig, pull: PullFn) -> Result<BuiltStream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::new(ErrorCode::Backend, "no default output device"))?;

    let sample_rate = if config.sample_rate == 0 {
        device
            .default_output_config()
            .map_err(|e| Error::new(ErrorCode::Backend, e.to_string()))?
            .sample_rate()
            .0
    } else {
        config.sample_rate
    };

    let stream_config = StreamConfig {
        channels: 2,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Fixed(config.buffer_frames),
    };

    let data_pull = Arc::clone(&pull);
    let mut priority_raised = false;
    let data_cb = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        if !priority_raised {
            priority_raised = true;
            if let Err(error) = set_current_thread_priority(ThreadPriority::Max) {
                tracing::warn!(?error, "could not raise audio thread priority");
            }
        }
        data_pull(data);
    };
    let err_cb = |error: cpal::StreamError| {
        tracing::error!(%error, "output stream error");
    };

    let stream = device
        .build_output_stream(&stream_config, data_cb.clone(), err_cb, None)
        .or_else(|_| {
            // Some backends refuse fixed buffer sizes; retry with the default.
            let fallback = StreamConfig {
                buffer_size: BufferSize::Default,
                ..stream_config
            };
            device.build_output_stream(&fallback, data_cb, err_cb, None)
        })
        .map_err(|e| Error::new(ErrorCode::Backend, e.to_string()))?;

    Ok((
        stream,
        AudioSpec::engine(sample_rate),
        config.buffer_frames,
    ))
}

/// Names of the available output devices, default device first with a marker.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let devices = host
        .output_devices()
        .map_err(|e| Error::new(ErrorCode::Backend, e.to_string()))?;

    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if name == default_name {
                names.insert(0, format!("{name} [default]"));
            } else {
                names.push(name);
            }
        }
    }
    Ok(names)
}
