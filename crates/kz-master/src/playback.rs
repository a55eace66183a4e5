//! The playback thread: renders every engine into the audio device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use kz_audio::{AudioError, AudioOutput, CpalOutput};
use kz_engine::SharedEngine;
use tracing::{debug, error, warn};

use crate::config::AudioConfig;
use crate::ControllerError;

pub(crate) struct PlaybackHandle {
    stop_signal: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    /// Start the thread and wait until the device is open.
    pub fn spawn(engines: Vec<SharedEngine>, audio: &AudioConfig) -> Result<Self, ControllerError> {
        let block = audio.buffer_frames.max(1);
        let device = audio.device.clone();
        let stop_signal = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let stop = stop_signal.clone();
        let count = frames.clone();
        let done = finished.clone();
        let thread = std::thread::Builder::new()
            .name("kz-playback".into())
            .spawn(move || {
                audio_thread(engines, &device, block, stop, count, done, ready_tx);
            })
            .map_err(|e| AudioError::Playback(e.to_string()))?;

        let mut handle = Self { stop_signal, frames, finished, thread: Some(thread) };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                handle.join();
                Err(e.into())
            }
            Err(_) => {
                handle.join();
                Err(AudioError::Playback("playback thread exited".into()).into())
            }
        }
    }

    pub fn stop(mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        self.join();
    }

    pub fn is_running(&self) -> bool {
        !self.finished.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("playback thread panicked");
            }
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        self.join();
    }
}

fn audio_thread(
    engines: Vec<SharedEngine>,
    device: &str,
    block: usize,
    stop_signal: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    ready: crossbeam_channel::Sender<Result<(), AudioError>>,
) {
    // Four blocks of headroom between the renderer and the device.
    let opened = CpalOutput::open(device, block * 4).and_then(|mut output| {
        output.start()?;
        Ok(output)
    });
    let mut output = match opened {
        Ok(output) => output,
        Err(e) => {
            finished.store(true, Ordering::Relaxed);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let rate = output.sample_rate();
    for engine in &engines {
        let engine_rate = engine.lock().sample_rate();
        if engine_rate != rate {
            warn!(engine_rate, device_rate = rate, "engine and device sample rates differ");
        }
    }

    let mut left = vec![0.0f32; block];
    let mut right = vec![0.0f32; block];
    let mut scratch_l = vec![0.0f32; block];
    let mut scratch_r = vec![0.0f32; block];
    while !stop_signal.load(Ordering::Relaxed) {
        mix_engines(&engines, &mut left, &mut right, &mut scratch_l, &mut scratch_r);
        if let Err(e) = output.write(&left, &right) {
            error!(error = %e, "audio write failed");
            break;
        }
        frames.fetch_add(block as u64, Ordering::Relaxed);
    }

    // Let the device drain before the stream is dropped.
    left.fill(0.0);
    right.fill(0.0);
    for _ in 0..(rate as usize / 10).div_ceil(block) {
        if output.write(&left, &right).is_err() {
            break;
        }
    }
    if let Err(e) = output.stop() {
        warn!(error = %e, "audio output did not stop cleanly");
    }
    debug!(frames = frames.load(Ordering::Relaxed), underruns = output.underruns(), "playback thread exiting");
    finished.store(true, Ordering::Relaxed);
}

/// Render every engine and sum into `left`/`right`. An engine whose lock is
/// held by the control side is disabled and contributes silence. The
/// scratch buffers only grow, so steady-state calls do not allocate.
pub(crate) fn mix_engines(
    engines: &[SharedEngine],
    left: &mut [f32],
    right: &mut [f32],
    scratch_l: &mut Vec<f32>,
    scratch_r: &mut Vec<f32>,
) {
    let n = left.len().min(right.len());
    left.fill(0.0);
    right.fill(0.0);
    if scratch_l.len() < n {
        scratch_l.resize(n, 0.0);
        scratch_r.resize(n, 0.0);
    }
    for engine in engines {
        let Some(mut engine) = engine.try_lock() else { continue };
        engine.render(&mut scratch_l[..n], &mut scratch_r[..n]);
        for i in 0..n {
            left[i] += scratch_l[i];
            right[i] += scratch_r[i];
        }
    }
}
