//! Sound card output through cpal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use crate::traits::{AudioError, AudioOutput};

/// Device name that selects the host's default output.
pub const DEFAULT_DEVICE: &str = "default";

/// A stereo output stream on one device.
///
/// Blocks pass through a ring buffer of `latency_frames` frames. `write`
/// waits for room, so the writer is paced by the device; the callback
/// plays silence and counts an underrun when the ring runs dry.
pub struct CpalOutput {
    sample_rate: u32,
    stream: Stream,
    producer: HeapProd<[f32; 2]>,
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
}

impl CpalOutput {
    /// Open `device` by name, or the default output for [`DEFAULT_DEVICE`].
    /// The stream is built paused; call [`AudioOutput::start`].
    pub fn open(device: &str, latency_frames: usize) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = find_device(&host, device)?;
        let supported = device.default_output_config().map_err(|e| AudioError::DeviceInit(e.to_string()))?;
        let mut config: StreamConfig = supported.into();
        config.channels = config.channels.max(2);
        let sample_rate = config.sample_rate.0;

        let ring = HeapRb::<[f32; 2]>::new(latency_frames.max(64));
        let (producer, consumer) = ring.split();
        let running = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicU64::new(0));
        let stream = build_stream(&device, &config, consumer, running.clone(), underruns.clone())?;

        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            latency_frames,
            "opened audio output"
        );
        Ok(Self { sample_rate, stream, producer, running, underruns })
    }

    /// Callbacks that found the ring empty while running.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

fn find_device(host: &Host, name: &str) -> Result<Device, AudioError> {
    if name == DEFAULT_DEVICE {
        return host.default_output_device().ok_or(AudioError::NoDevice);
    }
    let devices = host.output_devices().map_err(|e| AudioError::DeviceInit(e.to_string()))?;
    for device in devices {
        if device.name().is_ok_and(|n| n == name) {
            return Ok(device);
        }
    }
    warn!(name, "audio device not found");
    Err(AudioError::NoDevice)
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<[f32; 2]>,
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
) -> Result<Stream, AudioError> {
    let channels = config.channels as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                data.fill(0.0);
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let mut starved = false;
                for frame in data.chunks_mut(channels) {
                    match (consumer.try_pop(), frame) {
                        (Some([l, r]), [left, right, ..]) => {
                            *left = l;
                            *right = r;
                        }
                        (Some(_), _) => {}
                        (None, _) => starved = true,
                    }
                }
                if starved {
                    underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            |err| error!(%err, "audio stream error"),
            None,
        )
        .map_err(|e| AudioError::StreamCreate(e.to_string()))
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, left: &[f32], right: &[f32]) -> Result<(), AudioError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(AudioError::Playback("stream is stopped".into()));
        }
        for (&l, &r) in left.iter().zip(right) {
            while self.producer.try_push([l, r]).is_err() {
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::Relaxed);
        self.stream.play().map_err(|e| AudioError::Playback(e.to_string()))
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Relaxed);
        debug!(queued = self.producer.occupied_len(), underruns = self.underruns(), "audio output stopped");
        self.stream.pause().map_err(|e| AudioError::Playback(e.to_string()))
    }
}
