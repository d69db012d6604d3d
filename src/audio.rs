use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use futures_util::future::{BoxFuture, FutureExt};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapRb,
};

use crate::media::{LocalTrack, MediaSource};
use crate::peer::RemoteTrack;
use crate::sink::{AudioOutput, PlaybackHandle};
use crate::types::{AudioDevice, DecodedFrame, EncodedFrame, FRAME_SIZE, SAMPLE_RATE};

// ── Microphone ──

/// Native capture source backed by cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
    noise_suppression: bool,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>, noise_suppression: bool) -> Self {
        Self {
            device_name,
            noise_suppression,
        }
    }
}

impl MediaSource for CpalMicrophone {
    fn acquire(&self) -> BoxFuture<'static, Result<Option<Arc<dyn LocalTrack>>>> {
        let device_name = self.device_name.clone();
        let noise_suppression = self.noise_suppression;
        async move {
            let track = CaptureTrack::open(device_name, noise_suppression).await?;
            Ok(Some(Arc::new(track) as Arc<dyn LocalTrack>))
        }
        .boxed()
    }
}

/// Opus-encoded microphone track running on its own capture thread.
pub struct CaptureTrack {
    id: String,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    encoded_rx: flume::Receiver<EncodedFrame>,
}

impl CaptureTrack {
    /// Resolves once the device is open and capturing, or with the device error.
    pub async fn open(device_name: Option<String>, noise_suppression: bool) -> Result<Self> {
        let enabled = Arc::new(AtomicBool::new(true));
        let stopped = Arc::new(AtomicBool::new(false));
        let (encoded_tx, encoded_rx) = flume::unbounded::<EncodedFrame>();
        let (ready_tx, ready_rx) = flume::bounded::<Result<()>>(1);

        let flags = CaptureFlags {
            enabled: Arc::clone(&enabled),
            stopped: Arc::clone(&stopped),
            noise_suppression,
        };
        std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || run_capture(device_name, flags, encoded_tx, ready_tx))?;

        ready_rx
            .recv_async()
            .await
            .context("Audio capture thread exited before opening the device")??;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            enabled,
            stopped,
            encoded_rx,
        })
    }
}

impl LocalTrack for CaptureTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn frames(&self) -> Option<flume::Receiver<EncodedFrame>> {
        Some(self.encoded_rx.clone())
    }
}

impl Drop for CaptureTrack {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

struct CaptureFlags {
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    noise_suppression: bool,
}

struct OpenInput {
    // Dropping the stream stops the device, so it lives as long as the loop.
    _stream: cpal::Stream,
    consumer: HeapCons<f32>,
    rate: u32,
    channels: u16,
}

fn open_input(device_name: Option<&str>, enabled: Arc<AtomicBool>) -> Result<OpenInput> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .context("Failed to enumerate input devices")?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .with_context(|| format!("Input device '{name}' not found, falling back to default"))
            .or_else(|e| {
                tracing::warn!("{e}");
                host.default_input_device()
                    .context("No input audio device found")
            })?,
        None => host
            .default_input_device()
            .context("No input audio device found")?,
    };

    tracing::info!("Using input device: {:?}", device.name());

    let default_config = device
        .default_input_config()
        .context("Microphone access denied or device busy")?;
    let rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    tracing::info!(
        "Input device config: {}Hz, {} channels (target: {}Hz mono)",
        rate,
        channels,
        SAMPLE_RATE
    );

    let config = cpal::StreamConfig {
        channels,
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // ~200ms of device audio
    let ring = HeapRb::<f32>::new((rate as usize / 5) * channels as usize);
    let (mut producer, consumer) = ring.split();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if !enabled.load(Ordering::Relaxed) {
                return;
            }
            let _ = producer.push_slice(data);
        },
        move |err| {
            tracing::error!("Audio input error: {err}");
        },
        None,
    )?;
    stream.play().context("Failed to start microphone stream")?;

    Ok(OpenInput {
        _stream: stream,
        consumer,
        rate,
        channels,
    })
}

fn run_capture(
    device_name: Option<String>,
    flags: CaptureFlags,
    encoded_tx: flume::Sender<EncodedFrame>,
    ready_tx: flume::Sender<Result<()>>,
) {
    let mut input = match open_input(device_name.as_deref(), Arc::clone(&flags.enabled)) {
        Ok(input) => input,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut encoder = match new_encoder() {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    // RNNoise works on 480-sample frames in i16 range
    const DENOISE_FRAME: usize = nnnoiseless::FRAME_SIZE;
    let mut denoise = nnnoiseless::DenoiseState::new();
    let mut denoise_in = vec![0.0f32; DENOISE_FRAME];
    let mut denoise_out = vec![0.0f32; DENOISE_FRAME];

    // 20ms worth of interleaved device samples
    let device_frame_samples = (input.rate as usize / 50) * input.channels as usize;
    let mut device_buf = vec![0.0f32; device_frame_samples];
    let mut frame = vec![0.0f32; FRAME_SIZE];
    let mut opus_buf = vec![0u8; 4000];

    while !flags.stopped.load(Ordering::Relaxed) {
        if input.consumer.occupied_len() < device_frame_samples {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        input.consumer.pop_slice(&mut device_buf);

        let mono = downmix(&device_buf, input.channels);
        resample_into(&mono, input.rate, SAMPLE_RATE, &mut frame);

        if flags.noise_suppression {
            for chunk in frame.chunks_mut(DENOISE_FRAME) {
                for (dst, src) in denoise_in.iter_mut().zip(chunk.iter()) {
                    *dst = src * 32767.0;
                }
                denoise.process_frame(&mut denoise_out, &denoise_in);
                for (dst, src) in chunk.iter_mut().zip(denoise_out.iter()) {
                    *dst = src / 32767.0;
                }
            }
        }

        match encoder.encode_float(&frame, &mut opus_buf) {
            Ok(len) => {
                let encoded = EncodedFrame {
                    data: opus_buf[..len].to_vec(),
                };
                if encoded_tx.send(encoded).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Opus encode error: {e}");
            }
        }
    }

    tracing::info!("Audio capture stopped");
}

fn new_encoder() -> Result<opus::Encoder> {
    let mut encoder =
        opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| anyhow::anyhow!("Failed to create opus encoder: {e}"))?;
    let _ = encoder.set_bitrate(opus::Bitrate::Bits(64_000));
    let _ = encoder.set_inband_fec(true);
    let _ = encoder.set_packet_loss_perc(10);
    let _ = encoder.set_vbr(true);
    Ok(encoder)
}

// ── Device enumeration ──

pub fn list_input_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devs) => devs,
        Err(e) => {
            tracing::error!("Failed to enumerate input devices: {e}");
            return Vec::new();
        }
    };

    devices
        .filter_map(|d| {
            let name = d.name().ok()?;
            let is_default = default_name.as_deref() == Some(&name);
            Some(AudioDevice { name, is_default })
        })
        .collect()
}

// ── Speaker ──

/// Native playback backed by cpal.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalSpeaker;

impl AudioOutput for CpalSpeaker {
    fn start(&self, track: RemoteTrack) -> Result<Box<dyn PlaybackHandle>> {
        Ok(Box::new(AudioPlayback::start(track.frames)?))
    }
}

/// One remote stream playing on the default output device.
pub struct AudioPlayback {
    stop: Arc<AtomicBool>,
}

impl AudioPlayback {
    pub fn start(frames: flume::Receiver<DecodedFrame>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                if let Err(e) = run_playback(frames, stop_flag) {
                    tracing::error!("Audio playback thread error: {e}");
                }
            })?;

        Ok(Self { stop })
    }
}

impl PlaybackHandle for AudioPlayback {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn run_playback(frames: flume::Receiver<DecodedFrame>, stop: Arc<AtomicBool>) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("No output audio device found")?;

    tracing::info!("Using output device: {:?}", device.name());

    let default_config = device.default_output_config()?;
    let device_rate = default_config.sample_rate().0;
    let device_channels = default_config.channels();

    tracing::info!(
        "Output device config: {}Hz, {} channels (source: {}Hz mono)",
        device_rate,
        device_channels,
        SAMPLE_RATE
    );

    let config = cpal::StreamConfig {
        channels: device_channels,
        sample_rate: SampleRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ring = HeapRb::<f32>::new((device_rate as usize / 5) * device_channels as usize);
    let (mut producer, mut consumer) = ring.split();

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for sample in data.iter_mut() {
                *sample = consumer.try_pop().unwrap_or(0.0);
            }
        },
        move |err| {
            tracing::error!("Audio output error: {err}");
        },
        None,
    )?;
    stream.play()?;

    while !stop.load(Ordering::Relaxed) {
        let frame = match frames.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => frame,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };
        let resampled = resample(&frame.samples, SAMPLE_RATE, device_rate);
        let output = upmix(&resampled, device_channels);
        let _ = producer.push_slice(&output);
    }

    tracing::info!("Remote playback unloaded");
    Ok(())
}

// ── Sample conversion ──

/// Averages interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Repeats each mono sample across `channels`.
pub fn upmix(mono: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return mono.to_vec();
    }
    mono.iter()
        .flat_map(|&s| std::iter::repeat(s).take(channels as usize))
        .collect()
}

/// Linear interpolation from `from_rate` to `to_rate`, filling all of `out`.
/// Missing tail samples are zero.
pub fn resample_into(input: &[f32], from_rate: u32, to_rate: u32, out: &mut [f32]) {
    if from_rate == to_rate {
        let len = input.len().min(out.len());
        out[..len].copy_from_slice(&input[..len]);
        out[len..].fill(0.0);
        return;
    }
    let ratio = to_rate as f64 / from_rate as f64;
    for (i, sample) in out.iter_mut().enumerate() {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let s0 = input.get(idx).copied().unwrap_or(0.0);
        let s1 = input.get(idx + 1).copied().unwrap_or(s0);
        *sample = (s0 as f64 * (1.0 - frac) + s1 as f64 * frac) as f32;
    }
}

pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let out_len = (input.len() as f64 * to_rate as f64 / from_rate as f64) as usize;
    let mut out = vec![0.0f32; out_len];
    resample_into(input, from_rate, to_rate, &mut out);
    out
}
