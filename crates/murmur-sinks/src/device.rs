//! Live audio output via cpal.

use std::collections::VecDeque;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use murmur_core::{Error, Result, Sink};

/// Buffers of rendered PCM queued ahead of the device callback. The
/// bounded channel paces the engine: `write` blocks once the device falls
/// this far behind.
const QUEUE_DEPTH: usize = 4;

/// Plays the rendered stream on a system output device.
///
/// The engine thread renders buffers and hands them over a bounded
/// channel; the cpal stream callback drains them at the device's own
/// callback size. Rate and channel layout come from the device's default
/// output config (stereo f32 only).
pub struct CpalSink {
    frame_rate: u32,
    buffer_frames: usize,
    sender: Sender<Vec<f32>>,
    // Held for its Drop: the stream stops when the sink goes away.
    _stream: cpal::Stream,
}

impl CpalSink {
    /// Open the default output device.
    pub fn open(buffer_frames: usize) -> Result<CpalSink> {
        CpalSink::open_device(None, buffer_frames)
    }

    /// Open a named output device, or the default when `None`.
    pub fn open_device(device_name: Option<&str>, buffer_frames: usize) -> Result<CpalSink> {
        let host = cpal::default_host();
        let device = match device_name {
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Device("no default output device".into()))?,
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| Error::Device(format!("no output device named {name:?}")))?,
        };

        let supported = device
            .default_output_config()
            .map_err(|e| Error::Device(e.to_string()))?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            return Err(Error::Device(format!(
                "device sample format {:?} not supported (need f32)",
                supported.sample_format()
            )));
        }
        let config: cpal::StreamConfig = supported.into();
        if config.channels != 2 {
            return Err(Error::Device(format!(
                "device has {} channels (need stereo)",
                config.channels
            )));
        }
        let frame_rate = config.sample_rate.0;

        let (sender, receiver) = crossbeam_channel::bounded::<Vec<f32>>(QUEUE_DEPTH);
        let mut pending = Pending::new(receiver);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _| pending.fill(data),
                |e| tracing::error!("audio stream error: {e}"),
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;
        stream.play().map_err(|e| Error::Device(e.to_string()))?;

        tracing::info!(
            "audio device open: {} ({frame_rate} Hz)",
            device.name().unwrap_or_else(|_| "<unnamed>".into())
        );
        Ok(CpalSink {
            frame_rate,
            buffer_frames,
            sender,
            _stream: stream,
        })
    }
}

impl Sink for CpalSink {
    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    fn write(&mut self, frames: &[f32]) -> Result<()> {
        let mut buf = frames.to_vec();
        for sample in &mut buf {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.sender
            .send(buf)
            .map_err(|_| Error::Device("audio stream closed".into()))
    }
}

/// Callback-side state: the channel plus a partial buffer carried across
/// callbacks of mismatched size.
struct Pending {
    receiver: Receiver<Vec<f32>>,
    carry: VecDeque<f32>,
}

impl Pending {
    fn new(receiver: Receiver<Vec<f32>>) -> Pending {
        Pending {
            receiver,
            carry: VecDeque::new(),
        }
    }

    fn fill(&mut self, data: &mut [f32]) {
        for slot in data.iter_mut() {
            if self.carry.is_empty() {
                if let Ok(chunk) = self.receiver.try_recv() {
                    self.carry.extend(chunk);
                }
            }
            // Underruns play silence rather than stale data.
            *slot = self.carry.pop_front().unwrap_or(0.0);
        }
    }
}

/// List the names of available output devices.
pub fn output_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| Error::Device(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}
