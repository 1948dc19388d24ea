//! WAV file sink.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use murmur_core::{Error, Result, Sink};

use crate::saturate_i16;

/// Writes the rendered stream to a 16-bit stereo WAV file, saturating at
/// the integer boundary.
pub struct WavFileSink {
    frame_rate: u32,
    buffer_frames: usize,
    writer: hound::WavWriter<BufWriter<File>>,
}

impl WavFileSink {
    pub fn create(path: &Path, frame_rate: u32, buffer_frames: usize) -> Result<WavFileSink> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: frame_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| Error::Device(format!("{}: {e}", path.display())))?;
        tracing::info!("writing {} ({frame_rate} Hz)", path.display());
        Ok(WavFileSink {
            frame_rate,
            buffer_frames,
            writer,
        })
    }

    /// Flush and close the file.
    pub fn finalize(self) -> Result<()> {
        self.writer
            .finalize()
            .map_err(|e| Error::Device(e.to_string()))
    }
}

impl Sink for WavFileSink {
    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    fn write(&mut self, frames: &[f32]) -> Result<()> {
        for &sample in frames {
            self.writer
                .write_sample(saturate_i16(sample))
                .map_err(|e| Error::Device(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut sink = WavFileSink::create(&path, 22050, 4).unwrap();
        // Includes an out-of-range value that must saturate.
        sink.write(&[0.0, 0.5, -0.5, 2.0, 0.25, 0.25, -1.0, 1.0])
            .unwrap();
        sink.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 22050);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 8);
        assert_eq!(samples[0], 0);
        assert_eq!(samples[3], i16::MAX);
        assert!((samples[1] as f32 / i16::MAX as f32 - 0.5).abs() < 1e-3);
    }
}
