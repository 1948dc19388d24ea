//! Audio sinks for the murmur soundscape engine.
//!
//! Implementations of [`murmur_core::Sink`]:
//! - [`MemorySink`] collects rendered PCM in memory (offline rendering
//!   and tests);
//! - [`WavFileSink`] writes a 16-bit WAV file;
//! - [`CpalSink`] plays through the system audio device (feature `cpal`).

mod memory;
pub use memory::MemorySink;

mod file;
pub use file::WavFileSink;

#[cfg(feature = "cpal")]
mod device;
#[cfg(feature = "cpal")]
pub use device::{output_device_names, CpalSink};

/// Saturating f32 → i16 conversion used at the integer-PCM boundary.
pub(crate) fn saturate_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturate_clamps_not_wraps() {
        assert_eq!(saturate_i16(0.0), 0);
        assert_eq!(saturate_i16(1.0), i16::MAX);
        assert_eq!(saturate_i16(2.5), i16::MAX);
        assert_eq!(saturate_i16(-2.5), -i16::MAX);
        assert!(saturate_i16(0.5) > 16000);
    }
}
