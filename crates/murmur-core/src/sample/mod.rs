//! Decoded samples and the content-addressed sample store.
//!
//! A [`SampleStore`] caches decoded PCM by resource name. Entries persist
//! for the lifetime of the engine; idle PCM is released and transparently
//! reloaded from the source file on demand. A *mixin* entry carries no PCM
//! of its own and dispatches to a concrete sample based on pitch.

mod loader;
mod store;

pub use loader::{DecodedSample, MixinLoader, SampleLoader, WavLoader};
pub use store::{SampleStore, StoreStats};

use std::path::PathBuf;
use std::sync::Arc;

use crate::{Error, Frames, Result};

/// Stable handle to a sample store entry. Entries are never removed, so a
/// plain index suffices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleId(pub(crate) u32);

/// Facts about the source data a sample was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// Decoded interleaved PCM, normalized to f32.
#[derive(Debug, Clone)]
pub struct Pcm {
    sample_rate: u32,
    channels: u16,
    data: Vec<f32>,
}

impl Pcm {
    pub fn new(sample_rate: u32, channels: u16, data: Vec<f32>) -> Result<Pcm> {
        if !(1..=2).contains(&channels) {
            return Err(Error::Load(format!(
                "unsupported channel count {channels} (must be 1 or 2)"
            )));
        }
        if sample_rate == 0 {
            return Err(Error::Load("zero sample rate".into()));
        }
        if data.is_empty() || data.len() % channels as usize != 0 {
            return Err(Error::Load(format!(
                "PCM length {} does not fit {channels} channel(s)",
                data.len()
            )));
        }
        Ok(Pcm {
            sample_rate,
            channels,
            data,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (sample pairs for stereo data).
    pub fn frames(&self) -> u64 {
        (self.data.len() / self.channels as usize) as u64
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Fetch one frame, duplicating mono data to both sides.
    #[inline]
    pub fn frame(&self, index: usize) -> (f32, f32) {
        if self.channels == 1 {
            let s = self.data[index];
            (s, s)
        } else {
            let base = index * 2;
            (self.data[base], self.data[base + 1])
        }
    }
}

/// Duration and loop info for a sample at a given pitch, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleInfo {
    pub duration: f64,
    pub loop_region: Option<(f64, f64)>,
}

/// A pitch-dispatch binding inside a mixin sample.
#[derive(Debug, Clone, Copy)]
pub struct PitchBinding {
    pub sample: SampleId,
    pub ratio: f64,
}

/// One pitch range of a mixin sample; inclusive on both ends.
#[derive(Debug, Clone, Copy)]
pub struct PitchRange {
    pub low: f64,
    pub high: f64,
    pub binding: PitchBinding,
}

pub(crate) struct ConcreteSample {
    pub format: SampleFormat,
    pub frames: u64,
    pub loop_region: Option<(u64, u64)>,
    /// `None` while the PCM is unloaded.
    pub pcm: Option<Arc<Pcm>>,
    /// Bumped on every (re)load; notes carry it as a fingerprint.
    pub generation: u32,
}

pub(crate) struct MixinSample {
    pub ranges: Vec<PitchRange>,
    pub default: Option<PitchBinding>,
}

impl MixinSample {
    /// First range covering `pitch`, else the default binding.
    pub fn find(&self, pitch: f64) -> Result<PitchBinding> {
        for range in &self.ranges {
            if pitch >= range.low && pitch <= range.high {
                return Ok(range.binding);
            }
        }
        self.default
            .ok_or_else(|| Error::Sample(format!("{pitch} is outside mixin ranges")))
    }
}

pub(crate) enum SampleKind {
    Concrete(ConcreteSample),
    Mixin(MixinSample),
}

pub(crate) struct SampleEntry {
    pub name: String,
    /// Source file; `None` for samples registered from memory, which can
    /// never be unloaded.
    pub source: Option<PathBuf>,
    pub ref_count: u32,
    pub last_used: Frames,
    pub kind: SampleKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_mono_frame() {
        let pcm = Pcm::new(22050, 1, vec![0.25, -0.5]).unwrap();
        assert_eq!(pcm.frames(), 2);
        assert_eq!(pcm.frame(0), (0.25, 0.25));
        assert_eq!(pcm.frame(1), (-0.5, -0.5));
    }

    #[test]
    fn test_pcm_stereo_frame() {
        let pcm = Pcm::new(44100, 2, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(pcm.frames(), 2);
        assert_eq!(pcm.frame(0), (0.1, 0.2));
        assert_eq!(pcm.frame(1), (0.3, 0.4));
    }

    #[test]
    fn test_pcm_rejects_bad_shapes() {
        assert!(Pcm::new(22050, 3, vec![0.0; 6]).is_err());
        assert!(Pcm::new(22050, 2, vec![0.0; 5]).is_err());
        assert!(Pcm::new(22050, 1, Vec::new()).is_err());
        assert!(Pcm::new(0, 1, vec![0.0]).is_err());
    }

    #[test]
    fn test_mixin_find() {
        let mixin = MixinSample {
            ranges: vec![
                PitchRange {
                    low: 0.0,
                    high: 1.0,
                    binding: PitchBinding {
                        sample: SampleId(0),
                        ratio: 2.0,
                    },
                },
                PitchRange {
                    low: 1.0,
                    high: 4.0,
                    binding: PitchBinding {
                        sample: SampleId(1),
                        ratio: 0.5,
                    },
                },
            ],
            default: None,
        };
        // First matching range wins on the shared boundary.
        assert_eq!(mixin.find(1.0).unwrap().sample, SampleId(0));
        assert_eq!(mixin.find(3.0).unwrap().sample, SampleId(1));
        assert!(mixin.find(5.0).is_err());
    }

    #[test]
    fn test_mixin_default_binding() {
        let mixin = MixinSample {
            ranges: Vec::new(),
            default: Some(PitchBinding {
                sample: SampleId(7),
                ratio: 1.5,
            }),
        };
        let binding = mixin.find(99.0).unwrap();
        assert_eq!(binding.sample, SampleId(7));
        assert_eq!(binding.ratio, 1.5);
    }
}
