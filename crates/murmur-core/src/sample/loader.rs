//! Sample decoders.
//!
//! Loaders turn a file into decoded PCM (or, for mixins, into a pitch
//! dispatch table whose members the store resolves). The engine itself
//! never parses audio containers beyond what a loader hands back.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::{Pcm, SampleFormat};

/// What a loader produced for a file.
pub enum DecodedSample {
    Pcm {
        pcm: Pcm,
        format: SampleFormat,
        loop_region: Option<(u64, u64)>,
    },
    /// Member paths with their pitch ranges; the store loads members and
    /// builds the dispatch table.
    Mixin {
        ranges: Vec<(f64, f64, PathBuf, f64)>,
        default: Option<(PathBuf, f64)>,
    },
}

/// Decoder for one family of file extensions.
pub trait SampleLoader: Send {
    fn extensions(&self) -> &'static [&'static str];

    fn load(&self, path: &Path) -> Result<DecodedSample>;
}

/// WAV decoder. Integer samples of any width normalize to f32.
pub struct WavLoader;

impl SampleLoader for WavLoader {
    fn extensions(&self) -> &'static [&'static str] {
        &["wav"]
    }

    fn load(&self, path: &Path) -> Result<DecodedSample> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| Error::Load(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if !(1..=2).contains(&spec.channels) {
            return Err(Error::Load(format!(
                "{}: {} channels (only mono and stereo supported)",
                path.display(),
                spec.channels
            )));
        }

        let data: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Load(format!("{}: {e}", path.display())))?,
            hound::SampleFormat::Int => {
                let norm = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * norm))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| Error::Load(format!("{}: {e}", path.display())))?
            }
        };

        let pcm = Pcm::new(spec.sample_rate, spec.channels, data)?;
        Ok(DecodedSample::Pcm {
            format: SampleFormat {
                sample_rate: spec.sample_rate,
                channels: spec.channels,
                bits_per_sample: spec.bits_per_sample,
            },
            // WAV carries no loop markers we read; loops come from mixins
            // or in-memory registration.
            loop_region: None,
            pcm,
        })
    }
}

/// Parser for the `.mixin` text format:
///
/// ```text
/// # comment
/// range 0.5 1.0 low.wav 2.0
/// range -   2.0 mid.wav
/// else high.wav 0.5
/// ```
///
/// A `-` lower bound continues from the previous range's upper bound
/// (0 for the first range); a `-` upper bound is unbounded. Member paths
/// are relative to the mixin file.
pub struct MixinLoader;

impl SampleLoader for MixinLoader {
    fn extensions(&self) -> &'static [&'static str] {
        &["mixin"]
    }

    fn load(&self, path: &Path) -> Result<DecodedSample> {
        let text = std::fs::read_to_string(path)?;
        let dir = path.parent().unwrap_or(Path::new("."));

        let mut ranges: Vec<(f64, f64, PathBuf, f64)> = Vec::new();
        let mut default = None;

        for (lineno, line) in text.lines().enumerate() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let bad = |msg: &str| {
                Error::Load(format!("{}:{}: {msg}", path.display(), lineno + 1))
            };
            match tokens.first() {
                None => continue,
                Some(tok) if tok.starts_with('#') => continue,
                Some(&"range") => {
                    if tokens.len() < 4 {
                        return Err(bad("range and filename required after range"));
                    }
                    let low = if tokens[1] == "-" {
                        ranges.last().map(|r| r.1).unwrap_or(0.0)
                    } else {
                        tokens[1]
                            .parse()
                            .map_err(|_| bad("bad lower pitch bound"))?
                    };
                    let high = if tokens[2] == "-" {
                        1_000_000.0
                    } else {
                        tokens[2]
                            .parse()
                            .map_err(|_| bad("bad upper pitch bound"))?
                    };
                    let (member, ratio) = parse_member(dir, &tokens[3..])
                        .ok_or_else(|| bad("bad pitch ratio"))?;
                    ranges.push((low, high, member, ratio));
                }
                Some(&"else") => {
                    if tokens.len() < 2 {
                        return Err(bad("filename required after else"));
                    }
                    default = Some(
                        parse_member(dir, &tokens[1..]).ok_or_else(|| bad("bad pitch ratio"))?,
                    );
                }
                Some(other) => {
                    return Err(bad(&format!("unknown statement in mixin: {other}")));
                }
            }
        }

        Ok(DecodedSample::Mixin { ranges, default })
    }
}

fn parse_member(dir: &Path, tokens: &[&str]) -> Option<(PathBuf, f64)> {
    let path = dir.join(tokens[0]);
    let ratio = match tokens.get(1) {
        Some(tok) => tok.parse().ok()?,
        None => 1.0,
    };
    Some((path, ratio))
}
