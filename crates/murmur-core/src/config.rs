//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Frames, Result};

/// Default TCP port for the event listener.
pub const DEFAULT_LISTEN_PORT: u16 = 31863;

/// Upper bound on scheduling delays and note durations, in seconds.
/// Keeps the frame counter and envelope math sane.
pub const MAX_DELAY_SECS: f64 = 3605.0;

/// Configuration for a soundscape engine.
///
/// The timebase constants default to the production values: the virtual
/// frame counter is trimmed every couple of hours, and idle sample PCM is
/// released after about forty minutes. Tests shrink them to exercise the
/// trim and unload paths quickly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root channel's initial amplitude multiplier (0..=1).
    pub master_volume: f64,

    /// Enable the external event listener.
    pub listen: bool,

    /// Listener endpoint. A numeric string is a TCP port on localhost;
    /// a string starting with `/` is an AF_UNIX socket path. `None`
    /// means the default TCP port.
    pub listen_port: Option<String>,

    /// Seconds between stats emissions, if enabled.
    pub stats_interval: Option<f64>,

    /// Include the full error rendering when an agent fails.
    pub verbose_errors: bool,

    /// Trim the virtual timebase once it reaches this many frames.
    pub trim_threshold: Frames,

    /// Amount subtracted from every stored frame stamp at trim time.
    pub trim_offset: Frames,

    /// Frames between idle-sample cache scans.
    pub unload_interval: Frames,

    /// A sample's PCM is released once it has been unreferenced for
    /// this many frames.
    pub unload_age: Frames,

    /// Directories searched for relative sample names.
    pub sound_path: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            master_volume: 0.5,
            listen: false,
            listen_port: None,
            stats_interval: None,
            verbose_errors: false,
            trim_threshold: 317_520_000,
            trim_offset: 158_760_000,
            unload_interval: 13_230_000,
            unload_age: 100_000_000,
            sound_path: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.master_volume) {
            return Err(Error::InvalidConfig(format!(
                "master_volume {} out of range (0-1)",
                self.master_volume
            )));
        }
        if self.trim_offset <= 0 || self.trim_offset >= self.trim_threshold {
            return Err(Error::InvalidConfig(format!(
                "trim_offset {} must be positive and below trim_threshold {}",
                self.trim_offset, self.trim_threshold
            )));
        }
        if self.unload_interval <= 0 || self.unload_age <= 0 {
            return Err(Error::InvalidConfig(
                "unload_interval and unload_age must be positive".into(),
            ));
        }
        if let Some(iv) = self.stats_interval {
            if iv <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "stats_interval {iv} must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.master_volume, 0.5);
        assert!(!config.listen);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_master_volume() {
        let config = EngineConfig {
            master_volume: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_trim_offset() {
        let config = EngineConfig {
            trim_threshold: 1000,
            trim_offset: 2000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
