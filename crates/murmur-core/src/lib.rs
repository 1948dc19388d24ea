//! Soundscape engine core: agent scheduler, channel tree, note mixer,
//! sample cache, and event dispatch.
//!
//! User-supplied [`Agent`]s schedule notes and spawn further agents on a
//! virtual frame timeline; the engine renders the resulting note stream
//! into interleaved stereo PCM drained by a [`Sink`].
//!
//! ```ignore
//! let mut sink = murmur_sinks::MemorySink::new(22050, 2205);
//! let mut engine = Engine::for_sink(EngineConfig::default(), &sink)?;
//! engine.schedule_agent(Box::new(MyScape), 0.0, None)?;
//! engine.run(&mut sink)?;
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::{EngineConfig, DEFAULT_LISTEN_PORT, MAX_DELAY_SECS};

/// Virtual time, counted in output frames. Signed: timebase trims can
/// push idle timestamps below zero.
pub type Frames = i64;

pub mod stereo;
pub use stereo::Stereo;

pub mod sample;
pub use sample::{
    DecodedSample, MixinLoader, Pcm, SampleFormat, SampleId, SampleInfo, SampleLoader,
    SampleStore, StoreStats, WavLoader,
};

pub mod channel;
pub use channel::{Channel, ChannelId, ChannelTree, VolumeEnvelope};

pub mod mixer;
pub use mixer::NoteMixer;

pub mod agent;
pub use agent::{Agent, AgentRef, NoteParams};

pub mod events;
pub use events::Event;

pub mod listen;
pub use listen::{ListenAddr, Listener};

pub mod context;
pub use context::AgentCtx;

pub mod generator;
pub use generator::{Engine, GenerationOutcome, Sink, Stats};

pub mod builtin;

pub(crate) mod scheduler;
pub use scheduler::PostedId;
