//! # Murmur - programmable soundscape engine
//!
//! A soundscape is a script of [`Agent`]s: each runs at a virtual
//! deadline, schedules notes, spawns further agents, and reschedules
//! itself. The engine renders the resulting note stream into continuous
//! stereo PCM drained by a [`Sink`].
//!
//! ## Architecture
//!
//! Murmur is an umbrella crate over:
//! - **murmur-core** - the engine: agent scheduler, channel tree, note
//!   mixer, sample cache, event dispatch, generation loop
//! - **murmur-sinks** - outputs: memory buffer, WAV file, cpal device
//!
//! ## Quick start
//!
//! ```ignore
//! use murmur::prelude::*;
//!
//! struct Heartbeat;
//!
//! impl Agent for Heartbeat {
//!     fn name(&self) -> &str { "heartbeat" }
//!
//!     fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
//!         let thump = ctx.sample("thump.wav")?;
//!         ctx.schedule_note(thump, 1.0, 0.8, 0.0, None)?;
//!         ctx.reschedule(Some(1.2))
//!     }
//! }
//!
//! let mut sink = CpalSink::open(2048)?;
//! let mut engine = Engine::for_sink(EngineConfig::default(), &sink)?;
//! engine.schedule_agent(Box::new(Heartbeat), 0.0, None)?;
//! engine.run(&mut sink)?;
//! ```
//!
//! ## Feature flags
//!
//! - `device` - live audio output through cpal

/// Re-export of murmur-core for direct access.
pub use murmur_core as core;

// Engine surface
pub use murmur_core::{
    // Engine and its loop
    Engine, EngineConfig, GenerationOutcome, Sink, Stats,

    // Agents
    Agent, AgentCtx, AgentRef, NoteParams,

    // Channels
    Channel, ChannelId, ChannelTree, VolumeEnvelope,

    // Samples
    Pcm, SampleFormat, SampleId, SampleInfo, SampleLoader, SampleStore,

    // Stereo transforms
    Stereo,

    // Events
    Event, ListenAddr,

    // Time
    Frames,

    // Error
    Error, Result,
};

/// Built-in utility agents (stop, set-volume, fades).
pub use murmur_core::builtin;

/// Re-export of murmur-sinks for direct access.
pub use murmur_sinks as sinks;

pub use murmur_sinks::{MemorySink, WavFileSink};

#[cfg(feature = "device")]
pub use murmur_sinks::CpalSink;

pub mod prelude {
    // Main engine
    pub use crate::{Engine, EngineConfig, GenerationOutcome, Sink};

    // Agent essentials
    pub use crate::{Agent, AgentCtx, Event, NoteParams, Result, Stereo};

    // Channels and samples
    pub use crate::{ChannelId, Pcm, SampleId};

    // Sinks
    pub use crate::{MemorySink, WavFileSink};

    #[cfg(feature = "device")]
    pub use crate::CpalSink;
}
