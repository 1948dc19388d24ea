//! Built-in utility agents.
//!
//! Small agents useful to every soundscape: stopping channels, setting
//! volumes, and fading channels in and out.

use crate::agent::Agent;
use crate::context::AgentCtx;
use crate::{Error, Result};

/// Does nothing.
pub struct NullAgent;

impl Agent for NullAgent {
    fn name(&self) -> &str {
        "null agent"
    }

    fn run(&mut self, _ctx: &mut AgentCtx<'_>) -> Result<()> {
        Ok(())
    }
}

/// Stops its channel. All notes and agents in the channel (and any
/// subchannels) are discarded.
pub struct StopAgent;

impl Agent for StopAgent {
    fn name(&self) -> &str {
        "stop channel"
    }

    fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
        let channel = ctx.channel();
        ctx.stop_channel(channel);
        Ok(())
    }
}

/// Changes its channel to a given volume over an interval.
pub struct SetVolumeAgent {
    volume: f64,
    duration: f64,
}

impl SetVolumeAgent {
    /// The default five-millisecond interval sounds instantaneous while
    /// avoiding clicks.
    pub fn new(volume: f64) -> SetVolumeAgent {
        SetVolumeAgent {
            volume,
            duration: 0.005,
        }
    }

    pub fn with_duration(volume: f64, duration: f64) -> SetVolumeAgent {
        SetVolumeAgent { volume, duration }
    }
}

impl Agent for SetVolumeAgent {
    fn name(&self) -> &str {
        "set channel volume"
    }

    fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
        let channel = ctx.channel();
        ctx.set_volume(channel, self.volume, self.duration)
    }
}

/// Fades its channel down to zero volume over an interval, then stops it.
pub struct FadeOutAgent {
    duration: f64,
}

impl FadeOutAgent {
    pub fn new(duration: f64) -> FadeOutAgent {
        FadeOutAgent { duration }
    }
}

impl Agent for FadeOutAgent {
    fn name(&self) -> &str {
        "fade out and stop channel"
    }

    fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
        let channel = ctx.channel();
        ctx.set_volume(channel, 0.0, self.duration)?;
        ctx.schedule_agent(Box::new(StopAgent), self.duration, None)
    }
}

/// Creates a channel for an agent, fades it up from silence, holds it at
/// full volume, then fades it out and stops it.
pub struct FadeInOutAgent {
    agent: Option<Box<dyn Agent>>,
    live_interval: f64,
    fade_in: f64,
    fade_out: f64,
}

impl FadeInOutAgent {
    pub fn new(agent: Box<dyn Agent>, live_interval: f64, fade_interval: f64) -> FadeInOutAgent {
        FadeInOutAgent {
            agent: Some(agent),
            live_interval,
            fade_in: fade_interval,
            fade_out: fade_interval,
        }
    }

    /// Separate fade-in and fade-out intervals.
    pub fn with_fades(
        agent: Box<dyn Agent>,
        live_interval: f64,
        fade_in: f64,
        fade_out: f64,
    ) -> FadeInOutAgent {
        FadeInOutAgent {
            agent: Some(agent),
            live_interval,
            fade_in,
            fade_out,
        }
    }
}

impl Agent for FadeInOutAgent {
    fn name(&self) -> &str {
        "fade in, fade out, stop channel"
    }

    fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
        let inner = self
            .agent
            .take()
            .ok_or_else(|| Error::Schedule("fade agent already ran".into()))?;
        let channel = ctx.new_channel(0.0, None)?;
        ctx.schedule_agent(inner, 0.0, Some(channel))?;
        ctx.set_volume(channel, 1.0, self.fade_in)?;
        ctx.schedule_agent(
            Box::new(FadeOutAgent::new(self.fade_out)),
            self.live_interval + self.fade_in,
            Some(channel),
        )
    }
}
