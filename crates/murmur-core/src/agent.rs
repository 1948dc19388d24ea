//! Agents: user-supplied units of scheduling logic.

use crate::channel::ChannelId;
use crate::context::AgentCtx;
use crate::events::Event;
use crate::stereo::Stereo;
use crate::{Error, Result};

/// A unit of soundscape logic. The engine invokes [`run`](Agent::run)
/// when virtual time reaches the agent's deadline; event-driven agents
/// additionally implement [`receive`](Agent::receive) and advertise the
/// event names they watch.
///
/// Agents must not block: to wait, reschedule at a future virtual time
/// via [`AgentCtx::reschedule`].
pub trait Agent: Send {
    /// A short human-readable name, used in logs and as the creator tag
    /// of channels the agent opens.
    fn name(&self) -> &str {
        "unnamed agent"
    }

    /// Perform the agent's action at its deadline.
    fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()>;

    /// Event names this agent watches when posted. Consulted once, at
    /// post time; the list must contain valid single-token names.
    fn watch_events(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handle an event this agent was posted for.
    fn receive(&mut self, _event: &Event, _ctx: &mut AgentCtx<'_>) -> Result<()> {
        Err(Error::Schedule(format!(
            "\"{}\" does not receive events",
            self.name()
        )))
    }
}

/// An agent headed into the engine, tagged with its role: dispatched once
/// at a deadline, or posted to watch for named events.
pub enum AgentRef {
    Scheduled(Box<dyn Agent>),
    Posted(Box<dyn Agent>),
}

/// Optional parameters for scheduling a note, mirroring the keyword form
/// of the scheduling API. `duration` switches the note to loop-fill mode;
/// `channel` defaults to the scheduling agent's own channel.
#[derive(Default)]
pub struct NoteParams {
    pub pitch: Option<f64>,
    pub volume: Option<f64>,
    pub delay: Option<f64>,
    pub duration: Option<f64>,
    pub pan: Option<Stereo>,
    pub channel: Option<ChannelId>,
}
