//! The scheduling API agents see.
//!
//! While an agent's `run` or `receive` executes, its box is checked out
//! of the engine's collections and an [`AgentCtx`] grants it the external
//! API: scheduling notes and agents, opening channels, posting for
//! events. Delays and durations are in seconds; the context converts to
//! frames at the sink rate and anchors deadlines at the running agent's
//! own runtime, so timing never drifts with buffer boundaries.

use crate::agent::{Agent, NoteParams};
use crate::channel::ChannelId;
use crate::events::Event;
use crate::generator::Engine;
use crate::sample::{Pcm, SampleId, SampleInfo};
use crate::stereo::Stereo;
use crate::{Error, Frames, Result};

/// What should happen to the running agent's box once it returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Disposition {
    /// Drop the agent.
    None,
    /// Requeue at `runtime`; `delay_secs` becomes the recorded delay.
    Reschedule { runtime: Frames, delay_secs: f64 },
    /// Register as a posted event agent.
    Post,
    /// Remove from the posted pool.
    Unpost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtxKind {
    Run,
    Receive,
}

/// Context handed to an agent's `run` or `receive`.
pub struct AgentCtx<'a> {
    engine: &'a mut Engine,
    channel: ChannelId,
    runtime: Frames,
    original_delay: Option<f64>,
    creator: String,
    kind: CtxKind,
    pub(crate) disposition: Disposition,
}

impl<'a> AgentCtx<'a> {
    pub(crate) fn for_run(
        engine: &'a mut Engine,
        channel: ChannelId,
        runtime: Frames,
        original_delay: Option<f64>,
        creator: String,
    ) -> AgentCtx<'a> {
        AgentCtx {
            engine,
            channel,
            runtime,
            original_delay,
            creator,
            kind: CtxKind::Run,
            disposition: Disposition::None,
        }
    }

    pub(crate) fn for_receive(
        engine: &'a mut Engine,
        channel: ChannelId,
        runtime: Frames,
        creator: String,
    ) -> AgentCtx<'a> {
        AgentCtx {
            engine,
            channel,
            runtime,
            original_delay: None,
            creator,
            kind: CtxKind::Receive,
            disposition: Disposition::None,
        }
    }

    /// The channel this agent is running in.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The root of the channel tree.
    pub fn root_channel(&self) -> ChannelId {
        self.engine.channels.root()
    }

    /// The virtual frame this invocation was scheduled for. Nested
    /// scheduling anchors here.
    pub fn runtime(&self) -> Frames {
        self.runtime
    }

    pub fn frames_per_sec(&self) -> u32 {
        self.engine.frame_rate()
    }

    /// Fetch (or load) a sample by resource name.
    pub fn sample(&mut self, name: &str) -> Result<SampleId> {
        self.engine.samples_mut().get(name)
    }

    /// Register PCM built in memory as a named sample.
    pub fn add_sample(
        &mut self,
        name: &str,
        pcm: Pcm,
        loop_region: Option<(u64, u64)>,
    ) -> Result<SampleId> {
        self.engine.samples_mut().insert_pcm(name, pcm, loop_region)
    }

    /// Duration and loop points of a sample at a pitch, in seconds.
    pub fn sample_info(&self, sample: SampleId, pitch: f64) -> Result<SampleInfo> {
        self.engine.samples().info(sample, pitch)
    }

    /// Schedule a note. Pitch is a multiple of the sample's original
    /// frequency, volume a fraction of its original amplitude, delay a
    /// time in seconds before it sounds. Returns the expected duration in
    /// seconds.
    pub fn schedule_note(
        &mut self,
        sample: SampleId,
        pitch: f64,
        volume: f64,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<f64> {
        self.schedule_full(sample, None, Stereo::Identity, pitch, volume, delay, channel)
    }

    /// Schedule a note with a stereo position.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_note_pan(
        &mut self,
        sample: SampleId,
        pan: Stereo,
        pitch: f64,
        volume: f64,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<f64> {
        self.schedule_full(sample, None, pan, pitch, volume, delay, channel)
    }

    /// Schedule a note extended to `duration` seconds by looping the
    /// sample's loop region. The returned duration may run slightly
    /// longer, since the note ends on a loop boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_note_duration(
        &mut self,
        sample: SampleId,
        duration: f64,
        pitch: f64,
        volume: f64,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<f64> {
        self.schedule_full(
            sample,
            Some(duration),
            Stereo::Identity,
            pitch,
            volume,
            delay,
            channel,
        )
    }

    /// The duration form with a stereo position.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_note_duration_pan(
        &mut self,
        sample: SampleId,
        duration: f64,
        pan: Stereo,
        pitch: f64,
        volume: f64,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<f64> {
        self.schedule_full(sample, Some(duration), pan, pitch, volume, delay, channel)
    }

    /// Schedule a note from a parameter struct; unset fields take the
    /// usual defaults.
    pub fn schedule_note_with(&mut self, sample: SampleId, params: NoteParams) -> Result<f64> {
        self.schedule_full(
            sample,
            params.duration,
            params.pan.unwrap_or_default(),
            params.pitch.unwrap_or(1.0),
            params.volume.unwrap_or(1.0),
            params.delay.unwrap_or(0.0),
            params.channel,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_full(
        &mut self,
        sample: SampleId,
        duration: Option<f64>,
        pan: Stereo,
        pitch: f64,
        volume: f64,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<f64> {
        let channel = channel.unwrap_or(self.channel);
        let delay = self.engine.delay_frames(delay, "delay time")?;
        let duration = match duration {
            Some(d) => Some(self.engine.delay_frames(d, "duration")?),
            None => None,
        };
        let frames = self.engine.queue_note(
            sample,
            pitch,
            volume,
            pan,
            self.runtime + delay,
            duration,
            channel,
        )?;
        Ok(frames as f64 / self.engine.frame_rate() as f64)
    }

    /// Schedule another agent to run after `delay` seconds.
    pub fn schedule_agent(
        &mut self,
        agent: Box<dyn Agent>,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<()> {
        let channel = channel.unwrap_or(self.channel);
        let frames = self.engine.delay_frames(delay, "delay time")?;
        self.engine
            .schedule_boxed(agent, self.runtime + frames, channel, Some(delay))
    }

    /// Reschedule the running agent. With no delay given, the delay
    /// recorded at the last explicit scheduling is reused. The next
    /// runtime is exactly this runtime plus the delay.
    pub fn reschedule(&mut self, delay: Option<f64>) -> Result<()> {
        if self.kind != CtxKind::Run {
            return Err(Error::Schedule(
                "only a running scheduled agent can reschedule".into(),
            ));
        }
        let delay_secs = match delay.or(self.original_delay) {
            Some(d) => d,
            None => return Err(Error::Schedule("reschedule with no prior delay".into())),
        };
        let frames = self.engine.delay_frames(delay_secs, "delay time")?;
        self.disposition = Disposition::Reschedule {
            runtime: self.runtime + frames,
            delay_secs,
        };
        Ok(())
    }

    /// Post another agent to watch for events.
    pub fn post_agent(&mut self, agent: Box<dyn Agent>, channel: Option<ChannelId>) -> Result<()> {
        let channel = channel.unwrap_or(self.channel);
        self.engine.post_agent_now(agent, channel)
    }

    /// Turn the running scheduled agent into a posted event agent once it
    /// returns.
    pub fn post_self(&mut self) -> Result<()> {
        if self.kind != CtxKind::Run {
            return Err(Error::Schedule(
                "only a running scheduled agent can post itself".into(),
            ));
        }
        if !self.engine.listening() {
            return Err(Error::Schedule(
                "event listening disabled -- cannot post".into(),
            ));
        }
        self.disposition = Disposition::Post;
        Ok(())
    }

    /// Remove the running posted agent from its event-watching post once
    /// it returns.
    pub fn unpost_self(&mut self) -> Result<()> {
        if self.kind != CtxKind::Receive {
            return Err(Error::Schedule("agent is not posted".into()));
        }
        self.disposition = Disposition::Unpost;
        Ok(())
    }

    /// Send an event as if it had arrived from the listener. Posted
    /// agents see it on the next generation step, not instantly.
    pub fn send_event(&mut self, event: Event) {
        self.engine.send_event(event);
    }

    /// Open a child channel.
    pub fn new_channel(&mut self, start_volume: f64, parent: Option<ChannelId>) -> Result<ChannelId> {
        self.new_channel_pan(Stereo::Identity, start_volume, parent)
    }

    /// Open a child channel at a stereo position.
    pub fn new_channel_pan(
        &mut self,
        pan: Stereo,
        start_volume: f64,
        parent: Option<ChannelId>,
    ) -> Result<ChannelId> {
        let parent = parent.unwrap_or(self.channel);
        let creator = self.creator.clone();
        self.engine
            .channels
            .new_child(parent, start_volume, pan, &creator)
    }

    /// Ramp a channel's volume to `volume` over `interval` seconds,
    /// starting now.
    pub fn set_volume(&mut self, channel: ChannelId, volume: f64, interval: f64) -> Result<()> {
        let interval = self.engine.delay_frames(interval, "interval")?;
        self.engine
            .channels
            .set_volume(channel, volume, self.runtime, interval)
    }

    /// Stop a channel: cut its notes, discard its agents, close its
    /// subtree. Takes effect at the top of the next generation step.
    pub fn stop_channel(&mut self, channel: ChannelId) {
        self.engine.stop_channel(channel);
    }
}
