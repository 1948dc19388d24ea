//! The generation loop.
//!
//! One [`Engine`] owns every collection the soundscape runs on: the
//! scheduled-agent queue, the posted-agent pool, the channel tree, the
//! sample store, and the note mixer. A sink supplies PCM buffers;
//! [`Engine::run`] alternates housekeeping steps with mixing until the
//! last channel closes.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::agent::{Agent, AgentRef};
use crate::channel::{Channel, ChannelId, ChannelTree};
use crate::config::{EngineConfig, MAX_DELAY_SECS};
use crate::context::{AgentCtx, Disposition};
use crate::events::{validate_event_name, Event};
use crate::listen::{ListenAddr, Listener};
use crate::mixer::NoteMixer;
use crate::sample::{SampleId, SampleStore};
use crate::scheduler::{AgentQueue, PostedPool};
use crate::stereo::Stereo;
use crate::{Error, Frames, Result};

/// What a generation step decided about the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Continue,
    /// The last channel closed; the stream ends cleanly.
    Stop,
}

/// The narrow interface the engine drives an audio output through.
///
/// A sink resolves the frame rate and buffer size when it opens; the
/// engine then hands it one rendered buffer of interleaved stereo f32 per
/// generation step. Sinks narrowing to integer PCM must saturate, not
/// wrap. A `write` error is fatal to the stream.
pub trait Sink {
    fn frame_rate(&self) -> u32;

    fn buffer_frames(&self) -> usize;

    fn write(&mut self, frames: &[f32]) -> Result<()>;

    /// The engine trimmed its virtual timebase by `offset` frames.
    fn adjust_timebase(&mut self, _offset: Frames) {}
}

/// Counters for a stats emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub scheduled_agents: usize,
    pub posted_agents: usize,
    pub channels: usize,
    pub samples: usize,
    pub samples_loaded: usize,
    pub samples_unloaded: usize,
    pub samples_virtual: usize,
    pub notes: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} agents ({} scheduled, {} posted)",
            self.scheduled_agents + self.posted_agents,
            self.scheduled_agents,
            self.posted_agents
        )?;
        writeln!(f, "{} channels", self.channels)?;
        writeln!(
            f,
            "{} samples ({} loaded, {} unloaded, {} virtual)",
            self.samples, self.samples_loaded, self.samples_unloaded, self.samples_virtual
        )?;
        write!(f, "{} notes", self.notes)
    }
}

/// A programmable soundscape engine instance.
pub struct Engine {
    config: EngineConfig,
    frame_rate: u32,
    buffer_frames: usize,
    /// Virtual time: the frame stamp of the next buffer to render.
    now: Frames,
    pub(crate) samples: SampleStore,
    pub(crate) channels: ChannelTree,
    pub(crate) mixer: NoteMixer,
    pub(crate) queue: AgentQueue,
    pub(crate) posted: PostedPool,
    pub(crate) post_queue: VecDeque<Event>,
    pub(crate) stoplist: Vec<ChannelId>,
    listener: Option<Listener>,
    last_unload: Frames,
    last_stats: Frames,
    /// Runtime of the agent currently dispatching; nested scheduling
    /// anchors here.
    agent_runtime: Frames,
    pending_trim: Option<Frames>,
}

impl Engine {
    pub fn new(config: EngineConfig, frame_rate: u32, buffer_frames: usize) -> Result<Engine> {
        config.validate()?;
        if frame_rate == 0 {
            return Err(Error::InvalidConfig("frame rate must be positive".into()));
        }
        if buffer_frames == 0 {
            return Err(Error::InvalidConfig("buffer size must be positive".into()));
        }

        let listener = if config.listen {
            let addr = ListenAddr::from_config(config.listen_port.as_deref())?;
            Some(Listener::open(&addr)?)
        } else {
            None
        };

        tracing::info!("engine setting up ({frame_rate} Hz, {buffer_frames}-frame buffers)");
        Ok(Engine {
            samples: SampleStore::with_search_path(config.sound_path.clone()),
            channels: ChannelTree::new(config.master_volume),
            mixer: NoteMixer::new(frame_rate),
            queue: AgentQueue::new(),
            posted: PostedPool::new(),
            post_queue: VecDeque::new(),
            stoplist: Vec::new(),
            listener,
            last_unload: 0,
            last_stats: 0,
            agent_runtime: 0,
            pending_trim: None,
            now: 0,
            frame_rate,
            buffer_frames,
            config,
        })
    }

    /// Build an engine matched to a sink's negotiated rate and buffer.
    pub fn for_sink(config: EngineConfig, sink: &dyn Sink) -> Result<Engine> {
        Engine::new(config, sink.frame_rate(), sink.buffer_frames())
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    /// Current virtual time, in frames.
    pub fn now(&self) -> Frames {
        self.now
    }

    pub fn root_channel(&self) -> ChannelId {
        self.channels.root()
    }

    pub fn channel_is_active(&self, id: ChannelId) -> bool {
        self.channels.is_active(id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut SampleStore {
        &mut self.samples
    }

    pub fn listening(&self) -> bool {
        self.listener.is_some()
    }

    /// The listener's bound TCP address, when listening over TCP.
    pub fn listener_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    pub fn stats(&self) -> Stats {
        let store = self.samples.stats();
        Stats {
            scheduled_agents: self.queue.len(),
            posted_agents: self.posted.len(),
            channels: self.channels.len(),
            samples: store.total,
            samples_loaded: store.loaded,
            samples_unloaded: store.unloaded,
            samples_virtual: store.virtual_samples,
            notes: store.note_refs,
        }
    }

    /// Hand an agent to the engine: scheduled after `delay` seconds, or
    /// posted for its watched events. `None` targets the root channel.
    pub fn add_agent(
        &mut self,
        agent: AgentRef,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<()> {
        let channel = channel.unwrap_or_else(|| self.channels.root());
        match agent {
            AgentRef::Scheduled(agent) => {
                let frames = self.delay_frames(delay, "delay time")?;
                self.schedule_boxed(agent, self.agent_runtime + frames, channel, Some(delay))
            }
            AgentRef::Posted(agent) => self.post_agent_now(agent, channel),
        }
    }

    pub fn schedule_agent(
        &mut self,
        agent: Box<dyn Agent>,
        delay: f64,
        channel: Option<ChannelId>,
    ) -> Result<()> {
        self.add_agent(AgentRef::Scheduled(agent), delay, channel)
    }

    pub fn post_agent(&mut self, agent: Box<dyn Agent>, channel: Option<ChannelId>) -> Result<()> {
        self.add_agent(AgentRef::Posted(agent), 0.0, channel)
    }

    /// Insert an event as if it had arrived from the listener.
    pub fn send_event(&mut self, event: Event) {
        self.post_queue.push_back(event);
    }

    /// Queue a channel for teardown at the top of the next step.
    pub fn stop_channel(&mut self, channel: ChannelId) {
        self.stoplist.push(channel);
    }

    /// Drive the sink until the soundscape ends or the sink fails.
    pub fn run(&mut self, sink: &mut dyn Sink) -> Result<()> {
        if sink.frame_rate() != self.frame_rate || sink.buffer_frames() != self.buffer_frames {
            return Err(Error::InvalidConfig(format!(
                "sink runs {} Hz / {}-frame buffers, engine expects {} Hz / {}",
                sink.frame_rate(),
                sink.buffer_frames(),
                self.frame_rate,
                self.buffer_frames
            )));
        }
        let mut buf = vec![0.0f32; self.buffer_frames * 2];
        loop {
            if self.generation_step()? == GenerationOutcome::Stop {
                tracing::info!("generation finished");
                return Ok(());
            }
            if let Some(offset) = self.pending_trim.take() {
                sink.adjust_timebase(offset);
            }
            self.render(&mut buf)?;
            sink.write(&buf)?;
        }
    }

    /// One housekeeping pass between buffers: trim, unload, stats,
    /// stop-list, event poll, agent dispatch, envelope update, auto-close.
    pub fn generation_step(&mut self) -> Result<GenerationOutcome> {
        if self.now >= self.config.trim_threshold {
            self.trim_timebase();
        }

        if self.last_unload + self.config.unload_interval < self.now {
            self.last_unload = self.now;
            self.samples.unload_idle(self.now - self.config.unload_age);
        }

        if let Some(interval) = self.config.stats_interval {
            let interval = (interval * self.frame_rate as f64) as Frames;
            if self.last_stats + interval < self.now {
                self.last_stats = self.now;
                tracing::info!(target: "stats", "{}", self.stats());
            }
        }

        let stoplist = std::mem::take(&mut self.stoplist);
        for channel in stoplist {
            if self.channels.is_active(channel) {
                self.realstop(channel)?;
            }
        }

        if let Some(listener) = self.listener.as_mut() {
            let queue = &mut self.post_queue;
            listener.poll(|event| queue.push_back(event))?;
        }

        self.agent_runtime = self.now;
        self.dispatch_posted();
        self.dispatch_scheduled();

        self.channels
            .update_volumes(self.now + self.buffer_frames as Frames);

        for id in self.channels.empty_channels() {
            self.channels.close(id)?;
        }
        if self.channels.is_empty() {
            return Ok(GenerationOutcome::Stop);
        }
        Ok(GenerationOutcome::Continue)
    }

    /// Mix the coming buffer and advance virtual time past it.
    pub fn render(&mut self, buf: &mut [f32]) -> Result<()> {
        if buf.len() != self.buffer_frames * 2 {
            return Err(Error::Internal(format!(
                "render buffer holds {} samples, expected {}",
                buf.len(),
                self.buffer_frames * 2
            )));
        }
        let finished = self
            .mixer
            .render(buf, self.now, self.buffer_frames, &self.samples, &self.channels);
        for note in finished {
            self.samples.release(note.sample)?;
            self.channels.remove_note(note.channel)?;
        }
        self.now += self.buffer_frames as Frames;
        Ok(())
    }

    fn trim_timebase(&mut self) {
        let offset = self.config.trim_offset;
        self.now -= offset;
        self.last_unload -= offset;
        self.last_stats -= offset;
        self.agent_runtime -= offset;
        self.samples.adjust_timebase(offset, self.config.unload_age);
        self.queue.adjust_timebase(offset);
        self.channels.adjust_timebase(offset, self.now);
        self.mixer.adjust_timebase(offset);
        self.pending_trim = Some(self.pending_trim.unwrap_or(0) + offset);
        tracing::debug!("timebase trimmed by {offset} frames");
    }

    /// Tear a channel subtree down: cut its notes, unqueue and unpost its
    /// agents, close every channel deepest-first.
    fn realstop(&mut self, channel: ChannelId) -> Result<()> {
        let subtree = self.channels.subtree(channel);

        for note in self.mixer.stop_channel_notes(&subtree) {
            self.samples.release(note.sample)?;
            self.channels.remove_note(note.channel)?;
        }

        for entry in self.queue.remove_channels(&subtree) {
            tracing::debug!("unscheduled \"{}\"", entry.agent.name());
            self.channels.remove_agent(entry.channel)?;
        }

        for id in self.posted.ids_in_channels(&subtree) {
            let entry = self
                .posted
                .unpost(id)
                .map_err(|e| Error::Internal(e.to_string()))?;
            self.channels.remove_agent(entry.channel)?;
        }

        for id in &subtree {
            self.channels.close(*id)?;
        }
        Ok(())
    }

    /// Deliver queued events to their watchers, FIFO in receipt order.
    fn dispatch_posted(&mut self) {
        let mut runnable = Vec::new();
        while let Some(event) = self.post_queue.pop_front() {
            for id in self.posted.watchers(event.name()) {
                runnable.push((id, event.clone()));
            }
        }

        for (id, event) in runnable {
            // May have been unposted by an earlier handler this step.
            if !self.posted.is_posted(id) {
                continue;
            }
            let channel = match self.posted.channel_of(id) {
                Some(channel) => channel,
                None => continue,
            };
            if !self.channels.is_active(channel) {
                tracing::error!("internal: posted agent not in active channel");
                continue;
            }
            let Some(mut agent) = self.posted.take_agent(id) else {
                continue;
            };
            let name = agent.name().to_string();
            tracing::debug!("running \"{name}\" on {event}");

            let now = self.now;
            let mut ctx = AgentCtx::for_receive(self, channel, now, name.clone());
            let result = agent.receive(&event, &mut ctx);
            let disposition = ctx.disposition;
            if let Err(e) = result {
                self.report_agent_error(&name, &e);
            }

            match disposition {
                Disposition::Unpost => {
                    if let Ok(entry) = self.posted.unpost(id) {
                        tracing::debug!("unposted \"{name}\"");
                        if let Err(e) = self.channels.remove_agent(entry.channel) {
                            tracing::error!("internal: {e}");
                        }
                    }
                }
                _ => self.posted.put_agent(id, agent),
            }
        }
    }

    /// Pop and run every scheduled agent due inside the coming buffer.
    fn dispatch_scheduled(&mut self) {
        let horizon = self.now + self.buffer_frames as Frames;
        while self
            .queue
            .peek_runtime()
            .is_some_and(|runtime| runtime < horizon)
        {
            let Some(mut entry) = self.queue.pop() else {
                break;
            };
            let name = entry.agent.name().to_string();

            if let Err(e) = self.channels.remove_agent(entry.channel) {
                tracing::error!("internal: queued agent not in active channel: {e}");
                continue;
            }

            self.agent_runtime = entry.runtime;
            tracing::debug!("running \"{name}\"");
            let mut ctx = AgentCtx::for_run(
                self,
                entry.channel,
                entry.runtime,
                entry.original_delay,
                name.clone(),
            );
            let result = entry.agent.run(&mut ctx);
            let disposition = ctx.disposition;
            if let Err(e) = result {
                self.report_agent_error(&name, &e);
            }

            match disposition {
                Disposition::None | Disposition::Unpost => {}
                Disposition::Reschedule {
                    runtime,
                    delay_secs,
                } => {
                    if let Err(e) =
                        self.schedule_boxed(entry.agent, runtime, entry.channel, Some(delay_secs))
                    {
                        self.report_agent_error(&name, &e);
                    }
                }
                Disposition::Post => {
                    if let Err(e) = self.post_agent_now(entry.agent, entry.channel) {
                        self.report_agent_error(&name, &e);
                    }
                }
            }
        }
    }

    /// Convert a seconds argument to frames, enforcing the scheduling
    /// bounds.
    pub(crate) fn delay_frames(&self, secs: f64, what: &str) -> Result<Frames> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(Error::Schedule(format!("negative {what}")));
        }
        if secs > MAX_DELAY_SECS {
            return Err(Error::Schedule(format!("{what} too long")));
        }
        Ok((secs * self.frame_rate as f64) as Frames)
    }

    /// Allocate a note and add it to the mixer. Returns its duration in
    /// frames.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn queue_note(
        &mut self,
        sample: SampleId,
        pitch: f64,
        volume: f64,
        pan: Stereo,
        start: Frames,
        duration: Option<Frames>,
        channel: ChannelId,
    ) -> Result<Frames> {
        if !self.channels.is_active(channel) {
            return Err(Error::Channel(
                "cannot schedule note to inactive channel".into(),
            ));
        }
        let (sample, pitch) = self.samples.resolve(sample, pitch)?;
        let (pcm, generation) = self.samples.ensure_loaded(sample)?;
        let stereo = self.channels.compose_stereo(channel, pan)?;

        let frames = match duration {
            None => self.mixer.add_note(
                sample, generation, &pcm, pitch, volume, stereo, channel, start,
            )?,
            Some(duration) => {
                let loop_region = self.samples.loop_region(sample)?;
                self.mixer.add_note_duration(
                    sample,
                    generation,
                    &pcm,
                    loop_region,
                    pitch,
                    volume,
                    stereo,
                    channel,
                    start,
                    duration,
                )?
            }
        };

        self.channels.add_note(channel)?;
        self.samples.acquire(sample, start + frames);
        Ok(frames)
    }

    pub(crate) fn schedule_boxed(
        &mut self,
        agent: Box<dyn Agent>,
        runtime: Frames,
        channel: ChannelId,
        original_delay: Option<f64>,
    ) -> Result<()> {
        if !self.channels.is_active(channel) {
            return Err(Error::Channel(
                "cannot schedule agent to inactive channel".into(),
            ));
        }
        self.channels.add_agent(channel)?;
        tracing::debug!("scheduled \"{}\" for frame {runtime}", agent.name());
        self.queue.push(agent, runtime, channel, original_delay);
        Ok(())
    }

    pub(crate) fn post_agent_now(&mut self, agent: Box<dyn Agent>, channel: ChannelId) -> Result<()> {
        if self.listener.is_none() {
            return Err(Error::Schedule(format!(
                "event listening disabled -- cannot post \"{}\"",
                agent.name()
            )));
        }
        if !self.channels.is_active(channel) {
            return Err(Error::Channel("cannot post agent to inactive channel".into()));
        }
        let watches = agent.watch_events();
        if watches.is_empty() {
            return Err(Error::Schedule(format!(
                "\"{}\" has no watch_events",
                agent.name()
            )));
        }
        for name in &watches {
            validate_event_name(name)?;
        }
        self.channels.add_agent(channel)?;
        tracing::debug!("posted \"{}\" watching {watches:?}", agent.name());
        self.posted.post(agent, channel, watches);
        Ok(())
    }

    fn report_agent_error(&self, name: &str, error: &Error) {
        if self.config.verbose_errors {
            tracing::error!("\"{name}\" failed: {error} ({error:?})");
        } else {
            tracing::error!("\"{name}\" failed: {error}");
        }
    }

    /// Check the cross-collection invariants: channel counts match their
    /// dependents, queued agents live in active channels, the heap top is
    /// minimal, and sample refcounts equal their active notes.
    pub fn validate(&self) -> Result<()> {
        let mut agent_counts: HashMap<ChannelId, u32> = HashMap::new();
        for channel in self.queue.channels() {
            if !self.channels.is_active(channel) {
                return Err(Error::Internal("queued agent in inactive channel".into()));
            }
            *agent_counts.entry(channel).or_default() += 1;
        }
        for channel in self.posted.channels() {
            if !self.channels.is_active(channel) {
                return Err(Error::Internal("posted agent in inactive channel".into()));
            }
            *agent_counts.entry(channel).or_default() += 1;
        }

        if let Some(top) = self.queue.peek_runtime() {
            if self.queue.runtimes().into_iter().any(|t| t < top) {
                return Err(Error::Internal("queue head is not minimal".into()));
            }
        }

        for (id, node) in self.channels.iter() {
            if node.agent_count() != agent_counts.get(&id).copied().unwrap_or(0) {
                return Err(Error::Internal(format!(
                    "channel agent count {} does not match {} dependents",
                    node.agent_count(),
                    agent_counts.get(&id).copied().unwrap_or(0)
                )));
            }
            if node.note_count() as usize != self.mixer.notes_in_channel(id) {
                return Err(Error::Internal("channel note count mismatch".into()));
            }
            let children = self
                .channels
                .iter()
                .filter(|(_, other)| other.parent() == Some(id))
                .count();
            if node.child_count() as usize != children {
                return Err(Error::Internal("channel child count mismatch".into()));
            }
            if let Some(parent) = node.parent() {
                let parent = self
                    .channels
                    .get(parent)
                    .ok_or_else(|| Error::Internal("parent inactive before child".into()))?;
                if parent.depth() + 1 != node.depth() {
                    return Err(Error::Internal("channel depth mismatch".into()));
                }
            }
        }

        for id in self.samples.ids() {
            let refs = self.samples.ref_count(id)?;
            if refs as usize != self.mixer.notes_referencing(id) {
                return Err(Error::Internal(format!(
                    "sample \"{}\" refcount {} does not match {} notes",
                    self.samples.name_of(id),
                    refs,
                    self.mixer.notes_referencing(id)
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Pcm;

    fn test_engine(master: f64) -> Engine {
        Engine::new(
            EngineConfig {
                master_volume: master,
                ..Default::default()
            },
            1000,
            100,
        )
        .unwrap()
    }

    fn tone(engine: &mut Engine, name: &str, frames: usize, value: f32) -> SampleId {
        let pcm = Pcm::new(1000, 1, vec![value; frames]).unwrap();
        engine.samples_mut().insert_pcm(name, pcm, None).unwrap()
    }

    struct NoteOnce {
        sample: SampleId,
    }

    impl Agent for NoteOnce {
        fn name(&self) -> &str {
            "note once"
        }

        fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
            ctx.schedule_note(self.sample, 1.0, 1.0, 0.0, None)?;
            Ok(())
        }
    }

    #[test]
    fn test_single_note_then_stop() {
        let mut engine = test_engine(0.5);
        let sample = tone(&mut engine, "s", 150, 1.0);
        engine
            .schedule_agent(Box::new(NoteOnce { sample }), 0.0, None)
            .unwrap();

        let mut buf = vec![0.0f32; 200];
        assert_eq!(
            engine.generation_step().unwrap(),
            GenerationOutcome::Continue
        );
        engine.validate().unwrap();
        engine.render(&mut buf).unwrap();
        assert!((buf[0] - 0.5).abs() < 1e-6);

        assert_eq!(
            engine.generation_step().unwrap(),
            GenerationOutcome::Continue
        );
        engine.render(&mut buf).unwrap();
        // Note ends at frame 150; root is empty on the next step.
        assert_eq!(engine.stats().notes, 0);
        assert_eq!(engine.generation_step().unwrap(), GenerationOutcome::Stop);
    }

    struct FailingAgent;

    impl Agent for FailingAgent {
        fn name(&self) -> &str {
            "doomed"
        }

        fn run(&mut self, _ctx: &mut AgentCtx<'_>) -> Result<()> {
            Err(Error::Sample("no such sound".into()))
        }
    }

    #[test]
    fn test_agent_errors_are_trapped() {
        let mut engine = test_engine(0.5);
        engine
            .schedule_agent(Box::new(FailingAgent), 0.0, None)
            .unwrap();
        // The error is logged, not propagated; the stream ends because
        // nothing remains.
        assert_eq!(engine.generation_step().unwrap(), GenerationOutcome::Stop);
    }

    struct SpawnTree;

    impl Agent for SpawnTree {
        fn name(&self) -> &str {
            "spawner"
        }

        fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
            let c1 = ctx.new_channel(1.0, None)?;
            let c2 = ctx.new_channel(1.0, Some(c1))?;
            ctx.schedule_agent(Box::new(FailingAgent), 5.0, Some(c1))?;
            ctx.schedule_agent(Box::new(FailingAgent), 5.0, Some(c2))?;
            ctx.stop_channel(c1);
            Ok(())
        }
    }

    #[test]
    fn test_stop_cascades_through_subtree() {
        let mut engine = test_engine(0.5);
        engine
            .schedule_agent(Box::new(SpawnTree), 0.0, None)
            .unwrap();

        engine.generation_step().unwrap();
        engine.validate().unwrap();
        assert_eq!(engine.stats().scheduled_agents, 2);
        assert_eq!(engine.stats().channels, 3);

        // The stop-list drains at the top of the next step; the stopped
        // subtree takes its agents with it and the empty root closes.
        assert_eq!(engine.generation_step().unwrap(), GenerationOutcome::Stop);
        assert_eq!(engine.stats().scheduled_agents, 0);
        assert_eq!(engine.stats().channels, 0);
    }

    #[test]
    fn test_delay_bounds() {
        let mut engine = test_engine(0.5);
        let err = engine.schedule_agent(Box::new(FailingAgent), -1.0, None);
        assert!(matches!(err, Err(Error::Schedule(_))));
        let err = engine.schedule_agent(Box::new(FailingAgent), 3700.0, None);
        assert!(matches!(err, Err(Error::Schedule(_))));
    }

    #[test]
    fn test_posting_requires_listener() {
        let mut engine = test_engine(0.5);
        let err = engine.post_agent(Box::new(FailingAgent), None);
        assert!(matches!(err, Err(Error::Schedule(_))));
    }

    struct Recorder {
        log: std::sync::Arc<std::sync::Mutex<Vec<Frames>>>,
        period: f64,
        remaining: usize,
    }

    impl Agent for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
            self.log.lock().unwrap().push(ctx.runtime());
            if self.remaining > 0 {
                self.remaining -= 1;
                ctx.reschedule(Some(self.period))?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_reschedule_anchors_at_runtime() {
        let mut engine = test_engine(0.5);
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        engine
            .schedule_agent(
                Box::new(Recorder {
                    log: log.clone(),
                    period: 0.25,
                    remaining: 4,
                }),
                0.0,
                None,
            )
            .unwrap();

        let mut buf = vec![0.0f32; 200];
        for _ in 0..12 {
            if engine.generation_step().unwrap() == GenerationOutcome::Stop {
                break;
            }
            engine.validate().unwrap();
            engine.render(&mut buf).unwrap();
        }
        // Period 0.25 s at 1000 Hz: exact multiples of 250, regardless of
        // the 100-frame buffer grid.
        assert_eq!(*log.lock().unwrap(), vec![0, 250, 500, 750, 1000]);
    }

    struct ParamNote {
        sample: SampleId,
    }

    impl Agent for ParamNote {
        fn name(&self) -> &str {
            "param note"
        }

        fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
            ctx.schedule_note_with(
                self.sample,
                crate::agent::NoteParams {
                    volume: Some(0.25),
                    pan: Some(Stereo::shift(1.0)),
                    ..Default::default()
                },
            )?;
            Ok(())
        }
    }

    #[test]
    fn test_schedule_note_with_params() {
        let mut engine = test_engine(1.0);
        let sample = tone(&mut engine, "s", 50, 1.0);
        engine
            .schedule_agent(Box::new(ParamNote { sample }), 0.0, None)
            .unwrap();

        let mut buf = vec![0.0f32; 200];
        engine.generation_step().unwrap();
        engine.render(&mut buf).unwrap();
        // Hard-panned right at a quarter volume.
        assert!((buf[0] - 0.0).abs() < 1e-6);
        assert!((buf[1] - 0.25).abs() < 1e-6);
    }

    struct TickOnce {
        seen: std::sync::Arc<std::sync::Mutex<usize>>,
    }

    impl Agent for TickOnce {
        fn name(&self) -> &str {
            "tick once"
        }

        fn run(&mut self, ctx: &mut AgentCtx<'_>) -> Result<()> {
            ctx.post_self()
        }

        fn watch_events(&self) -> Vec<String> {
            vec!["tick".into()]
        }

        fn receive(&mut self, _event: &Event, ctx: &mut AgentCtx<'_>) -> Result<()> {
            *self.seen.lock().unwrap() += 1;
            ctx.unpost_self()
        }
    }

    #[test]
    fn test_post_self_then_unpost() {
        let mut engine = Engine::new(
            EngineConfig {
                listen: true,
                listen_port: Some("0".into()),
                ..Default::default()
            },
            1000,
            100,
        )
        .unwrap();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(0));
        engine
            .schedule_agent(Box::new(TickOnce { seen: seen.clone() }), 0.0, None)
            .unwrap();

        // The scheduled run turns into an event-watching post.
        engine.generation_step().unwrap();
        engine.validate().unwrap();
        assert_eq!(engine.stats().scheduled_agents, 0);
        assert_eq!(engine.stats().posted_agents, 1);

        // One event fires it; the unpost empties the tree.
        engine.send_event("tick".parse().unwrap());
        assert_eq!(engine.generation_step().unwrap(), GenerationOutcome::Stop);
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(engine.stats().posted_agents, 0);
    }

    #[test]
    fn test_send_event_seen_next_step() {
        let mut engine = Engine::new(
            EngineConfig {
                listen: true,
                listen_port: Some("0".into()),
                ..Default::default()
            },
            1000,
            100,
        )
        .unwrap();

        struct Echo {
            seen: std::sync::Arc<std::sync::Mutex<Vec<Event>>>,
        }

        impl Agent for Echo {
            fn name(&self) -> &str {
                "echo"
            }

            fn run(&mut self, _ctx: &mut AgentCtx<'_>) -> Result<()> {
                Ok(())
            }

            fn watch_events(&self) -> Vec<String> {
                vec!["ping".into()]
            }

            fn receive(&mut self, event: &Event, _ctx: &mut AgentCtx<'_>) -> Result<()> {
                self.seen.lock().unwrap().push(event.clone());
                Ok(())
            }
        }

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        engine
            .post_agent(Box::new(Echo { seen: seen.clone() }), None)
            .unwrap();
        engine.send_event("ping pong".parse().unwrap());
        engine.send_event("other".parse().unwrap());

        engine.generation_step().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].args(), ["pong"]);
    }
}
