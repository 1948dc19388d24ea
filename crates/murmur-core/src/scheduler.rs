//! Agent scheduling collections: the time-ordered queue of scheduled
//! agents and the pool of posted (event-watching) agents.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::agent::Agent;
use crate::channel::ChannelId;
use crate::{Error, Frames, Result};

/// One queued agent. Entries own their agent, so an agent can never be
/// queued twice.
pub(crate) struct ScheduledEntry {
    pub runtime: Frames,
    /// Insertion counter; ties on `runtime` dispatch in insertion order.
    pub seq: u64,
    pub channel: ChannelId,
    /// Delay recorded at the most recent explicit scheduling, used by
    /// parameterless reschedules.
    pub original_delay: Option<f64>,
    pub agent: Box<dyn Agent>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.runtime == other.runtime && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // (runtime, seq) on top.
        (other.runtime, other.seq).cmp(&(self.runtime, self.seq))
    }
}

/// Min-heap of scheduled agents keyed by `(runtime, seq)`.
pub(crate) struct AgentQueue {
    heap: BinaryHeap<ScheduledEntry>,
    next_seq: u64,
}

impl AgentQueue {
    pub fn new() -> AgentQueue {
        AgentQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn push(
        &mut self,
        agent: Box<dyn Agent>,
        runtime: Frames,
        channel: ChannelId,
        original_delay: Option<f64>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEntry {
            runtime,
            seq,
            channel,
            original_delay,
            agent,
        });
    }

    pub fn peek_runtime(&self) -> Option<Frames> {
        self.heap.peek().map(|entry| entry.runtime)
    }

    pub fn pop(&mut self) -> Option<ScheduledEntry> {
        self.heap.pop()
    }

    /// Unqueue every agent whose channel is in `channels`, preserving the
    /// order of the rest.
    pub fn remove_channels(&mut self, channels: &[ChannelId]) -> Vec<ScheduledEntry> {
        let mut kept = Vec::with_capacity(self.heap.len());
        let mut removed = Vec::new();
        for entry in self.heap.drain() {
            if channels.contains(&entry.channel) {
                removed.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.heap = kept.into();
        removed
    }

    pub fn adjust_timebase(&mut self, offset: Frames) {
        let mut entries: Vec<ScheduledEntry> = self.heap.drain().collect();
        for entry in &mut entries {
            entry.runtime -= offset;
        }
        self.heap = entries.into();
    }

    /// Runtimes of every queued agent, for invariant checks.
    pub fn runtimes(&self) -> Vec<Frames> {
        self.heap.iter().map(|entry| entry.runtime).collect()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.heap.iter().map(|entry| entry.channel).collect()
    }
}

/// Handle to a posted agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PostedId {
    index: u32,
    generation: u32,
}

pub(crate) struct PostedEntry {
    pub channel: ChannelId,
    pub watches: Vec<String>,
    /// Checked out (`None`) while the agent's `receive` runs.
    pub agent: Option<Box<dyn Agent>>,
}

struct PostedSlot {
    generation: u32,
    entry: Option<PostedEntry>,
}

/// The posted-agent pool and its event-name registry.
pub(crate) struct PostedPool {
    slots: Vec<PostedSlot>,
    free: Vec<u32>,
    registry: HashMap<String, Vec<PostedId>>,
    len: usize,
}

impl PostedPool {
    pub fn new() -> PostedPool {
        PostedPool {
            slots: Vec::new(),
            free: Vec::new(),
            registry: HashMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn post(
        &mut self,
        agent: Box<dyn Agent>,
        channel: ChannelId,
        watches: Vec<String>,
    ) -> PostedId {
        let entry = PostedEntry {
            channel,
            watches: watches.clone(),
            agent: Some(agent),
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                PostedId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(PostedSlot {
                    generation: 0,
                    entry: Some(entry),
                });
                PostedId {
                    index,
                    generation: 0,
                }
            }
        };
        for name in watches {
            self.registry.entry(name).or_default().push(id);
        }
        self.len += 1;
        id
    }

    pub fn unpost(&mut self, id: PostedId) -> Result<PostedEntry> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or_else(|| Error::Schedule("agent is not posted".into()))?;
        let entry = slot
            .entry
            .take()
            .ok_or_else(|| Error::Schedule("agent is not posted".into()))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        for name in &entry.watches {
            if let Some(ids) = self.registry.get_mut(name) {
                ids.retain(|other| *other != id);
            }
        }
        Ok(entry)
    }

    pub fn is_posted(&self, id: PostedId) -> bool {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| slot.entry.is_some())
            .unwrap_or(false)
    }

    pub fn channel_of(&self, id: PostedId) -> Option<ChannelId> {
        self.get(id).map(|entry| entry.channel)
    }

    fn get(&self, id: PostedId) -> Option<&PostedEntry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    /// Agents watching `event_name`, in posting order.
    pub fn watchers(&self, event_name: &str) -> Vec<PostedId> {
        self.registry.get(event_name).cloned().unwrap_or_default()
    }

    /// Check the agent box out of its slot for a `receive` call.
    pub fn take_agent(&mut self, id: PostedId) -> Option<Box<dyn Agent>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .and_then(|entry| entry.agent.take())
    }

    pub fn put_agent(&mut self, id: PostedId, agent: Box<dyn Agent>) {
        if let Some(entry) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
        {
            entry.agent = Some(agent);
        }
    }

    /// Posted agents living in any of the given channels.
    pub fn ids_in_channels(&self, channels: &[ChannelId]) -> Vec<PostedId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                if channels.contains(&entry.channel) {
                    Some(PostedId {
                        index: index as u32,
                        generation: slot.generation,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|entry| entry.channel))
            .collect()
    }
}
