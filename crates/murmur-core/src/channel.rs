//! The channel tree.
//!
//! Channels group notes and agents into a hierarchy of volume and stereo
//! scopes. The tree is an arena keyed by generational ids: parents,
//! ancestors, and the root are ids rather than owning references, so
//! stopping a subtree is an arena walk and stale handles fail closed.

use smallvec::SmallVec;

use crate::stereo::Stereo;
use crate::{Error, Frames, Result};

/// Stable handle to a channel. A slot's generation advances when the
/// channel closes, so ids held past a stop never alias a newer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    index: u32,
    generation: u32,
}

/// A linear volume ramp. Outside `[start, end]` the envelope sits at the
/// corresponding endpoint value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeEnvelope {
    pub start: Frames,
    pub end: Frames,
    pub from: f64,
    pub to: f64,
}

impl VolumeEnvelope {
    /// An envelope already at steady state.
    pub fn steady(volume: f64) -> VolumeEnvelope {
        VolumeEnvelope {
            start: 0,
            end: 0,
            from: volume,
            to: volume,
        }
    }

    pub fn value_at(&self, t: Frames) -> f64 {
        if t >= self.end {
            self.to
        } else if t >= self.start {
            (t - self.start) as f64 / (self.end - self.start) as f64 * (self.to - self.from)
                + self.from
        } else {
            self.from
        }
    }
}

/// One node of the channel tree.
pub struct Channel {
    parent: Option<ChannelId>,
    depth: u32,
    /// Root first, immediate parent last.
    ancestors: SmallVec<[ChannelId; 8]>,
    volume: VolumeEnvelope,
    stereo: Stereo,
    /// Chain-volume bounds for the buffer being rendered: the value at the
    /// previous buffer boundary and the one just computed.
    prev_volume: f64,
    last_volume: f64,
    note_count: u32,
    agent_count: u32,
    child_count: u32,
    creator: String,
}

impl Channel {
    pub fn parent(&self) -> Option<ChannelId> {
        self.parent
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn ancestors(&self) -> &[ChannelId] {
        &self.ancestors
    }

    pub fn stereo(&self) -> Stereo {
        self.stereo
    }

    pub fn volume_envelope(&self) -> VolumeEnvelope {
        self.volume
    }

    pub fn last_volume(&self) -> f64 {
        self.last_volume
    }

    pub fn note_count(&self) -> u32 {
        self.note_count
    }

    pub fn agent_count(&self) -> u32 {
        self.agent_count
    }

    pub fn child_count(&self) -> u32 {
        self.child_count
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    fn is_empty(&self) -> bool {
        self.note_count == 0 && self.agent_count == 0 && self.child_count == 0
    }
}

struct Slot {
    generation: u32,
    node: Option<Channel>,
}

/// Arena of channels rooted at a single master channel.
pub struct ChannelTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ChannelId,
    len: usize,
}

impl ChannelTree {
    pub fn new(master_volume: f64) -> ChannelTree {
        let root = Channel {
            parent: None,
            depth: 0,
            ancestors: SmallVec::new(),
            volume: VolumeEnvelope::steady(master_volume),
            stereo: Stereo::Identity,
            prev_volume: master_volume,
            last_volume: master_volume,
            note_count: 0,
            agent_count: 0,
            child_count: 0,
            creator: "<engine>".to_string(),
        };
        ChannelTree {
            slots: vec![Slot {
                generation: 0,
                node: Some(root),
            }],
            free: Vec::new(),
            root: ChannelId {
                index: 0,
                generation: 0,
            },
            len: 1,
        }
    }

    pub fn root(&self) -> ChannelId {
        self.root
    }

    /// Number of active channels.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_active(&self, id: ChannelId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn require(&self, id: ChannelId) -> Result<&Channel> {
        self.get(id)
            .ok_or_else(|| Error::Channel("channel is inactive".into()))
    }

    fn require_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.get_mut(id)
            .ok_or_else(|| Error::Channel("channel is inactive".into()))
    }

    /// Open a child of `parent` with a steady starting volume.
    pub fn new_child(
        &mut self,
        parent: ChannelId,
        start_volume: f64,
        stereo: Stereo,
        creator: &str,
    ) -> Result<ChannelId> {
        let (depth, mut ancestors) = {
            let node = self
                .get(parent)
                .ok_or_else(|| Error::Channel("cannot open a child of an inactive channel".into()))?;
            (node.depth + 1, node.ancestors.clone())
        };
        ancestors.push(parent);

        let child = Channel {
            parent: Some(parent),
            depth,
            ancestors,
            volume: VolumeEnvelope::steady(start_volume),
            stereo,
            prev_volume: start_volume,
            last_volume: start_volume,
            note_count: 0,
            agent_count: 0,
            child_count: 0,
            creator: creator.to_string(),
        };

        self.require_mut(parent)?.child_count += 1;

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(child);
                ChannelId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(child),
                });
                ChannelId {
                    index,
                    generation: 0,
                }
            }
        };
        self.len += 1;
        tracing::debug!("opened channel depth-{depth} (out of {creator})");
        Ok(id)
    }

    /// Start a volume ramp at `now`. A ramp that would end before the
    /// current one is dropped entirely; rapid overlapping changes collapse
    /// to the one that extends furthest.
    pub fn set_volume(
        &mut self,
        id: ChannelId,
        new_volume: f64,
        now: Frames,
        interval: Frames,
    ) -> Result<()> {
        let node = self.require_mut(id)?;
        let end = now + interval;
        if end >= node.volume.end {
            node.volume = VolumeEnvelope {
                start: now,
                end,
                from: node.last_volume,
                to: new_volume,
            };
        }
        Ok(())
    }

    /// Close an empty channel. Counts must all be zero.
    pub fn close(&mut self, id: ChannelId) -> Result<()> {
        let parent = {
            let node = self.require(id)?;
            if node.child_count > 0 {
                return Err(Error::Internal("channel has children at close".into()));
            }
            if node.agent_count > 0 {
                return Err(Error::Internal("channel has agents at close".into()));
            }
            if node.note_count > 0 {
                return Err(Error::Internal("channel has notes at close".into()));
            }
            node.parent
        };

        if let Some(parent) = parent {
            let node = self
                .get_mut(parent)
                .ok_or_else(|| Error::Internal("parent closed before child".into()))?;
            if node.child_count == 0 {
                return Err(Error::Internal("channel childcount negative".into()));
            }
            node.child_count -= 1;
        }

        let slot = &mut self.slots[id.index as usize];
        let node = slot
            .node
            .take()
            .ok_or_else(|| Error::Internal("channel vanished during close".into()))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        tracing::debug!(
            "closed channel depth-{} (out of {})",
            node.depth,
            node.creator
        );
        Ok(())
    }

    /// Active ids of `id` and every descendant, deepest first (so closing
    /// in order drains child counts naturally).
    pub fn subtree(&self, id: ChannelId) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self
            .iter()
            .filter(|(chan_id, node)| *chan_id == id || node.ancestors.contains(&id))
            .map(|(chan_id, _)| chan_id)
            .collect();
        ids.sort_by_key(|chan_id| {
            std::cmp::Reverse(self.get(*chan_id).map(|n| n.depth).unwrap_or(0))
        });
        ids
    }

    /// Iterate active channels.
    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    ChannelId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Channels with no notes, agents, or children. The root is included.
    pub fn empty_channels(&self) -> Vec<ChannelId> {
        self.iter()
            .filter(|(_, node)| node.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    /// Advance every channel's interpolation window to `next_time` (the
    /// end of the buffer about to be rendered).
    pub fn update_volumes(&mut self, next_time: Frames) {
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                node.prev_volume = node.last_volume;
                node.last_volume = node.volume.value_at(next_time);
            }
        }
    }

    /// Product of the (previous, current) volumes along the chain from
    /// the root down to `id`; what the mixer applies to a note.
    pub fn chain_volume_bounds(&self, id: ChannelId) -> Option<(f64, f64)> {
        let node = self.get(id)?;
        let mut prev = node.prev_volume;
        let mut last = node.last_volume;
        for ancestor in &node.ancestors {
            let node = self.get(*ancestor)?;
            prev *= node.prev_volume;
            last *= node.last_volume;
        }
        Some((prev, last))
    }

    /// Composition of the stereo transforms from the root down to `id`,
    /// applied on top of a note's own pan.
    pub fn compose_stereo(&self, id: ChannelId, note_pan: Stereo) -> Result<Stereo> {
        let node = self.require(id)?;
        let mut acc = node.stereo.compose(note_pan);
        for ancestor in node.ancestors.iter().rev() {
            acc = self.require(*ancestor)?.stereo.compose(acc);
        }
        Ok(acc)
    }

    /// Shift envelope endpoints down after a timebase trim. Envelopes
    /// that already ended stay put (their value is a constant anyway).
    pub fn adjust_timebase(&mut self, offset: Frames, now: Frames) {
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                if node.volume.end <= now {
                    continue;
                }
                node.volume.start -= offset;
                node.volume.end -= offset;
            }
        }
    }

    pub fn add_note(&mut self, id: ChannelId) -> Result<()> {
        self.require_mut(id)?.note_count += 1;
        Ok(())
    }

    pub fn remove_note(&mut self, id: ChannelId) -> Result<()> {
        let node = self.require_mut(id)?;
        if node.note_count == 0 {
            return Err(Error::Internal("channel notecount negative".into()));
        }
        node.note_count -= 1;
        Ok(())
    }

    pub fn add_agent(&mut self, id: ChannelId) -> Result<()> {
        self.require_mut(id)?.agent_count += 1;
        Ok(())
    }

    pub fn remove_agent(&mut self, id: ChannelId) -> Result<()> {
        let node = self.require_mut(id)?;
        if node.agent_count == 0 {
            return Err(Error::Internal("channel agentcount negative".into()));
        }
        node.agent_count -= 1;
        Ok(())
    }
}
