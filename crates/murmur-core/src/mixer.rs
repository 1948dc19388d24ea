//! The note mixer.
//!
//! Holds the set of active sample-playback instances and synthesizes each
//! output buffer: pitch-stepped resampling, loop wraparound, stereo pan
//! gains, and buffer-interpolated channel volume. Mixing is f32 end to
//! end; sinks saturate when narrowing to integer PCM.

use crate::channel::{ChannelId, ChannelTree};
use crate::sample::{Pcm, SampleId, SampleStore};
use crate::stereo::Stereo;
use crate::{Error, Frames, Result};

/// A currently-playing voice.
struct Note {
    sample: SampleId,
    /// Load generation of the PCM this note was scheduled against.
    generation: u32,
    volume: f64,
    /// Full composition: channel chain on top of the note's own pan.
    stereo: Stereo,
    channel: ChannelId,
    start: Frames,
    end: Frames,
    /// Playhead in source frames.
    phase: f64,
    /// Source frames advanced per output frame.
    step: f64,
    /// Wrap `phase` back to `.0` upon reaching `.1`.
    loop_wrap: Option<(f64, f64)>,
}

/// Bookkeeping handed back when a note leaves the mixer.
pub(crate) struct FinishedNote {
    pub sample: SampleId,
    pub channel: ChannelId,
}

/// Per-source-channel pan gains: what a source frame contributes to the
/// output left and right channels.
#[derive(Clone, Copy)]
struct PanGains {
    left_to_left: f32,
    left_to_right: f32,
    right_to_left: f32,
    right_to_right: f32,
}

impl PanGains {
    /// Gains for a source channel at position `x` (mono 0, stereo ±1)
    /// through the transform `p = xscale*x + xshift`. Within ±1, the left
    /// gain falls and the right gain rises with `p`; beyond ±1 both
    /// attenuate by `1/p²` so distant positions recede.
    fn position(xscale: f64, xshift: f64, x: f64) -> (f32, f32) {
        let p = xscale * x + xshift;
        let attenuation = if p.abs() > 1.0 { 1.0 / (p * p) } else { 1.0 };
        let clamped = p.clamp(-1.0, 1.0);
        let left = (1.0 - clamped).min(1.0) * attenuation;
        let right = (1.0 + clamped).min(1.0) * attenuation;
        (left as f32, right as f32)
    }

    fn from_stereo(stereo: Stereo) -> PanGains {
        let (xscale, xshift) = stereo.x_axis();
        let (ll, lr) = PanGains::position(xscale, xshift, -1.0);
        let (rl, rr) = PanGains::position(xscale, xshift, 1.0);
        PanGains {
            left_to_left: ll,
            left_to_right: lr,
            right_to_left: rl,
            right_to_right: rr,
        }
    }

    fn mono(stereo: Stereo) -> (f32, f32) {
        let (xscale, xshift) = stereo.x_axis();
        PanGains::position(xscale, xshift, 0.0)
    }
}

/// The active-note set and its synthesis loop.
pub struct NoteMixer {
    frame_rate: u32,
    notes: Vec<Note>,
}

impl NoteMixer {
    pub fn new(frame_rate: u32) -> NoteMixer {
        NoteMixer {
            frame_rate,
            notes: Vec::new(),
        }
    }

    pub fn active_notes(&self) -> usize {
        self.notes.len()
    }

    pub fn notes_in_channel(&self, channel: ChannelId) -> usize {
        self.notes.iter().filter(|n| n.channel == channel).count()
    }

    pub fn notes_referencing(&self, sample: SampleId) -> usize {
        self.notes.iter().filter(|n| n.sample == sample).count()
    }

    /// Queue a voice playing the sample once through. Returns its
    /// duration in output frames.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_note(
        &mut self,
        sample: SampleId,
        generation: u32,
        pcm: &Pcm,
        pitch: f64,
        volume: f64,
        stereo: Stereo,
        channel: ChannelId,
        start: Frames,
    ) -> Result<Frames> {
        let step = self.step_for(pcm, pitch)?;
        let duration = (pcm.frames() as f64 / step).ceil() as Frames;
        self.notes.push(Note {
            sample,
            generation,
            volume,
            stereo,
            channel,
            start,
            end: start + duration,
            phase: 0.0,
            step,
            loop_wrap: None,
        });
        Ok(duration)
    }

    /// Queue a voice that loops its sample's loop region until `duration`
    /// output frames have elapsed. The note ends on a wrap boundary, so
    /// the returned duration may exceed the request by up to one loop
    /// length. Samples without a loop region play once, ignoring the
    /// request.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_note_duration(
        &mut self,
        sample: SampleId,
        generation: u32,
        pcm: &Pcm,
        loop_region: Option<(u64, u64)>,
        pitch: f64,
        volume: f64,
        stereo: Stereo,
        channel: ChannelId,
        start: Frames,
        duration: Frames,
    ) -> Result<Frames> {
        let Some((loop_start, loop_end)) = loop_region else {
            return self.add_note(sample, generation, pcm, pitch, volume, stereo, channel, start);
        };

        let step = self.step_for(pcm, pitch)?;
        let loop_len = (loop_end - loop_start) as f64;
        // Source frames rendered with k extra passes: loop_end + k*loop_len.
        // Take the smallest k whose output length covers the request.
        let wanted_src = duration as f64 * step;
        let k = if wanted_src <= loop_end as f64 {
            0
        } else {
            ((wanted_src - loop_end as f64) / loop_len).ceil() as u64
        };
        let total = ((loop_end as f64 + k as f64 * loop_len) / step).ceil() as Frames;

        self.notes.push(Note {
            sample,
            generation,
            volume,
            stereo,
            channel,
            start,
            end: start + total,
            phase: 0.0,
            step,
            loop_wrap: Some((loop_start as f64, loop_end as f64)),
        });
        Ok(total)
    }

    fn step_for(&self, pcm: &Pcm, pitch: f64) -> Result<f64> {
        if pitch <= 0.0 || !pitch.is_finite() {
            return Err(Error::Schedule(format!("pitch {pitch} must be positive")));
        }
        Ok(pitch * pcm.sample_rate() as f64 / self.frame_rate as f64)
    }

    /// Cut every note owned by the given channels, returning their
    /// bookkeeping records.
    pub(crate) fn stop_channel_notes(&mut self, channels: &[ChannelId]) -> Vec<FinishedNote> {
        let mut finished = Vec::new();
        self.notes.retain(|note| {
            if channels.contains(&note.channel) {
                finished.push(FinishedNote {
                    sample: note.sample,
                    channel: note.channel,
                });
                false
            } else {
                true
            }
        });
        finished
    }

    pub(crate) fn adjust_timebase(&mut self, offset: Frames) {
        for note in &mut self.notes {
            note.start -= offset;
            note.end -= offset;
        }
    }

    /// Mix the window `[start, start + frames)` into `buf` (interleaved
    /// stereo, `2 * frames` long). Returns notes that finished inside the
    /// window.
    pub(crate) fn render(
        &mut self,
        buf: &mut [f32],
        start: Frames,
        frames: usize,
        samples: &SampleStore,
        channels: &ChannelTree,
    ) -> Vec<FinishedNote> {
        debug_assert_eq!(buf.len(), frames * 2);
        buf.fill(0.0);
        let window_end = start + frames as Frames;

        let mut finished = Vec::new();
        self.notes.retain_mut(|note| {
            if note.start >= window_end {
                return true;
            }

            let Some(pcm) = samples.loaded_pcm(note.sample) else {
                tracing::error!(
                    "active note lost its PCM: \"{}\"",
                    samples.name_of(note.sample)
                );
                finished.push(FinishedNote {
                    sample: note.sample,
                    channel: note.channel,
                });
                return false;
            };
            // A live note pins its sample's refcount, so the PCM it was
            // scheduled against cannot be reloaded out from under it. A
            // changed fingerprint means the store was mutated behind the
            // engine's back; cut the note rather than play foreign data.
            if samples.generation(note.sample) != Some(note.generation) {
                tracing::error!(
                    "sample \"{}\" reloaded under an active note",
                    samples.name_of(note.sample)
                );
                finished.push(FinishedNote {
                    sample: note.sample,
                    channel: note.channel,
                });
                return false;
            }

            let Some((vol_prev, vol_last)) = channels.chain_volume_bounds(note.channel) else {
                tracing::error!("active note owned by an inactive channel");
                finished.push(FinishedNote {
                    sample: note.sample,
                    channel: note.channel,
                });
                return false;
            };

            let done = mix_note(
                note, pcm, buf, start, frames, vol_prev, vol_last,
            );
            if done {
                finished.push(FinishedNote {
                    sample: note.sample,
                    channel: note.channel,
                });
            }
            !done
        });
        finished
    }
}

/// Mix one note into the buffer. Returns true once the note is finished.
fn mix_note(
    note: &mut Note,
    pcm: &Pcm,
    buf: &mut [f32],
    start: Frames,
    frames: usize,
    vol_prev: f64,
    vol_last: f64,
) -> bool {
    let src_frames = pcm.frames() as f64;
    let first = (note.start.max(start) - start) as usize;
    let last = ((note.end.min(start + frames as Frames)) - start).max(0) as usize;

    let stereo_source = pcm.channels() == 2;
    let pair_gains = PanGains::from_stereo(note.stereo);
    let (mono_left, mono_right) = PanGains::mono(note.stereo);

    let vol_span = vol_last - vol_prev;
    let inv_frames = 1.0 / frames as f64;

    let mut ended = false;
    for k in first..last {
        if note.phase >= src_frames {
            ended = true;
            break;
        }
        let vol = note.volume * (vol_prev + vol_span * (k as f64 + 1.0) * inv_frames);
        let (src_l, src_r) = pcm.frame(note.phase as usize);
        let (out_l, out_r) = if stereo_source {
            (
                src_l * pair_gains.left_to_left + src_r * pair_gains.right_to_left,
                src_l * pair_gains.left_to_right + src_r * pair_gains.right_to_right,
            )
        } else {
            (src_l * mono_left, src_l * mono_right)
        };
        buf[2 * k] += out_l * vol as f32;
        buf[2 * k + 1] += out_r * vol as f32;

        note.phase += note.step;
        if let Some((loop_start, loop_end)) = note.loop_wrap {
            while note.phase >= loop_end {
                note.phase -= loop_end - loop_start;
            }
        }
    }

    ended || note.end <= start + frames as Frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTree;
    use crate::sample::SampleStore;
    use approx::assert_relative_eq;

    fn fixture(master: f64) -> (NoteMixer, SampleStore, ChannelTree) {
        (
            NoteMixer::new(1000),
            SampleStore::new(),
            ChannelTree::new(master),
        )
    }

    fn const_sample(store: &mut SampleStore, name: &str, frames: usize, value: f32) -> SampleId {
        let pcm = Pcm::new(1000, 1, vec![value; frames]).unwrap();
        store.insert_pcm(name, pcm, None).unwrap()
    }

    fn render_all(
        mixer: &mut NoteMixer,
        store: &SampleStore,
        tree: &ChannelTree,
        buffers: usize,
        frames: usize,
    ) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = vec![0.0f32; frames * 2];
        for i in 0..buffers {
            mixer.render(&mut buf, (i * frames) as Frames, frames, store, tree);
            out.extend_from_slice(&buf);
        }
        out
    }

    #[test]
    fn test_mono_note_plays_once_at_master_volume() {
        let (mut mixer, mut store, tree) = fixture(0.5);
        let id = const_sample(&mut store, "s", 100, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        let dur = mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::Identity, tree.root(), 0)
            .unwrap();
        assert_eq!(dur, 100);

        let out = render_all(&mut mixer, &store, &tree, 2, 100);
        for k in 0..100 {
            assert_relative_eq!(out[2 * k], 0.5, epsilon = 1e-6);
            assert_relative_eq!(out[2 * k + 1], 0.5, epsilon = 1e-6);
        }
        for k in 100..200 {
            assert_eq!(out[2 * k], 0.0);
            assert_eq!(out[2 * k + 1], 0.0);
        }
        assert_eq!(mixer.active_notes(), 0);
    }

    #[test]
    fn test_note_volume_scales_output() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let id = const_sample(&mut store, "s", 10, 0.8);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        mixer
            .add_note(id, 1, &pcm, 1.0, 0.25, Stereo::Identity, tree.root(), 0)
            .unwrap();
        let out = render_all(&mut mixer, &store, &tree, 1, 10);
        assert_relative_eq!(out[0], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_pitch_halves_duration() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let id = const_sample(&mut store, "s", 100, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        let dur = mixer
            .add_note(id, 1, &pcm, 2.0, 1.0, Stereo::Identity, tree.root(), 0)
            .unwrap();
        assert_eq!(dur, 50);
    }

    #[test]
    fn test_sample_rate_conversion() {
        // 500 Hz source into a 1000 Hz mixer: each source frame covers
        // two output frames.
        let (mut mixer, mut store, tree) = fixture(1.0);
        let pcm = Pcm::new(500, 1, vec![1.0; 100]).unwrap();
        let id = store.insert_pcm("s", pcm, None).unwrap();
        let pcm = store.loaded_pcm(id).unwrap().clone();
        let dur = mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::Identity, tree.root(), 0)
            .unwrap();
        assert_eq!(dur, 200);
    }

    #[test]
    fn test_hard_pan_right_silences_left() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let id = const_sample(&mut store, "s", 10, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::shift(1.0), tree.root(), 0)
            .unwrap();
        let out = render_all(&mut mixer, &store, &tree, 1, 10);
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_distant_pan_recedes() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let id = const_sample(&mut store, "s", 10, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::shift(2.0), tree.root(), 0)
            .unwrap();
        let out = render_all(&mut mixer, &store, &tree, 1, 10);
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_negative_scale_swaps_stereo_channels() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        // Left-only stereo source.
        let pcm = Pcm::new(1000, 2, vec![1.0, 0.0].repeat(10)).unwrap();
        let id = store.insert_pcm("s", pcm, None).unwrap();
        let pcm = store.loaded_pcm(id).unwrap().clone();
        mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::scale(-1.0), tree.root(), 0)
            .unwrap();
        let out = render_all(&mut mixer, &store, &tree, 1, 10);
        // The left source channel now sits at +1: all right output.
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_loop_duration_rounds_to_wrap_boundary() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let pcm = Pcm::new(1000, 1, vec![1.0; 1000]).unwrap();
        let id = store.insert_pcm("s", pcm, Some((100, 900))).unwrap();
        let pcm = store.loaded_pcm(id).unwrap().clone();

        // 2000 frames requested: 900 + 2*800 = 2500 source frames.
        let dur = mixer
            .add_note_duration(
                id,
                1,
                &pcm,
                Some((100, 900)),
                1.0,
                1.0,
                Stereo::Identity,
                tree.root(),
                0,
                2000,
            )
            .unwrap();
        assert_eq!(dur, 2500);

        let out = render_all(&mut mixer, &store, &tree, 3, 1000);
        for k in 0..2500 {
            assert_relative_eq!(out[2 * k], 1.0, epsilon = 1e-6);
        }
        for k in 2500..3000 {
            assert_eq!(out[2 * k], 0.0);
        }
        assert_eq!(mixer.active_notes(), 0);
    }

    #[test]
    fn test_duration_without_loop_plays_natural_length() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let id = const_sample(&mut store, "s", 300, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        let dur = mixer
            .add_note_duration(
                id,
                1,
                &pcm,
                None,
                1.0,
                1.0,
                Stereo::Identity,
                tree.root(),
                0,
                5000,
            )
            .unwrap();
        assert_eq!(dur, 300);
    }

    #[test]
    fn test_future_note_not_rendered_yet() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let id = const_sample(&mut store, "s", 10, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::Identity, tree.root(), 250)
            .unwrap();

        let out = render_all(&mut mixer, &store, &tree, 3, 100);
        for k in 0..250 {
            assert_eq!(out[2 * k], 0.0);
        }
        assert_relative_eq!(out[2 * 250], 1.0, epsilon = 1e-6);
        assert_relative_eq!(out[2 * 259], 1.0, epsilon = 1e-6);
        assert_eq!(out[2 * 260], 0.0);
    }

    #[test]
    fn test_stop_channel_notes() {
        let (mut mixer, mut store, mut tree) = fixture(1.0);
        let root = tree.root();
        let child = tree.new_child(root, 1.0, Stereo::Identity, "test").unwrap();
        let id = const_sample(&mut store, "s", 1000, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::Identity, root, 0)
            .unwrap();
        mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::Identity, child, 0)
            .unwrap();

        let cut = mixer.stop_channel_notes(&[child]);
        assert_eq!(cut.len(), 1);
        assert_eq!(cut[0].channel, child);
        assert_eq!(mixer.active_notes(), 1);
        assert_eq!(mixer.notes_in_channel(root), 1);
    }

    #[test]
    fn test_rejects_nonpositive_pitch() {
        let (mut mixer, mut store, tree) = fixture(1.0);
        let id = const_sample(&mut store, "s", 10, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        let err = mixer.add_note(id, 1, &pcm, 0.0, 1.0, Stereo::Identity, tree.root(), 0);
        assert!(matches!(err, Err(Error::Schedule(_))));
    }

    #[test]
    fn test_channel_ramp_interpolates_across_buffer() {
        let (mut mixer, mut store, mut tree) = fixture(1.0);
        let root = tree.root();
        let id = const_sample(&mut store, "s", 1000, 1.0);
        let pcm = store.loaded_pcm(id).unwrap().clone();
        mixer
            .add_note(id, 1, &pcm, 1.0, 1.0, Stereo::Identity, root, 0)
            .unwrap();

        // Ramp 1.0 -> 0.0 across the first 1000 frames.
        tree.set_volume(root, 0.0, 0, 1000).unwrap();
        tree.update_volumes(100);

        let mut buf = vec![0.0f32; 200];
        mixer.render(&mut buf, 0, 100, &store, &tree);
        // Frame k carries the interpolated volume at frame k+1.
        assert_relative_eq!(buf[0], 1.0 - 0.001, epsilon = 1e-4);
        assert_relative_eq!(buf[2 * 99], 0.9, epsilon = 1e-4);
    }
}
