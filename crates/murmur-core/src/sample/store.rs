//! The sample cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{Error, Frames, Result};

use super::{
    ConcreteSample, DecodedSample, MixinLoader, MixinSample, Pcm, PitchBinding, PitchRange,
    SampleEntry, SampleFormat, SampleId, SampleInfo, SampleKind, SampleLoader, WavLoader,
};

/// Mixin chains are short in practice; anything deeper is a cycle.
const MAX_MIXIN_DEPTH: usize = 16;

/// Counters for a stats emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: usize,
    pub loaded: usize,
    pub unloaded: usize,
    pub virtual_samples: usize,
    pub note_refs: u64,
}

/// Content-addressed store of decoded samples.
///
/// Entries are created on first reference and persist for the lifetime of
/// the store. The decoded PCM of an idle entry may be released
/// ([`unload_idle`](SampleStore::unload_idle)) and is reloaded from its
/// source file the next time it is needed.
pub struct SampleStore {
    entries: Vec<SampleEntry>,
    by_name: HashMap<String, SampleId>,
    search_path: Vec<PathBuf>,
    loaders: Vec<Box<dyn SampleLoader>>,
}

impl SampleStore {
    pub fn new() -> SampleStore {
        SampleStore {
            entries: Vec::new(),
            by_name: HashMap::new(),
            search_path: Vec::new(),
            loaders: vec![Box::new(WavLoader), Box::new(MixinLoader)],
        }
    }

    pub fn with_search_path(dirs: Vec<PathBuf>) -> SampleStore {
        let mut store = SampleStore::new();
        store.search_path = dirs;
        store
    }

    /// Register an additional decoder. Later registrations win on
    /// extension conflicts.
    pub fn register_loader(&mut self, loader: Box<dyn SampleLoader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Ids of every entry, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = SampleId> + '_ {
        (0..self.entries.len() as u32).map(SampleId)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch (or load) the sample for a resource name. Relative names are
    /// searched on the configured path.
    pub fn get(&mut self, name: &str) -> Result<SampleId> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        let path = self.locate(name)?;
        let id = self.load_path(&path)?;
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register a sample decoded elsewhere (or built in memory). Such
    /// entries have no source file and are never unloaded.
    pub fn insert_pcm(
        &mut self,
        name: &str,
        pcm: Pcm,
        loop_region: Option<(u64, u64)>,
    ) -> Result<SampleId> {
        if self.by_name.contains_key(name) {
            return Err(Error::Load(format!("sample name already registered: {name}")));
        }
        if let Some((start, end)) = loop_region {
            if start >= end || end > pcm.frames() {
                return Err(Error::Load(format!(
                    "loop region [{start}, {end}) does not fit {} frames",
                    pcm.frames()
                )));
            }
        }
        let format = SampleFormat {
            sample_rate: pcm.sample_rate(),
            channels: pcm.channels(),
            bits_per_sample: 32,
        };
        let frames = pcm.frames();
        let id = self.push_entry(SampleEntry {
            name: name.to_string(),
            source: None,
            ref_count: 0,
            last_used: 0,
            kind: SampleKind::Concrete(ConcreteSample {
                format,
                frames,
                loop_region,
                pcm: Some(Arc::new(pcm)),
                generation: 1,
            }),
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Follow mixin dispatch down to a concrete sample, multiplying the
    /// pitch by each binding's ratio along the way.
    pub fn resolve(&self, id: SampleId, pitch: f64) -> Result<(SampleId, f64)> {
        let mut id = id;
        let mut pitch = pitch;
        for _ in 0..MAX_MIXIN_DEPTH {
            match &self.entry(id)?.kind {
                SampleKind::Concrete(_) => return Ok((id, pitch)),
                SampleKind::Mixin(mixin) => {
                    let binding = mixin.find(pitch)?;
                    pitch *= binding.ratio;
                    id = binding.sample;
                }
            }
        }
        Err(Error::Sample(format!(
            "mixin chain too deep for \"{}\"",
            self.entry(id)?.name
        )))
    }

    /// Fetch the PCM of a concrete sample, reloading it from the source
    /// file if it has been unloaded. Returns the PCM and its load
    /// generation (the fingerprint notes carry).
    pub fn ensure_loaded(&mut self, id: SampleId) -> Result<(Arc<Pcm>, u32)> {
        // Split borrows: locate the loader before mutating the entry.
        let reload_path = {
            let entry = self.entry(id)?;
            match &entry.kind {
                SampleKind::Mixin(_) => {
                    return Err(Error::Sample(format!(
                        "virtual sample \"{}\" cannot be played directly",
                        entry.name
                    )))
                }
                SampleKind::Concrete(c) if c.pcm.is_some() => None,
                SampleKind::Concrete(_) => match &entry.source {
                    Some(path) => Some(path.clone()),
                    None => {
                        return Err(Error::Sample(format!(
                            "sample \"{}\" is unloaded and has no source",
                            entry.name
                        )))
                    }
                },
            }
        };

        if let Some(path) = reload_path {
            let loader = self.loader_for(&path)?;
            let decoded = loader
                .load(&path)
                .map_err(|e| Error::Sample(format!("reload failed: {e}")))?;
            let (pcm, format, loop_region) = match decoded {
                DecodedSample::Pcm {
                    pcm,
                    format,
                    loop_region,
                } => (pcm, format, loop_region),
                DecodedSample::Mixin { .. } => {
                    return Err(Error::Sample(format!(
                        "{}: source turned into a mixin on reload",
                        path.display()
                    )))
                }
            };
            tracing::debug!("reloaded sample {}", path.display());
            let concrete = self.concrete_mut(id)?;
            concrete.frames = pcm.frames();
            concrete.format = format;
            concrete.loop_region = loop_region;
            concrete.pcm = Some(Arc::new(pcm));
            concrete.generation += 1;
        }

        let concrete = self.concrete(id)?;
        let pcm = concrete
            .pcm
            .as_ref()
            .ok_or_else(|| Error::Internal("sample PCM missing after load".into()))?;
        Ok((Arc::clone(pcm), concrete.generation))
    }

    /// PCM for mixing, without the reload side channel. `None` for
    /// unloaded or virtual entries.
    pub fn loaded_pcm(&self, id: SampleId) -> Option<&Arc<Pcm>> {
        match &self.entries.get(id.0 as usize)?.kind {
            SampleKind::Concrete(c) => c.pcm.as_ref(),
            SampleKind::Mixin(_) => None,
        }
    }

    pub fn is_loaded(&self, id: SampleId) -> bool {
        self.loaded_pcm(id).is_some()
    }

    /// Current load generation of a concrete sample; bumps on reload.
    pub fn generation(&self, id: SampleId) -> Option<u32> {
        match &self.entries.get(id.0 as usize)?.kind {
            SampleKind::Concrete(c) => Some(c.generation),
            SampleKind::Mixin(_) => None,
        }
    }

    pub fn loop_region(&self, id: SampleId) -> Result<Option<(u64, u64)>> {
        Ok(self.concrete(id)?.loop_region)
    }

    pub fn ref_count(&self, id: SampleId) -> Result<u32> {
        Ok(self.entry(id)?.ref_count)
    }

    pub fn name_of(&self, id: SampleId) -> &str {
        self.entries
            .get(id.0 as usize)
            .map(|e| e.name.as_str())
            .unwrap_or("<unknown>")
    }

    /// Duration and loop points (seconds) of a sample at a pitch,
    /// following mixin dispatch.
    pub fn info(&self, id: SampleId, pitch: f64) -> Result<SampleInfo> {
        let (id, pitch) = self.resolve(id, pitch)?;
        let concrete = self.concrete(id)?;
        let ratio = concrete.format.sample_rate as f64 * pitch;
        Ok(SampleInfo {
            duration: concrete.frames as f64 / ratio,
            loop_region: concrete
                .loop_region
                .map(|(s, e)| (s as f64 / ratio, e as f64 / ratio)),
        })
    }

    /// A note now references this sample until (at least) `until`.
    pub fn acquire(&mut self, id: SampleId, until: Frames) {
        if let Some(entry) = self.entries.get_mut(id.0 as usize) {
            entry.ref_count += 1;
            if entry.last_used < until {
                entry.last_used = until;
            }
        }
    }

    /// A note referencing this sample ended.
    pub fn release(&mut self, id: SampleId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.ref_count == 0 {
            return Err(Error::Internal(format!(
                "sample refcount underflow for \"{}\"",
                entry.name
            )));
        }
        entry.ref_count -= 1;
        Ok(())
    }

    /// Release the decoded PCM of file-backed entries that have been
    /// unreferenced since before `death_time`. Cache entries persist.
    pub fn unload_idle(&mut self, death_time: Frames) {
        for entry in &mut self.entries {
            if entry.ref_count > 0 || entry.source.is_none() || entry.last_used > death_time {
                continue;
            }
            if let SampleKind::Concrete(c) = &mut entry.kind {
                if c.pcm.take().is_some() {
                    tracing::debug!("unloaded sample \"{}\"", entry.name);
                }
            }
        }
    }

    /// Shift idle timestamps down after a timebase trim. Stamps already
    /// far in the past (beyond `max_age`) stay put.
    pub fn adjust_timebase(&mut self, offset: Frames, max_age: Frames) {
        for entry in &mut self.entries {
            if entry.last_used >= -max_age {
                entry.last_used -= offset;
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            stats.note_refs += entry.ref_count as u64;
            match &entry.kind {
                SampleKind::Mixin(_) => stats.virtual_samples += 1,
                SampleKind::Concrete(c) if c.pcm.is_some() => stats.loaded += 1,
                SampleKind::Concrete(_) => stats.unloaded += 1,
            }
        }
        stats
    }

    fn locate(&self, name: &str) -> Result<PathBuf> {
        let raw = Path::new(name);
        if raw.is_absolute() {
            if raw.is_file() {
                return Ok(raw.to_path_buf());
            }
            return Err(Error::Load(format!("file not readable: {name}")));
        }
        if self.search_path.is_empty() && raw.is_file() {
            return Ok(raw.to_path_buf());
        }
        for dir in &self.search_path {
            let candidate = dir.join(raw);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::Load(format!("file not readable: {name}")))
    }

    fn load_path(&mut self, path: &Path) -> Result<SampleId> {
        let key = path.to_string_lossy().into_owned();
        if let Some(&id) = self.by_name.get(&key) {
            return Ok(id);
        }
        let loader = self.loader_for(path)?;
        let decoded = loader.load(path)?;
        let id = match decoded {
            DecodedSample::Pcm {
                pcm,
                format,
                loop_region,
            } => self.push_entry(SampleEntry {
                name: key.clone(),
                source: Some(path.to_path_buf()),
                ref_count: 0,
                last_used: 0,
                kind: SampleKind::Concrete(ConcreteSample {
                    format,
                    frames: pcm.frames(),
                    loop_region,
                    pcm: Some(Arc::new(pcm)),
                    generation: 1,
                }),
            }),
            DecodedSample::Mixin { ranges, default } => {
                let mut resolved = Vec::with_capacity(ranges.len());
                for (low, high, member, ratio) in ranges {
                    let sample = self.load_path(&member)?;
                    resolved.push(PitchRange {
                        low,
                        high,
                        binding: PitchBinding { sample, ratio },
                    });
                }
                let default = match default {
                    Some((member, ratio)) => Some(PitchBinding {
                        sample: self.load_path(&member)?,
                        ratio,
                    }),
                    None => None,
                };
                self.push_entry(SampleEntry {
                    name: key.clone(),
                    source: Some(path.to_path_buf()),
                    ref_count: 0,
                    last_used: 0,
                    kind: SampleKind::Mixin(MixinSample {
                        ranges: resolved,
                        default,
                    }),
                })
            }
        };
        self.by_name.insert(key, id);
        Ok(id)
    }

    fn loader_for(&self, path: &Path) -> Result<&dyn SampleLoader> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        self.loaders
            .iter()
            .rev()
            .find(|l| l.extensions().contains(&ext.as_str()))
            .map(|l| l.as_ref())
            .ok_or_else(|| {
                Error::Load(format!("unknown sound file extension '.{ext}'"))
            })
    }

    fn push_entry(&mut self, entry: SampleEntry) -> SampleId {
        let id = SampleId(self.entries.len() as u32);
        self.entries.push(entry);
        id
    }

    fn entry(&self, id: SampleId) -> Result<&SampleEntry> {
        self.entries
            .get(id.0 as usize)
            .ok_or_else(|| Error::Internal(format!("bad sample id {:?}", id)))
    }

    fn entry_mut(&mut self, id: SampleId) -> Result<&mut SampleEntry> {
        self.entries
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::Internal(format!("bad sample id {:?}", id)))
    }

    fn concrete(&self, id: SampleId) -> Result<&ConcreteSample> {
        match &self.entry(id)?.kind {
            SampleKind::Concrete(c) => Ok(c),
            SampleKind::Mixin(_) => Err(Error::Sample(format!(
                "virtual sample \"{}\" has no PCM",
                self.entry(id)?.name
            ))),
        }
    }

    fn concrete_mut(&mut self, id: SampleId) -> Result<&mut ConcreteSample> {
        match &mut self.entry_mut(id)?.kind {
            SampleKind::Concrete(c) => Ok(c),
            SampleKind::Mixin(_) => Err(Error::Sample("virtual sample has no PCM".into())),
        }
    }
}

impl Default for SampleStore {
    fn default() -> Self {
        SampleStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frames: usize, value: f32) -> Pcm {
        Pcm::new(22050, 1, vec![value; frames]).unwrap()
    }

    fn write_wav(path: &Path, samples: &[f32]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample((s * 32767.0) as i32).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_insert_and_cache_hit() {
        let mut store = SampleStore::new();
        let id = store.insert_pcm("tone", tone(100, 0.5), None).unwrap();
        assert_eq!(store.get("tone").unwrap(), id);
        assert_eq!(store.len(), 1);
        assert!(store.is_loaded(id));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut store = SampleStore::new();
        store.insert_pcm("tone", tone(10, 0.0), None).unwrap();
        assert!(store.insert_pcm("tone", tone(10, 0.0), None).is_err());
    }

    #[test]
    fn test_bad_loop_region_rejected() {
        let mut store = SampleStore::new();
        assert!(store.insert_pcm("a", tone(10, 0.0), Some((5, 5))).is_err());
        assert!(store.insert_pcm("b", tone(10, 0.0), Some((5, 11))).is_err());
        assert!(store.insert_pcm("c", tone(10, 0.0), Some((5, 10))).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let mut store = SampleStore::new();
        assert!(matches!(store.get("no-such.wav"), Err(Error::Load(_))));
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sound.xyz");
        std::fs::write(&path, b"data").unwrap();
        let mut store = SampleStore::new();
        let err = store.get(path.to_str().unwrap());
        assert!(matches!(err, Err(Error::Load(_))));
    }

    #[test]
    fn test_search_path() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("s.wav"), &[0.25; 32]);
        let mut store = SampleStore::with_search_path(vec![dir.path().to_path_buf()]);
        let id = store.get("s.wav").unwrap();
        assert_eq!(store.loaded_pcm(id).unwrap().frames(), 32);
    }

    #[test]
    fn test_unload_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.wav");
        write_wav(&path, &[0.5; 64]);
        let mut store = SampleStore::new();
        let id = store.get(path.to_str().unwrap()).unwrap();
        let (_, gen1) = store.ensure_loaded(id).unwrap();

        store.unload_idle(0);
        assert!(!store.is_loaded(id));
        assert_eq!(store.stats().unloaded, 1);

        let (pcm, gen2) = store.ensure_loaded(id).unwrap();
        assert_eq!(pcm.frames(), 64);
        assert_eq!(gen2, gen1 + 1);
        assert!(store.is_loaded(id));
    }

    #[test]
    fn test_refcount_blocks_unload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.wav");
        write_wav(&path, &[0.5; 16]);
        let mut store = SampleStore::new();
        let id = store.get(path.to_str().unwrap()).unwrap();

        store.acquire(id, 100);
        store.unload_idle(1_000);
        assert!(store.is_loaded(id));

        store.release(id).unwrap();
        // Still recently used.
        store.unload_idle(50);
        assert!(store.is_loaded(id));
        // Old enough now.
        store.unload_idle(100);
        assert!(!store.is_loaded(id));
    }

    #[test]
    fn test_memory_samples_never_unload() {
        let mut store = SampleStore::new();
        let id = store.insert_pcm("tone", tone(10, 0.1), None).unwrap();
        store.unload_idle(i64::MAX);
        assert!(store.is_loaded(id));
    }

    #[test]
    fn test_release_underflow_is_internal_error() {
        let mut store = SampleStore::new();
        let id = store.insert_pcm("tone", tone(10, 0.1), None).unwrap();
        assert!(matches!(store.release(id), Err(Error::Internal(_))));
    }

    #[test]
    fn test_adjust_timebase() {
        let mut store = SampleStore::new();
        let id = store.insert_pcm("tone", tone(10, 0.1), None).unwrap();
        store.acquire(id, 70_000);
        store.release(id).unwrap();
        store.adjust_timebase(50_000, 110_000);
        assert_eq!(store.ref_count(id).unwrap(), 0);
        // last_used moved with the timebase.
        store.unload_idle(19_999);
        assert!(store.is_loaded(id));
        store.unload_idle(20_000);
        // In-memory sample: still loaded, but the stamp logic is covered
        // by the file-backed tests above; here we only check no panic.
        assert!(store.is_loaded(id));
    }

    #[test]
    fn test_mixin_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("low.wav"), &[0.1; 8]);
        write_wav(&dir.path().join("high.wav"), &[0.9; 8]);
        let mixin = dir.path().join("bell.mixin");
        std::fs::write(
            &mixin,
            "range 0.0 1.0 low.wav 2.0\nelse high.wav 0.5\n",
        )
        .unwrap();

        let mut store = SampleStore::new();
        let id = store.get(mixin.to_str().unwrap()).unwrap();
        assert_eq!(store.stats().virtual_samples, 1);
        assert_eq!(store.stats().loaded, 2);

        let (low_id, pitch) = store.resolve(id, 0.5).unwrap();
        assert!((pitch - 1.0).abs() < 1e-12);
        assert!((store.loaded_pcm(low_id).unwrap().data()[0] - 0.1).abs() < 1e-3);

        let (high_id, pitch) = store.resolve(id, 2.0).unwrap();
        assert!((pitch - 1.0).abs() < 1e-12);
        assert!((store.loaded_pcm(high_id).unwrap().data()[0] - 0.9).abs() < 1e-2);

        // Playing the mixin itself is an error.
        assert!(matches!(store.ensure_loaded(id), Err(Error::Sample(_))));
    }

    #[test]
    fn test_info() {
        let mut store = SampleStore::new();
        let id = store
            .insert_pcm("tone", tone(22050, 0.2), Some((2205, 4410)))
            .unwrap();
        let info = store.info(id, 1.0).unwrap();
        assert!((info.duration - 1.0).abs() < 1e-9);
        let (ls, le) = info.loop_region.unwrap();
        assert!((ls - 0.1).abs() < 1e-9);
        assert!((le - 0.2).abs() < 1e-9);

        let info = store.info(id, 2.0).unwrap();
        assert!((info.duration - 0.5).abs() < 1e-9);
    }
}
