// THEORY:
// The `BatchCache` is the memoization boundary of the whole engine. Generating and
// normalizing a long, high-resolution volume takes a long time, so the result is
// persisted batch by batch under a key derived from every generation parameter, and
// any later request with the same parameters skips straight to assembly.
//
// Key architectural principles:
// 1.  **Content-addressed**: The `CacheKey` is a hash of the serialized `VolumeSpec`.
//     Two specs that hash identically are the same volume. Collisions are accepted.
// 2.  **Contiguous until missing**: Batches are numbered densely from 0. Readers scan
//     `k = 0, 1, 2, ...` until the first missing batch; there is no stored batch count.
// 3.  **Statistics seal the entry**: The statistics record (`min`, `max`,
//     `frame_count`) is written last and atomically. Its presence is what "generated"
//     means; a half-written record is never observable.
// 4.  **Injected store**: Everything goes through the `CacheStore` trait. `DiskCache`
//     is the production store, `MemoryCache` keeps the same semantics in-process.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use half::f16;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core_modules::frame_batch::FrameBatch;
use crate::core_modules::volume_spec::VolumeSpec;
use crate::error::{Result, StimulusError};

const BATCH_MAGIC: &[u8; 8] = b"ZNBATCH1";
const BATCH_VERSION: u32 = 1;
const FILE_PREFIX: &str = "perlcache";

/// Deterministic fingerprint of a `VolumeSpec`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_spec(spec: &VolumeSpec) -> Self {
        // Serializing a plain struct of numbers and a unit enum cannot fail.
        let bytes = serde_json::to_vec(spec).unwrap_or_default();
        CacheKey(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whole-volume statistics, required before any batch can be rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub min: f32,
    pub max: f32,
    pub frame_count: usize,
}

impl Statistics {
    /// Maps `[min, max]` onto `[0, 1]`. A flat volume maps to 0.
    #[inline]
    pub fn rescale(&self, value: f32) -> f32 {
        let range = self.max - self.min;
        if range > 0.0 {
            (value - self.min) / range
        } else {
            0.0
        }
    }
}

/// Frames per batch for a given spec: as many as fit the sample budget, rounded up
/// to an even number so paired-frame filters never straddle a batch boundary.
pub fn batch_length(spec: &VolumeSpec) -> usize {
    let per_frame = spec.x_size() * spec.y_size();
    let mut length = (spec.batch_budget() / per_frame).max(1);
    if length % 2 == 1 {
        length += 1;
    }
    length
}

/// Persistent storage for batches and statistics.
pub trait CacheStore {
    /// Whether a statistics record exists for `key`.
    fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.load_statistics(key)?.is_some())
    }

    fn load_statistics(&self, key: &CacheKey) -> Result<Option<Statistics>>;

    /// Persists `stats` so that a reader sees either nothing or the complete record.
    fn store_statistics(&mut self, key: &CacheKey, stats: &Statistics) -> Result<()>;

    /// Persists batch `k` in half precision, replacing any previous content.
    fn store_batch(&mut self, key: &CacheKey, k: usize, batch: &FrameBatch) -> Result<()>;

    fn load_batch(&self, key: &CacheKey, k: usize) -> Result<Option<FrameBatch>>;

    /// Frame count of batch `k` without loading its samples.
    fn batch_frames(&self, key: &CacheKey, k: usize) -> Result<Option<usize>>;

    /// Iterates batches `0, 1, 2, ...` until the first missing one.
    fn batches<'a>(&'a self, key: &'a CacheKey) -> Batches<'a, Self>
    where
        Self: Sized,
    {
        Batches {
            store: self,
            key,
            next: 0,
            done: false,
        }
    }

    /// Returns `(batch_count, frame_total)` of the contiguous run starting at batch 0.
    fn scan(&self, key: &CacheKey) -> Result<(usize, usize)> {
        let mut k = 0;
        let mut frames = 0;
        while let Some(n) = self.batch_frames(key, k)? {
            frames += n;
            k += 1;
        }
        Ok((k, frames))
    }
}

/// Iterator over the contiguous batches of one cache entry.
pub struct Batches<'a, C: CacheStore> {
    store: &'a C,
    key: &'a CacheKey,
    next: usize,
    done: bool,
}

impl<C: CacheStore> Iterator for Batches<'_, C> {
    type Item = Result<(usize, FrameBatch)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.store.load_batch(self.key, self.next) {
            Ok(Some(batch)) => {
                let k = self.next;
                self.next += 1;
                Some(Ok((k, batch)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<C: CacheStore + ?Sized> CacheStore for &mut C {
    fn exists(&self, key: &CacheKey) -> Result<bool> {
        (**self).exists(key)
    }

    fn load_statistics(&self, key: &CacheKey) -> Result<Option<Statistics>> {
        (**self).load_statistics(key)
    }

    fn store_statistics(&mut self, key: &CacheKey, stats: &Statistics) -> Result<()> {
        (**self).store_statistics(key, stats)
    }

    fn store_batch(&mut self, key: &CacheKey, k: usize, batch: &FrameBatch) -> Result<()> {
        (**self).store_batch(key, k, batch)
    }

    fn load_batch(&self, key: &CacheKey, k: usize) -> Result<Option<FrameBatch>> {
        (**self).load_batch(key, k)
    }

    fn batch_frames(&self, key: &CacheKey, k: usize) -> Result<Option<usize>> {
        (**self).batch_frames(key, k)
    }
}

// --- Disk store ---

/// File-backed cache: `perlcache_{key}_{k}.dat` per batch, `perlcache_{key}_stats.dat`.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// Opens (and creates if needed) a cache directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batch_path(&self, key: &CacheKey, k: usize) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}_{key}_{k}.dat"))
    }

    pub fn stats_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}_{key}_stats.dat"))
    }

    fn read_header<R: Read>(reader: &mut R, path: &Path) -> Result<(usize, usize, usize)> {
        let magic = read_exact::<8, _>(reader)?;
        if &magic != BATCH_MAGIC {
            return Err(invalid_data(path, "bad batch magic"));
        }
        let version = read_u32_le(reader)?;
        if version != BATCH_VERSION {
            return Err(invalid_data(path, &format!("unsupported batch version {version}")));
        }
        let width = read_u32_le(reader)? as usize;
        let height = read_u32_le(reader)? as usize;
        let frames = read_u32_le(reader)? as usize;
        Ok((width, height, frames))
    }

    fn open(path: &Path) -> Result<Option<BufReader<File>>> {
        match File::open(path) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheStore for DiskCache {
    fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.stats_path(key).is_file())
    }

    fn load_statistics(&self, key: &CacheKey) -> Result<Option<Statistics>> {
        let Some(reader) = Self::open(&self.stats_path(key))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_reader(reader)?))
    }

    fn store_statistics(&mut self, key: &CacheKey, stats: &Statistics) -> Result<()> {
        let path = self.stats_path(key);
        write_atomic(&path, |w| {
            serde_json::to_writer(&mut *w, stats)?;
            Ok(())
        })?;
        debug!("Stored statistics {:?} at {}", stats, path.display());
        Ok(())
    }

    fn store_batch(&mut self, key: &CacheKey, k: usize, batch: &FrameBatch) -> Result<()> {
        let path = self.batch_path(key, k);
        write_atomic(&path, |w| {
            w.write_all(BATCH_MAGIC)?;
            write_u32_le(w, BATCH_VERSION)?;
            write_u32_le(w, batch.width as u32)?;
            write_u32_le(w, batch.height as u32)?;
            write_u32_le(w, batch.frame_count() as u32)?;
            for &v in &batch.data {
                w.write_all(&f16::from_f32(v).to_le_bytes())?;
            }
            Ok(())
        })
    }

    fn load_batch(&self, key: &CacheKey, k: usize) -> Result<Option<FrameBatch>> {
        let path = self.batch_path(key, k);
        let Some(mut reader) = Self::open(&path)? else {
            return Ok(None);
        };
        let (width, height, frames) = Self::read_header(&mut reader, &path)?;
        let mut bytes = vec![0u8; width * height * frames * 2];
        reader.read_exact(&mut bytes)?;
        let data = bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect();
        Ok(Some(FrameBatch::new(width, height, data)))
    }

    fn batch_frames(&self, key: &CacheKey, k: usize) -> Result<Option<usize>> {
        let path = self.batch_path(key, k);
        let Some(mut reader) = Self::open(&path)? else {
            return Ok(None);
        };
        let (_, _, frames) = Self::read_header(&mut reader, &path)?;
        Ok(Some(frames))
    }
}

/// Writes to a sibling temp file and renames it over `path` once complete.
fn write_atomic(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let written = File::create(&tmp).map_err(StimulusError::from).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&tmp, path)?;
        Ok(())
    });
    if written.is_err() {
        // Keep the first error.
        let _ = fs::remove_file(&tmp);
    }
    written
}

fn invalid_data(path: &Path, detail: &str) -> StimulusError {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {detail}", path.display()),
    )
    .into()
}

fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

// --- In-memory store ---

#[derive(Debug, Clone)]
struct StoredBatch {
    width: usize,
    height: usize,
    samples: Vec<f16>,
}

/// Process-local cache with the same precision and contiguity semantics as `DiskCache`.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    batches: HashMap<(CacheKey, usize), StoredBatch>,
    stats: HashMap<CacheKey, Statistics>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops batch `k`, leaving a hole in the sequence.
    pub fn remove_batch(&mut self, key: &CacheKey, k: usize) -> bool {
        self.batches.remove(&(key.clone(), k)).is_some()
    }

    pub fn remove_statistics(&mut self, key: &CacheKey) -> bool {
        self.stats.remove(key).is_some()
    }
}

impl CacheStore for MemoryCache {
    fn load_statistics(&self, key: &CacheKey) -> Result<Option<Statistics>> {
        Ok(self.stats.get(key).copied())
    }

    fn store_statistics(&mut self, key: &CacheKey, stats: &Statistics) -> Result<()> {
        self.stats.insert(key.clone(), *stats);
        Ok(())
    }

    fn store_batch(&mut self, key: &CacheKey, k: usize, batch: &FrameBatch) -> Result<()> {
        let samples = batch.data.iter().map(|&v| f16::from_f32(v)).collect();
        self.batches.insert(
            (key.clone(), k),
            StoredBatch {
                width: batch.width,
                height: batch.height,
                samples,
            },
        );
        Ok(())
    }

    fn load_batch(&self, key: &CacheKey, k: usize) -> Result<Option<FrameBatch>> {
        Ok(self.batches.get(&(key.clone(), k)).map(|stored| {
            let data = stored.samples.iter().map(|v| v.to_f32()).collect();
            FrameBatch::new(stored.width, stored.height, data)
        }))
    }

    fn batch_frames(&self, key: &CacheKey, k: usize) -> Result<Option<usize>> {
        Ok(self.batches.get(&(key.clone(), k)).map(|stored| {
            let per_frame = stored.width * stored.height;
            if per_frame == 0 { 0 } else { stored.samples.len() / per_frame }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::volume_spec::{DemeanMode, VolumeConfig};

    fn spec(t_size: usize) -> VolumeSpec {
        VolumeSpec::new(&VolumeConfig {
            x_size: 16,
            y_size: 8,
            t_size,
            temporal_scale: 3,
            ..VolumeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn failed_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.dat");
        let err = write_atomic(&path, |w| {
            w.write_all(b"partial")?;
            Err(StimulusError::inconsistent("k", "writer gave up"))
        })
        .unwrap_err();
        assert!(matches!(err, StimulusError::CacheInconsistency { .. }));

        // A non-empty directory in the way makes the rename fail.
        let blocked = dir.path().join("blocked.dat");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), b"x").unwrap();
        assert!(write_atomic(&blocked, |w| Ok(w.write_all(b"data")?)).is_err());

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["blocked.dat"]);
    }

    fn ramp_batch(frames: usize) -> FrameBatch {
        let data = (0..16 * 8 * frames).map(|i| (i % 97) as f32 / 97.0 - 0.5).collect();
        FrameBatch::new(16, 8, data)
    }

    #[test]
    fn key_is_stable_and_padding_aware() {
        let a = CacheKey::for_spec(&spec(100));
        assert_eq!(a, CacheKey::for_spec(&spec(100)));
        // 100 and 101 both pad to 102 frames, so they are the same volume.
        assert_eq!(a, CacheKey::for_spec(&spec(101)));
        assert_ne!(a, CacheKey::for_spec(&spec(99)));
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn key_is_independent_of_construction_order() {
        let mut first = VolumeConfig::default();
        first.seed = 7;
        first.demean = DemeanMode::Space;
        first.x_size = 32;
        first.y_size = 16;

        let second = VolumeConfig {
            y_size: 16,
            demean: DemeanMode::Space,
            x_size: 32,
            seed: 7,
            ..VolumeConfig::default()
        };
        let a = CacheKey::for_spec(&VolumeSpec::new(&first).unwrap());
        let b = CacheKey::for_spec(&VolumeSpec::new(&second).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn key_ignores_batch_budget_but_not_scales() {
        let base = VolumeConfig::default();
        let budget = VolumeConfig {
            batch_budget: 1234,
            ..base.clone()
        };
        let stretched = VolumeConfig {
            x_scale: 2.0,
            ..base.clone()
        };
        let key = |c: &VolumeConfig| CacheKey::for_spec(&VolumeSpec::new(c).unwrap());
        assert_eq!(key(&base), key(&budget));
        assert_ne!(key(&base), key(&stretched));
    }

    #[test]
    fn batch_length_is_even_and_within_budget() {
        let config = |budget| VolumeConfig {
            x_size: 16,
            y_size: 8,
            t_size: 10,
            temporal_scale: 1,
            batch_budget: budget,
            ..VolumeConfig::default()
        };
        // 128 samples per frame: 640 / 128 = 5 frames, rounded up to 6.
        assert_eq!(batch_length(&VolumeSpec::new(&config(640)).unwrap()), 6);
        assert_eq!(batch_length(&VolumeSpec::new(&config(1024)).unwrap()), 8);
        assert_eq!(batch_length(&VolumeSpec::new(&config(1)).unwrap()), 2);
    }

    #[test]
    fn rescale_maps_range_to_unit_interval() {
        let stats = Statistics {
            min: -2.0,
            max: 2.0,
            frame_count: 1,
        };
        assert_eq!(stats.rescale(-2.0), 0.0);
        assert_eq!(stats.rescale(2.0), 1.0);
        assert_eq!(stats.rescale(0.0), 0.5);
    }

    #[test]
    fn disk_cache_round_trips_in_half_precision() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DiskCache::new(dir.path().join("cache")).unwrap();
        let key = CacheKey::for_spec(&spec(12));
        let batch = ramp_batch(4);

        assert!(!cache.exists(&key).unwrap());
        cache.store_batch(&key, 0, &batch).unwrap();
        let loaded = cache.load_batch(&key, 0).unwrap().unwrap();
        assert_eq!((loaded.width, loaded.height, loaded.frame_count()), (16, 8, 4));
        for (a, b) in batch.data.iter().zip(&loaded.data) {
            assert!((a - b).abs() < 1e-3);
        }
        assert!(cache.batch_path(&key, 0).ends_with(format!("perlcache_{key}_0.dat")));
        assert_eq!(cache.batch_frames(&key, 0).unwrap(), Some(4));
        assert!(cache.load_batch(&key, 1).unwrap().is_none());
    }

    #[test]
    fn disk_statistics_are_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DiskCache::new(dir.path()).unwrap();
        let key = CacheKey::for_spec(&spec(12));
        let stats = Statistics {
            min: -0.25,
            max: 0.75,
            frame_count: 12,
        };
        cache.store_statistics(&key, &stats).unwrap();
        assert!(cache.exists(&key).unwrap());
        assert_eq!(cache.load_statistics(&key).unwrap(), Some(stats));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn truncated_batch_is_an_error_not_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DiskCache::new(dir.path()).unwrap();
        let key = CacheKey::for_spec(&spec(12));
        cache.store_batch(&key, 0, &ramp_batch(2)).unwrap();
        let path = cache.batch_path(&key, 0);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(cache.load_batch(&key, 0).is_err());
    }

    #[test]
    fn batch_scan_stops_at_first_gap() {
        let mut cache = MemoryCache::new();
        let key = CacheKey::for_spec(&spec(12));
        for k in [0, 1, 3] {
            cache.store_batch(&key, k, &ramp_batch(2)).unwrap();
        }
        assert_eq!(cache.scan(&key).unwrap(), (2, 4));
        let seen: Vec<usize> = cache.batches(&key).map(|b| b.unwrap().0).collect();
        assert_eq!(seen, vec![0, 1]);

        cache.remove_batch(&key, 0);
        assert_eq!(cache.scan(&key).unwrap(), (0, 0));
    }
}
