//! Named blob persistence for real volumes and complex spectra.
//!
//! Streaming rules spill their per-stratum OTFs through an [`OtfCache`], which keys blobs
//! by stratum index under a per-estimator namespace. The same [`VolumeStore`] trait is used
//! for checkpoints and final results.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::volume::{Spectrum, Volume};
use ndarray::Array3;
use ndarray_npy::{read_npy, write_npy, ReadableElement, WritableElement};
use num_complex::Complex;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

/// Read/write access to named real and complex buffers.
pub trait VolumeStore<T: DeconvFloat>: Send {
    fn write_volume(&mut self, name: &str, volume: &Volume<T>) -> Result<()>;

    fn read_volume(&self, name: &str) -> Result<Volume<T>>;

    fn write_spectrum(&mut self, name: &str, spectrum: &Spectrum<T>) -> Result<()>;

    fn read_spectrum(&self, name: &str) -> Result<Spectrum<T>>;
}

/// A directory of `.npy` files, one per blob.
#[derive(Debug)]
pub struct NpyStore {
    root: PathBuf,
    // keeps a temporary directory alive for the lifetime of the store
    _temporary: Option<TempDir>,
}

impl NpyStore {
    /// Uses an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(DeconvolutionError::store(
                root.display().to_string(),
                "not a directory",
            ));
        }
        Ok(NpyStore {
            root,
            _temporary: None,
        })
    }

    /// Creates a fresh temporary directory that is removed when the store is dropped.
    pub fn temporary() -> Result<Self> {
        let dir = TempDir::new().map_err(|err| DeconvolutionError::store("tempdir", err))?;
        log::debug!("created temporary OTF store in {:?}", dir.path());
        Ok(NpyStore {
            root: dir.path().to_path_buf(),
            _temporary: Some(dir),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.npy"))
    }
}

impl<T> VolumeStore<T> for NpyStore
where
    T: DeconvFloat + WritableElement + ReadableElement,
    Complex<T>: WritableElement + ReadableElement,
{
    fn write_volume(&mut self, name: &str, volume: &Volume<T>) -> Result<()> {
        write_npy(self.path(name), volume).map_err(|err| DeconvolutionError::store(name, err))
    }

    fn read_volume(&self, name: &str) -> Result<Volume<T>> {
        read_npy::<_, Array3<T>>(self.path(name))
            .map_err(|err| DeconvolutionError::store(name, err))
    }

    fn write_spectrum(&mut self, name: &str, spectrum: &Spectrum<T>) -> Result<()> {
        write_npy(self.path(name), spectrum).map_err(|err| DeconvolutionError::store(name, err))
    }

    fn read_spectrum(&self, name: &str) -> Result<Spectrum<T>> {
        read_npy::<_, Array3<Complex<T>>>(self.path(name))
            .map_err(|err| DeconvolutionError::store(name, err))
    }
}

/// Direction of a recorded store access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAccess {
    Read(String),
    Write(String),
}

#[derive(Debug, Clone)]
enum Blob<T: DeconvFloat> {
    Real(Volume<T>),
    Complex(Spectrum<T>),
}

#[derive(Debug)]
struct MemoryInner<T: DeconvFloat> {
    blobs: HashMap<String, Blob<T>>,
    log: Vec<StoreAccess>,
}

/// In-process store. Clones share the same blobs, so a handle kept by the caller can
/// inspect (or tamper with) what an estimator wrote.
#[derive(Debug, Clone)]
pub struct MemoryStore<T: DeconvFloat> {
    inner: Arc<Mutex<MemoryInner<T>>>,
}

impl<T: DeconvFloat> Default for MemoryStore<T> {
    fn default() -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(MemoryInner {
                blobs: HashMap::new(),
                log: Vec::new(),
            })),
        }
    }
}

impl<T: DeconvFloat> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner<T>>> {
        self.inner
            .lock()
            .map_err(|_| DeconvolutionError::store("memory", "store mutex poisoned"))
    }

    /// Every read and write so far, in order.
    pub fn access_log(&self) -> Vec<StoreAccess> {
        self.lock().map(|inner| inner.log.clone()).unwrap_or_default()
    }

    pub fn clear_access_log(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.log.clear();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|inner| inner.blobs.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Drops a blob, returning whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.lock()
            .map(|mut inner| inner.blobs.remove(name).is_some())
            .unwrap_or(false)
    }

    fn write(&self, name: &str, blob: Blob<T>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.log.push(StoreAccess::Write(name.to_string()));
        inner.blobs.insert(name.to_string(), blob);
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Blob<T>> {
        let mut inner = self.lock()?;
        inner.log.push(StoreAccess::Read(name.to_string()));
        inner
            .blobs
            .get(name)
            .cloned()
            .ok_or_else(|| DeconvolutionError::store(name, "no such blob"))
    }
}

impl<T: DeconvFloat> VolumeStore<T> for MemoryStore<T> {
    fn write_volume(&mut self, name: &str, volume: &Volume<T>) -> Result<()> {
        self.write(name, Blob::Real(volume.clone()))
    }

    fn read_volume(&self, name: &str) -> Result<Volume<T>> {
        match self.read(name)? {
            Blob::Real(volume) => Ok(volume),
            Blob::Complex(_) => Err(DeconvolutionError::store(name, "blob is complex")),
        }
    }

    fn write_spectrum(&mut self, name: &str, spectrum: &Spectrum<T>) -> Result<()> {
        self.write(name, Blob::Complex(spectrum.clone()))
    }

    fn read_spectrum(&self, name: &str) -> Result<Spectrum<T>> {
        match self.read(name)? {
            Blob::Complex(spectrum) => Ok(spectrum),
            Blob::Real(_) => Err(DeconvolutionError::store(name, "blob is real")),
        }
    }
}

/// Per-stratum OTFs spilled to a [`VolumeStore`].
///
/// Blobs are named `otf-{namespace}-{index}`; the namespace is a fresh v4 UUID, so several
/// estimators can share one store.
pub struct OtfCache<T: DeconvFloat> {
    store: Box<dyn VolumeStore<T>>,
    namespace: Uuid,
    shape: Option<[usize; 3]>,
}

impl<T: DeconvFloat> Debug for OtfCache<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtfCache")
            .field("namespace", &self.namespace)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl<T: DeconvFloat> OtfCache<T> {
    pub fn new(store: Box<dyn VolumeStore<T>>) -> Self {
        OtfCache {
            store,
            namespace: Uuid::new_v4(),
            shape: None,
        }
    }

    pub fn namespace(&self) -> Uuid {
        self.namespace
    }

    pub fn key(&self, index: usize) -> String {
        format!("otf-{}-{index:03}", self.namespace)
    }

    pub fn put(&mut self, index: usize, otf: &Spectrum<T>) -> Result<()> {
        let (s0, s1, s2) = otf.dim();
        self.shape = Some([s0, s1, s2]);
        let key = self.key(index);
        self.store.write_spectrum(&key, otf)
    }

    /// Reads an OTF back; a blob whose shape differs from what was written is corrupt.
    pub fn get(&self, index: usize) -> Result<Spectrum<T>> {
        let key = self.key(index);
        let otf = self.store.read_spectrum(&key)?;
        let (s0, s1, s2) = otf.dim();
        match self.shape {
            Some(expected) if expected != [s0, s1, s2] => Err(DeconvolutionError::store(
                key,
                format!("expected shape {expected:?}, found {:?}", [s0, s1, s2]),
            )),
            _ => Ok(otf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn memory_store_round_trips_and_logs() {
        let mut store = MemoryStore::<f64>::new();
        let handle = store.clone();
        let volume = Array3::from_elem((2, 2, 2), 3.0);
        store.write_volume("a", &volume).unwrap();
        assert_eq!(store.read_volume("a").unwrap(), volume);
        assert!(store.read_spectrum("a").is_err());
        assert_eq!(
            handle.access_log(),
            vec![
                StoreAccess::Write("a".into()),
                StoreAccess::Read("a".into()),
                StoreAccess::Read("a".into()),
            ]
        );
        assert!(handle.remove("a"));
        assert!(matches!(
            store.read_volume("a"),
            Err(DeconvolutionError::Store { .. })
        ));
    }

    #[test]
    fn npy_store_round_trips() {
        let mut store = NpyStore::temporary().unwrap();
        let volume = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f32);
        VolumeStore::<f32>::write_volume(&mut store, "volume", &volume).unwrap();
        let back: Array3<f32> = store.read_volume("volume").unwrap();
        assert_eq!(back, volume);

        let spectrum = volume.mapv(|v| Complex::new(v, -v));
        store.write_spectrum("spectrum", &spectrum).unwrap();
        let back: Array3<Complex<f32>> = store.read_spectrum("spectrum").unwrap();
        assert_eq!(back, spectrum);
        assert!(store.root().join("spectrum.npy").is_file());
    }

    #[test]
    fn npy_store_rejects_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert!(NpyStore::new(missing).is_err());
        assert!(NpyStore::new(dir.path()).is_ok());
    }

    #[test]
    fn otf_cache_namespaces_and_checks_shape() {
        let store = MemoryStore::<f64>::new();
        let handle = store.clone();
        let mut cache = OtfCache::new(Box::new(store));
        let otf = Array3::from_elem((2, 2, 2), Complex::new(1.0, 0.0));
        cache.put(0, &otf).unwrap();
        assert_eq!(cache.get(0).unwrap(), otf);
        assert!(cache.key(7).ends_with("-007"));
        assert!(cache.key(0).contains(&cache.namespace().to_string()));

        let mut tampered = handle.clone();
        tampered
            .write_spectrum(&cache.key(0), &Array3::zeros((1, 2, 2)))
            .unwrap();
        assert!(cache.get(0).is_err());
        assert!(cache.get(1).is_err());
    }
}
