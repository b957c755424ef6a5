//! Persisted pipeline artifacts.
//!
//! A store holds one slot per [`ArtifactKind`]. Writing a slot replaces it
//! as a whole; readers never observe a partially written artifact. A slot
//! that was never written reads back as `None`.

use std::{
    collections::HashMap,
    fs,
    io::{self, Cursor, Write},
    path::{Path, PathBuf},
};

use ndarray::{Array1, Ix1, Ix3};
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    enums::ArtifactKind,
    mesh::{self, Mesh, Point},
    npy::{self, NpyError},
    volume::{MaskVolume, Volume, is_valid_spacing},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write {kind} artifact to {location}: {source}")]
    Write {
        kind: ArtifactKind,
        location: String,
        source: io::Error,
    },

    #[error("Failed to read {kind} artifact from {location}: {source}")]
    Read {
        kind: ArtifactKind,
        location: String,
        source: io::Error,
    },

    #[error("Malformed {kind} artifact: {source}")]
    Decode { kind: ArtifactKind, source: NpyError },

    #[error("Malformed mesh artifact: {0}")]
    Mesh(io::Error),

    #[error("Spacing artifact must hold three positive values, got {0:?}")]
    InvalidSpacing(Vec<f64>),

    #[error("The {0} artifact has not been produced yet")]
    Missing(ArtifactKind),
}

pub trait ArtifactStore: Send + Sync {
    /// Replace the artifact in slot `kind`.
    fn put(&self, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError>;

    fn get(&self, kind: ArtifactKind) -> Result<Option<Vec<u8>>, StoreError>;

    fn exists(&self, kind: ArtifactKind) -> bool;

    /// Human readable address of the slot, for logs.
    fn location(&self, kind: ArtifactKind) -> String;
}

/// Artifacts as files in one directory, named after their kind.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    fn write_atomic(&self, kind: ArtifactKind, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        // the temporary file lives next to the target so persisting is a rename
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(self.path(kind)).map_err(|err| err.error)?;
        Ok(())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(kind, bytes)
            .map_err(|source| StoreError::Write {
                kind,
                location: self.location(kind),
                source,
            })?;
        debug!("Wrote {} bytes to {}", bytes.len(), self.location(kind));
        Ok(())
    }

    fn get(&self, kind: ArtifactKind) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path(kind)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                kind,
                location: self.location(kind),
                source,
            }),
        }
    }

    fn exists(&self, kind: ArtifactKind) -> bool {
        self.path(kind).is_file()
    }

    fn location(&self, kind: ArtifactKind) -> String {
        self.path(kind).display().to_string()
    }
}

/// Artifacts held in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<ArtifactKind, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, kind: ArtifactKind) -> Option<Vec<u8>> {
        self.artifacts.write().remove(&kind)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError> {
        self.artifacts.write().insert(kind, bytes.to_vec());
        Ok(())
    }

    fn get(&self, kind: ArtifactKind) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.artifacts.read().get(&kind).cloned())
    }

    fn exists(&self, kind: ArtifactKind) -> bool {
        self.artifacts.read().contains_key(&kind)
    }

    fn location(&self, kind: ArtifactKind) -> String {
        format!("memory://{}", kind.file_name())
    }
}

/// Typed access to the artifact slots.
pub trait ArtifactStoreExt: ArtifactStore {
    /// Persist the volume samples and their spacing.
    ///
    /// The two slots are written one after the other. Spacing goes first and
    /// is put back if the volume write fails, so a failed write leaves either
    /// the previous pair or a spacing without volume, which reads as `None`.
    /// The restore itself can fail, in which case the slots no longer match.
    fn put_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let previous = self.get(ArtifactKind::Spacing)?;
        self.put(
            ArtifactKind::Spacing,
            &npy::encode(&Array1::from(volume.spacing.to_vec())),
        )?;

        if let Err(err) = self.put(ArtifactKind::Volume, &npy::encode(&volume.data)) {
            if let Some(previous) = previous {
                if let Err(restore) = self.put(ArtifactKind::Spacing, &previous) {
                    warn!("Could not restore previous spacing: {restore}");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// The persisted volume, `None` unless both samples and spacing exist.
    fn get_volume(&self) -> Result<Option<Volume>, StoreError> {
        let Some(bytes) = self.get(ArtifactKind::Volume)? else {
            return Ok(None);
        };
        let Some(spacing) = self.get_spacing()? else {
            return Ok(None);
        };
        let data = npy::decode::<f32, Ix3>(&bytes).map_err(|source| StoreError::Decode {
            kind: ArtifactKind::Volume,
            source,
        })?;
        Ok(Some(Volume::new(data, spacing)))
    }

    fn get_spacing(&self) -> Result<Option<[f64; 3]>, StoreError> {
        let Some(bytes) = self.get(ArtifactKind::Spacing)? else {
            return Ok(None);
        };
        let values = npy::decode::<f64, Ix1>(&bytes).map_err(|source| StoreError::Decode {
            kind: ArtifactKind::Spacing,
            source,
        })?;
        match values.as_slice() {
            Some(&[d, r, c]) if is_valid_spacing(&[d, r, c]) => Ok(Some([d, r, c])),
            _ => Err(StoreError::InvalidSpacing(values.to_vec())),
        }
    }

    fn put_mask(&self, mask: &MaskVolume) -> Result<(), StoreError> {
        self.put(ArtifactKind::Mask, &npy::encode(&mask.data))
    }

    /// The persisted mask. Its spacing is read from the spacing slot, which
    /// must exist alongside it.
    fn get_mask(&self) -> Result<Option<MaskVolume>, StoreError> {
        let Some(bytes) = self.get(ArtifactKind::Mask)? else {
            return Ok(None);
        };
        let spacing = self
            .get_spacing()?
            .ok_or(StoreError::Missing(ArtifactKind::Spacing))?;
        let data = npy::decode::<u8, Ix3>(&bytes).map_err(|source| StoreError::Decode {
            kind: ArtifactKind::Mask,
            source,
        })?;
        Ok(Some(MaskVolume::new(data, spacing)))
    }

    fn put_mesh(&self, mesh: &Mesh) -> Result<(), StoreError> {
        let bytes = mesh::to_stl_bytes(mesh).map_err(StoreError::Mesh)?;
        self.put(ArtifactKind::Mesh, &bytes)
    }

    /// The persisted mesh as a triangle soup.
    fn get_mesh(&self) -> Result<Option<Vec<[Point; 3]>>, StoreError> {
        let Some(bytes) = self.get(ArtifactKind::Mesh)? else {
            return Ok(None);
        };
        mesh::read_stl(&mut Cursor::new(bytes))
            .map(Some)
            .map_err(StoreError::Mesh)
    }
}

impl<S: ArtifactStore + ?Sized> ArtifactStoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, array};
    use tempfile::TempDir;

    fn volume() -> Volume {
        Volume::new(
            Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z * 20 + y * 5 + x) as f32 - 7.5),
            [2.5, 0.75, 0.75],
        )
    }

    fn exercise(store: &dyn ArtifactStore) {
        assert!(store.get_volume().unwrap().is_none());
        assert!(store.get_mask().unwrap().is_none());
        assert!(store.get_mesh().unwrap().is_none());
        assert!(!store.exists(ArtifactKind::Volume));

        let volume = volume();
        store.put_volume(&volume).unwrap();
        let read = store.get_volume().unwrap().unwrap();
        assert_eq!(read.data, volume.data);
        assert_eq!(read.spacing, volume.spacing);

        let mask = MaskVolume::new(volume.data.mapv(|v| u8::from(v > 0.0)), volume.spacing);
        store.put_mask(&mask).unwrap();
        let read = store.get_mask().unwrap().unwrap();
        assert_eq!(read.data, mask.data);
        assert_eq!(read.spacing, mask.spacing);

        let mesh = Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            faces: vec![[0, 1, 2]],
        };
        store.put_mesh(&mesh).unwrap();
        let soup = store.get_mesh().unwrap().unwrap();
        assert_eq!(soup, mesh.triangles().collect::<Vec<_>>());

        for kind in ArtifactKind::ALL {
            assert!(store.exists(kind), "{kind} missing");
        }
    }

    #[test]
    fn memory_store_round_trips_artifacts() {
        exercise(&MemoryArtifactStore::new());
    }

    #[test]
    fn fs_store_round_trips_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path().join("run-1"));
        exercise(&store);

        assert!(dir.path().join("run-1").join("segmented_volume.npy").is_file());
        assert!(dir.path().join("run-1").join("organ_model.stl").is_file());
        // no temporary files are left behind
        let entries = fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(entries, ArtifactKind::ALL.len());
    }

    #[test]
    fn put_replaces_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.put(ArtifactKind::Mesh, b"first").unwrap();
        store.put(ArtifactKind::Mesh, b"second").unwrap();
        assert_eq!(store.get(ArtifactKind::Mesh).unwrap().unwrap(), b"second");
    }

    #[test]
    fn failed_write_keeps_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.put(ArtifactKind::Mesh, b"intact").unwrap();

        // a file where the directory should be makes the write fail
        let blocked = FsArtifactStore::new(dir.path().join("organ_model.stl").join("nested"));
        assert!(matches!(
            blocked.put(ArtifactKind::Mesh, b"lost"),
            Err(StoreError::Write { .. })
        ));
        assert_eq!(store.get(ArtifactKind::Mesh).unwrap().unwrap(), b"intact");
    }

    /// Fails every write to one slot.
    struct FailingStore<'a> {
        inner: &'a MemoryArtifactStore,
        failing: ArtifactKind,
    }

    impl ArtifactStore for FailingStore<'_> {
        fn put(&self, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError> {
            if kind == self.failing {
                return Err(StoreError::Write {
                    kind,
                    location: self.location(kind),
                    source: io::Error::other("disk full"),
                });
            }
            self.inner.put(kind, bytes)
        }

        fn get(&self, kind: ArtifactKind) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(kind)
        }

        fn exists(&self, kind: ArtifactKind) -> bool {
            self.inner.exists(kind)
        }

        fn location(&self, kind: ArtifactKind) -> String {
            self.inner.location(kind)
        }
    }

    #[test]
    fn failed_volume_write_keeps_previous_pair() {
        let inner = MemoryArtifactStore::new();
        let original = volume();
        inner.put_volume(&original).unwrap();

        let failing = FailingStore {
            inner: &inner,
            failing: ArtifactKind::Volume,
        };
        let replacement = Volume::new(Array3::zeros((2, 2, 2)), [1.0, 3.0, 3.0]);
        assert!(matches!(
            failing.put_volume(&replacement),
            Err(StoreError::Write {
                kind: ArtifactKind::Volume,
                ..
            })
        ));

        let read = inner.get_volume().unwrap().unwrap();
        assert_eq!(read.data, original.data);
        assert_eq!(read.spacing, original.spacing);
    }

    #[test]
    fn failed_first_volume_write_reads_as_absent() {
        let inner = MemoryArtifactStore::new();
        let failing = FailingStore {
            inner: &inner,
            failing: ArtifactKind::Volume,
        };
        assert!(failing.put_volume(&volume()).is_err());

        assert!(inner.exists(ArtifactKind::Spacing));
        assert!(inner.get_volume().unwrap().is_none());
    }

    #[test]
    fn mask_without_spacing_is_an_error() {
        let store = MemoryArtifactStore::new();
        store
            .put_mask(&MaskVolume::new(Array3::zeros((2, 2, 2)), [1.0; 3]))
            .unwrap();
        assert!(matches!(
            store.get_mask(),
            Err(StoreError::Missing(ArtifactKind::Spacing))
        ));
    }

    #[test]
    fn invalid_spacing_is_rejected() {
        let store = MemoryArtifactStore::new();
        store
            .put(ArtifactKind::Spacing, &npy::encode(&array![1.0f64, 0.0, 1.0]))
            .unwrap();
        assert!(matches!(
            store.get_spacing(),
            Err(StoreError::InvalidSpacing(_))
        ));

        store
            .put(ArtifactKind::Spacing, &npy::encode(&array![1.0f64, 1.0]))
            .unwrap();
        assert!(matches!(
            store.get_spacing(),
            Err(StoreError::InvalidSpacing(_))
        ));
    }
}
