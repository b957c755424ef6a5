use std::{
    collections::HashSet,
    fs,
    sync::{Arc, Barrier},
    thread::{self, ThreadId},
    time::Duration,
};

use dicom_surface::{
    ArtifactKind, ArtifactStore, ArtifactStoreExt, FsArtifactStore, MemoryArtifactStore,
    Pipeline, PipelineConfig, SourceKind, SyntheticConfig,
    source::{SourceOutcome, VolumeSource},
    store::StoreError,
};
use parking_lot::Mutex;
use tempfile::TempDir;

struct TestEnv {
    _tmp: TempDir,
    config: PipelineConfig,
}

impl TestEnv {
    fn new(size: usize) -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let config = PipelineConfig {
            input_dir: tmp.path().join("dicom"),
            output_dir: tmp.path().join("output"),
            synthetic: SyntheticConfig {
                size,
                noise_std: 10.0,
                seed: Some(2024),
            },
            ..Default::default()
        };
        Self { _tmp: tmp, config }
    }
}

#[test]
fn missing_input_synthesizes_full_size_volume() {
    let env = TestEnv::new(128);
    let source = VolumeSource::new(&env.config.input_dir, SyntheticConfig::default());

    let SourceOutcome::Synthesized(volume) = source.acquire() else {
        panic!("expected a synthesized volume");
    };
    assert_eq!(volume.dim(), (128, 128, 128));
    assert_eq!(volume.spacing, [1.0, 1.0, 1.0]);
}

#[test]
fn full_run_writes_artifacts_to_disk() {
    let env = TestEnv::new(48);
    let pipeline = Pipeline::from_config(env.config.clone());
    let report = pipeline.run().unwrap();

    assert_eq!(report.source, SourceKind::Synthesized);
    assert_eq!(report.volume_shape, (48, 48, 48));
    assert!(report.face_count > 0);

    let dir = env.config.output_dir.clone();
    for name in [
        "volume.npy",
        "spacing.npy",
        "segmented_volume.npy",
        "organ_model.stl",
    ] {
        assert!(dir.join(name).is_file(), "{name} not written");
    }

    let stl = fs::read(dir.join("organ_model.stl")).unwrap();
    assert_eq!(stl.len(), 84 + 50 * report.face_count);

    let store = FsArtifactStore::new(&dir);
    let mask = store.get_mask().unwrap().unwrap();
    assert_eq!(mask.dim(), report.volume_shape);
    assert!(mask.is_binary());
    assert_eq!(mask.foreground_count(), report.foreground_voxels);
}

#[test]
fn repeated_runs_give_identical_masks() {
    let env = TestEnv::new(40);
    let pipeline = Pipeline::from_config(env.config.clone());

    pipeline.run().unwrap();
    let first = pipeline.fetch(ArtifactKind::Mask).unwrap().unwrap();
    pipeline.run().unwrap();
    let second = pipeline.fetch(ArtifactKind::Mask).unwrap().unwrap();

    assert_eq!(first, second);
}

#[test]
fn fetch_before_any_run_is_not_present() {
    let env = TestEnv::new(16);
    let pipeline = Pipeline::from_config(env.config.clone());

    for kind in ArtifactKind::ALL {
        assert!(pipeline.fetch(kind).unwrap().is_none());
    }
}

#[test]
fn rerun_from_persisted_volume() {
    let env = TestEnv::new(32);
    let pipeline = Pipeline::from_config(env.config.clone());
    let full = pipeline.run().unwrap();

    // a lower threshold also picks up the offset sphere
    let config = PipelineConfig {
        threshold: 75.0,
        ..env.config.clone()
    };
    let rerun = Pipeline::from_config(config).run_from_persisted().unwrap();

    assert_eq!(rerun.source, SourceKind::Persisted);
    assert_eq!(rerun.volume_shape, full.volume_shape);
    assert!(rerun.foreground_voxels > full.foreground_voxels);
}

#[test]
fn namespaces_keep_runs_apart() {
    let env = TestEnv::new(24);
    let mut a = env.config.clone();
    a.run_namespace = Some("a".into());
    let mut b = env.config.clone();
    b.run_namespace = Some("b".into());
    b.threshold = 10_000.0;

    let report_a = Pipeline::from_config(a.clone()).run().unwrap();
    let report_b = Pipeline::from_config(b.clone()).run().unwrap();

    assert!(report_a.face_count > 0);
    assert_eq!(report_b.face_count, 0);
    let mesh_a = FsArtifactStore::new(a.artifact_dir()).get_mesh().unwrap().unwrap();
    assert_eq!(mesh_a.len(), report_a.face_count);
    let mesh_b = FsArtifactStore::new(b.artifact_dir()).get_mesh().unwrap().unwrap();
    assert!(mesh_b.is_empty());
}

/// Logs which thread wrote which slot, in write order.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryArtifactStore,
    writes: Mutex<Vec<(ThreadId, ArtifactKind)>>,
}

impl ArtifactStore for RecordingStore {
    fn put(&self, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError> {
        self.writes.lock().push((thread::current().id(), kind));
        // widen the window another run could slip into
        thread::sleep(Duration::from_millis(2));
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
fn concurrent_runs_on_one_pipeline_are_serialized() {
    let env = TestEnv::new(24);
    let pipeline = Arc::new(Pipeline::new(env.config.clone(), RecordingStore::default()));
    let barrier = Arc::new(Barrier::new(4));

    let reports: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                pipeline.run().unwrap()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    // each run writes its four slots back to back from one thread
    let writes = pipeline.store().writes.lock().clone();
    assert_eq!(writes.len(), 4 * reports.len());
    for run in writes.chunks(4) {
        let kinds: Vec<_> = run.iter().map(|(_, kind)| *kind).collect();
        assert_eq!(
            kinds,
            [
                ArtifactKind::Spacing,
                ArtifactKind::Volume,
                ArtifactKind::Mask,
                ArtifactKind::Mesh
            ]
        );
        assert!(
            run.iter().all(|(thread, _)| *thread == run[0].0),
            "runs interleaved: {writes:?}"
        );
    }
    let threads: HashSet<_> = writes.iter().map(|(thread, _)| *thread).collect();
    assert_eq!(threads.len(), reports.len());

    let mask = pipeline.store().get_mask().unwrap().unwrap();
    let soup = pipeline.store().get_mesh().unwrap().unwrap();
    for report in &reports {
        assert_eq!(report.foreground_voxels, mask.foreground_count());
        assert_eq!(report.face_count, soup.len());
    }
}
