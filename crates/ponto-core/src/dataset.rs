//! Enrollment dataset: `<root>/<identity_key>/*.jpg`.
//!
//! Directory enumeration is the only index. [`train`] reads the tree into an
//! immutable [`TrainedModel`]; [`DatasetStore`] writes new enrollment and
//! confirmation images into it.

use crate::lbph::{LbphModel, LbphParams};
use crate::types::{recognize, IdentityMap, Label, Prediction};
use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};
use ponto_frame::gray;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg"];
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no usable images under {}", root.display())]
    EmptyDataset { root: PathBuf },
    #[error("dataset I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("invalid identity key {0:?}")]
    InvalidIdentity(String),
    #[error("dataset I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Classifier plus the label map it was trained with. Installed and replaced
/// as a unit so labels and identities can never disagree.
#[derive(Debug)]
pub struct TrainedModel {
    lbph: LbphModel,
    identities: IdentityMap,
    image_count: usize,
    skipped: usize,
    trained_at: DateTime<Utc>,
}

impl TrainedModel {
    /// Nearest training sample for a normalized face patch.
    pub fn classify(&self, patch: &GrayImage) -> Option<Prediction> {
        self.lbph.predict(patch)
    }

    pub fn recognize(&self, prediction: Prediction, threshold: f64) -> Option<&str> {
        recognize(&self.identities, prediction, threshold)
    }

    pub fn identity(&self, label: Label) -> Option<&str> {
        self.identities.identity(label)
    }

    pub fn identities(&self) -> &IdentityMap {
        &self.identities
    }

    pub fn image_count(&self) -> usize {
        self.image_count
    }

    pub fn summary(&self) -> TrainSummary {
        TrainSummary {
            image_count: self.image_count,
            identities: self.identities.identities().to_vec(),
            skipped: self.skipped,
            trained_at: self.trained_at,
        }
    }
}

/// Result of one training pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSummary {
    pub image_count: usize,
    /// Identity keys in label order.
    pub identities: Vec<String>,
    /// Files that could not be decoded.
    pub skipped: usize,
    pub trained_at: DateTime<Utc>,
}

impl TrainSummary {
    /// Outcome of a pass that found no usable image. The engine stays
    /// untrained and reports every face as unknown.
    pub fn empty() -> Self {
        Self {
            image_count: 0,
            identities: Vec::new(),
            skipped: 0,
            trained_at: Utc::now(),
        }
    }
}

/// Read an image file as a normalized (canonical size, equalized) face patch.
pub fn load_face_patch(path: &Path) -> Result<GrayImage, image::ImageError> {
    let img = image::open(path)?.to_luma8();
    Ok(gray::normalize(&img))
}

/// Train a model from every identity folder under `root`.
///
/// Identities are labelled in lexicographic order of their keys, files in
/// lexicographic order of their names. Unreadable files are skipped. A
/// missing root is created and reported as empty.
pub fn train(root: &Path, params: LbphParams) -> Result<TrainedModel, TrainError> {
    if !root.exists() {
        fs::create_dir_all(root).map_err(|source| TrainError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        tracing::info!(root = %root.display(), "created dataset directory");
    }

    let mut keys = Vec::new();
    let mut samples: Vec<(Label, GrayImage)> = Vec::new();
    let mut skipped = 0usize;

    for (key, dir) in identity_dirs(root).map_err(|source| TrainError::Io {
        path: root.to_path_buf(),
        source,
    })? {
        let files = image_files(&dir).map_err(|source| TrainError::Io {
            path: dir.clone(),
            source,
        })?;

        let label = keys.len() as Label;
        let before = samples.len();
        for file in files {
            match load_face_patch(&file) {
                Ok(patch) => samples.push((label, patch)),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(path = %file.display(), error = %e, "skipping unreadable image");
                }
            }
        }
        if samples.len() > before {
            tracing::debug!(identity = %key, images = samples.len() - before, "identity loaded");
            keys.push(key);
        }
    }

    if samples.is_empty() {
        return Err(TrainError::EmptyDataset {
            root: root.to_path_buf(),
        });
    }

    let lbph = LbphModel::train(params, &samples);
    let model = TrainedModel {
        lbph,
        identities: IdentityMap::new(keys),
        image_count: samples.len(),
        skipped,
        trained_at: Utc::now(),
    };
    tracing::info!(
        images = model.image_count,
        identities = model.identities.len(),
        skipped,
        "model trained"
    );
    Ok(model)
}

/// Immediate subdirectories of `root`, sorted by name.
fn identity_dirs(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        // Non-UTF-8 folder names cannot be identity keys.
        if let Ok(name) = entry.file_name().into_string() {
            dirs.push((name, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// `.jpg`/`.jpeg` files in `dir`, sorted by name.
fn image_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Reject keys that would escape the dataset root or name no folder.
pub fn validate_identity_key(key: &str) -> Result<(), DatasetError> {
    let bad = key.trim().is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\'])
        || key.contains('\0');
    if bad {
        return Err(DatasetError::InvalidIdentity(key.to_string()));
    }
    Ok(())
}

/// Per-identity image count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub identity: String,
    pub images: usize,
}

/// Writer for the enrollment tree.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_dir(&self, key: &str) -> Result<PathBuf, DatasetError> {
        validate_identity_key(key)?;
        Ok(self.root.join(key))
    }

    /// Number of images currently enrolled for `key`.
    pub fn image_count(&self, key: &str) -> Result<usize, DatasetError> {
        let dir = self.identity_dir(key)?;
        if !dir.is_dir() {
            return Ok(0);
        }
        image_files(&dir)
            .map(|f| f.len())
            .map_err(|source| DatasetError::Io { path: dir, source })
    }

    /// Save an enrollment capture as `<key>_<n>_<timestamp>.jpg`.
    pub fn save_enrollment(&self, key: &str, face: &RgbImage) -> Result<PathBuf, DatasetError> {
        let n = self.image_count(key)? + 1;
        let name = format!("{key}_{n}_{}.jpg", Utc::now().format(TIMESTAMP_FORMAT));
        let path = self.write(key, &name, face)?;
        tracing::info!(identity = %key, count = n, path = %path.display(), "enrollment image saved");
        Ok(path)
    }

    /// Save a human-confirmed detection as `confirm_<timestamp>.jpg`.
    pub fn save_confirmation(&self, key: &str, face: &RgbImage) -> Result<PathBuf, DatasetError> {
        let name = format!("confirm_{}.jpg", Utc::now().format(TIMESTAMP_FORMAT));
        let path = self.write(key, &name, face)?;
        tracing::info!(identity = %key, path = %path.display(), "confirmation image saved");
        Ok(path)
    }

    /// Every identity folder with its image count, sorted by key.
    pub fn summary(&self) -> Result<Vec<IdentitySummary>, DatasetError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| DatasetError::Io { path, source }
        };
        identity_dirs(&self.root)
            .map_err(io_err(&self.root))?
            .into_iter()
            .map(|(identity, dir)| {
                let images = image_files(&dir).map_err(io_err(&dir))?.len();
                Ok(IdentitySummary { identity, images })
            })
            .collect()
    }

    fn write(&self, key: &str, name: &str, face: &RgbImage) -> Result<PathBuf, DatasetError> {
        let dir = self.identity_dir(key)?;
        fs::create_dir_all(&dir).map_err(|source| DatasetError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(name);
        face.save(&path).map_err(|source| DatasetError::Image {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::DEFAULT_THRESHOLD;
    use crate::testing::write_dataset;
    use tempfile::TempDir;

    #[test]
    fn test_train_counts_and_labels() {
        let tmp = TempDir::new().unwrap();
        write_dataset(tmp.path(), &[("B", &[20, 21]), ("A", &[10, 11, 12])]);

        let model = train(tmp.path(), LbphParams::default()).unwrap();
        assert_eq!(model.image_count(), 5);
        assert_eq!(model.identities().identities(), &["A".to_string(), "B".to_string()]);
        assert_eq!(model.summary().skipped, 0);
    }

    #[test]
    fn test_own_training_image_recognized() {
        let tmp = TempDir::new().unwrap();
        write_dataset(tmp.path(), &[("A", &[10, 11, 12]), ("B", &[20, 21])]);
        let model = train(tmp.path(), LbphParams::default()).unwrap();

        let query = load_face_patch(&tmp.path().join("A").join("A_1.jpg")).unwrap();
        let p = model.classify(&query).unwrap();
        assert_eq!(model.recognize(p, DEFAULT_THRESHOLD), Some("A"), "distance = {}", p.distance);
    }

    #[test]
    fn test_training_deterministic() {
        let tmp = TempDir::new().unwrap();
        write_dataset(tmp.path(), &[("A", &[10, 11, 12]), ("B", &[20, 21])]);
        let query = load_face_patch(&tmp.path().join("B").join("B_0.jpg")).unwrap();

        let first = train(tmp.path(), LbphParams::default()).unwrap();
        let second = train(tmp.path(), LbphParams::default()).unwrap();
        assert_eq!(first.identities().identities(), second.identities().identities());

        let (p1, p2) = (first.classify(&query).unwrap(), second.classify(&query).unwrap());
        assert_eq!(p1, p2);
        assert_eq!(first.recognize(p1, DEFAULT_THRESHOLD), second.recognize(p2, DEFAULT_THRESHOLD));
    }

    #[test]
    fn test_empty_dataset() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("nobody")).unwrap();
        let err = train(tmp.path(), LbphParams::default()).unwrap_err();
        assert!(matches!(err, TrainError::EmptyDataset { .. }));

        let summary = TrainSummary::empty();
        assert_eq!(summary.image_count, 0);
        assert!(summary.identities.is_empty());
    }

    #[test]
    fn test_missing_root_created() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("dataset");
        let err = train(&root, LbphParams::default()).unwrap_err();
        assert!(matches!(err, TrainError::EmptyDataset { .. }));
        assert!(root.is_dir());
    }

    #[test]
    fn test_unreadable_files_skipped() {
        let tmp = TempDir::new().unwrap();
        write_dataset(tmp.path(), &[("A", &[10, 11])]);
        fs::write(tmp.path().join("A").join("broken.jpg"), b"not a jpeg").unwrap();
        fs::write(tmp.path().join("A").join("notes.txt"), b"ignored").unwrap();

        let model = train(tmp.path(), LbphParams::default()).unwrap();
        assert_eq!(model.image_count(), 2);
        assert_eq!(model.summary().skipped, 1);
    }

    #[test]
    fn test_identity_without_images_gets_no_label() {
        let tmp = TempDir::new().unwrap();
        write_dataset(tmp.path(), &[("B", &[20])]);
        fs::create_dir(tmp.path().join("A")).unwrap();

        let model = train(tmp.path(), LbphParams::default()).unwrap();
        assert_eq!(model.identities().identities(), &["B".to_string()]);
    }

    #[test]
    fn test_uppercase_extension_accepted() {
        assert!(is_image(Path::new("x/face.JPG")));
        assert!(is_image(Path::new("x/face.jpeg")));
        assert!(!is_image(Path::new("x/face.png")));
    }

    #[test]
    fn test_validate_identity_key() {
        assert!(validate_identity_key("12345").is_ok());
        for bad in ["", "  ", ".", "..", "a/b", "a\\b"] {
            assert!(validate_identity_key(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_store_enrollment_naming() {
        let tmp = TempDir::new().unwrap();
        let store = DatasetStore::new(tmp.path());
        let face = RgbImage::new(200, 200);

        let first = store.save_enrollment("alice", &face).unwrap();
        let second = store.save_enrollment("alice", &face).unwrap();
        let name = |p: &Path| p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name(&first).starts_with("alice_1_"), "{}", name(&first));
        assert!(name(&second).starts_with("alice_2_"), "{}", name(&second));
        assert_eq!(store.image_count("alice").unwrap(), 2);

        let confirm = store.save_confirmation("alice", &face).unwrap();
        assert!(name(&confirm).starts_with("confirm_"));
        assert_eq!(
            store.summary().unwrap(),
            vec![IdentitySummary { identity: "alice".into(), images: 3 }]
        );
    }

    #[test]
    fn test_store_rejects_bad_key() {
        let tmp = TempDir::new().unwrap();
        let store = DatasetStore::new(tmp.path());
        let err = store.save_enrollment("../escape", &RgbImage::new(4, 4)).unwrap_err();
        assert!(matches!(err, DatasetError::InvalidIdentity(_)));
    }

    #[test]
    fn test_enrolled_images_train() {
        let tmp = TempDir::new().unwrap();
        let store = DatasetStore::new(tmp.path());
        store.save_enrollment("alice", &RgbImage::new(200, 200)).unwrap();

        let model = train(store.root(), LbphParams::default()).unwrap();
        assert_eq!(model.image_count(), 1);
    }
}
