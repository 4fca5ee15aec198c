//! モデルディレクトリの構成
//!
//! ```text
//! <models_root>/<name>/
//!   data/<label>/*.png   学習データ
//!   model/labels.txt     ラベル表
//!   model/*.tar.gz       スナップショット
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::VisionResult;

/// ラベル表のファイル名
pub const LABELS_FILE: &str = "labels.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLayout {
    root: PathBuf,
}

impl ModelLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// `<models_root>/<name>`
    pub fn named<P: AsRef<Path>>(models_root: P, name: &str) -> Self {
        Self::new(models_root.as_ref().join(name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    pub fn labels_path(&self) -> PathBuf {
        self.model_dir().join(LABELS_FILE)
    }

    /// 学習データのラベルディレクトリ
    pub fn label_dir(&self, label: &str) -> PathBuf {
        self.data_dir().join(label)
    }

    pub fn create_dirs(&self) -> VisionResult<()> {
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.model_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ModelLayout::named("models", "fruits");
        assert_eq!(layout.data_dir(), PathBuf::from("models/fruits/data"));
        assert_eq!(layout.model_dir(), PathBuf::from("models/fruits/model"));
        assert_eq!(layout.labels_path(), PathBuf::from("models/fruits/model/labels.txt"));
        assert_eq!(layout.label_dir("apple"), PathBuf::from("models/fruits/data/apple"));
    }

    #[test]
    fn test_create_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ModelLayout::named(dir.path(), "fruits");
        layout.create_dirs().unwrap();
        assert!(layout.data_dir().is_dir());
        assert!(layout.model_dir().is_dir());
    }
}
