//! 学習データの一覧
//!
//! `<data_dir>/<label>/<image>` 形式のディレクトリを走査して、
//! (ラベル, 画像パス) の組を作ります。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::label_codec::LabelCodec;
use crate::error::VisionResult;

/// デフォルトで対象とする拡張子
pub const DEFAULT_SUFFIXES: [&str; 2] = [".jpg", ".png"];

/// 学習・検証・評価に使う1件のデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub label: String,
    pub path: PathBuf,
}

impl Example {
    pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
        }
    }
}

/// データ一覧（ラベルごとのパス一覧も保持）
#[derive(Debug, Clone, Default)]
pub struct ExampleCatalog {
    examples: Vec<Example>,
    by_label: HashMap<String, Vec<PathBuf>>,
}

impl ExampleCatalog {
    pub fn new(examples: Vec<Example>) -> Self {
        let mut by_label: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for example in &examples {
            by_label
                .entry(example.label.clone())
                .or_default()
                .push(example.path.clone());
        }
        Self { examples, by_label }
    }

    /// ディレクトリを走査して一覧を作成
    ///
    /// - `codec` が `None` ならすべて採用
    /// - 既知のラベルは採用
    /// - 未知のラベルは `add_new_labels` が真なら `codec` に追加して採用、偽なら捨てる
    pub fn build_from_directory<P: AsRef<Path>>(
        example_data_path: P,
        file_suffixes: &[&str],
        mut codec: Option<&mut LabelCodec>,
        add_new_labels: bool,
    ) -> VisionResult<Self> {
        let suffixes: Vec<String> = file_suffixes.iter().map(|s| s.to_lowercase()).collect();
        let mut examples = Vec::new();

        for label_dir in sorted_entries(example_data_path.as_ref())? {
            if !label_dir.is_dir() {
                continue;
            }
            let label = match label_dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            for file_path in sorted_entries(&label_dir)? {
                if !file_path.is_file() {
                    continue;
                }
                let file_name = file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if !suffixes.iter().any(|suffix| file_name.ends_with(suffix.as_str())) {
                    continue;
                }

                let accepted = match codec.as_deref_mut() {
                    None => true,
                    Some(codec) if codec.contains(&label) => true,
                    Some(codec) if add_new_labels => {
                        codec.add_label(&label)?;
                        true
                    }
                    Some(_) => false,
                };

                if accepted {
                    examples.push(Example::new(label.clone(), file_path));
                }
            }
        }

        let catalog = Self::new(examples);
        tracing::debug!(
            "ExampleCatalog(examples={}, labels={})",
            catalog.len(),
            catalog.by_label.len()
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Example> {
        self.examples.iter()
    }

    /// 含まれるラベル（名前順）
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.by_label.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    pub fn paths_for(&self, label: &str) -> &[PathBuf] {
        self.by_label.get(label).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn sorted_entries(dir: &Path) -> VisionResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        paths.push(entry?.path());
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(root: &Path) {
        for (label, files) in [
            ("apple", vec!["a1.jpg", "a2.PNG", "readme.txt"]),
            ("banana", vec!["b1.png"]),
            ("pear", vec!["p1.jpg", "p2.jpg"]),
        ] {
            let dir = root.join(label);
            fs::create_dir_all(&dir).unwrap();
            for file in files {
                fs::write(dir.join(file), b"x").unwrap();
            }
        }
        fs::write(root.join("stray.jpg"), b"x").unwrap();
    }

    #[test]
    fn test_build_without_codec_accepts_all() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let catalog =
            ExampleCatalog::build_from_directory(dir.path(), &DEFAULT_SUFFIXES, None, false).unwrap();
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.labels(), vec!["apple", "banana", "pear"]);
        assert_eq!(catalog.paths_for("apple").len(), 2);
        assert!(catalog.paths_for("cherry").is_empty());
        assert_eq!(catalog.examples()[0].label, "apple");
    }

    #[test]
    fn test_build_with_codec_drops_unknown_labels() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let mut codec = LabelCodec::new(10);
        codec.add_label("pear").unwrap();
        let catalog = ExampleCatalog::build_from_directory(
            dir.path(),
            &DEFAULT_SUFFIXES,
            Some(&mut codec),
            false,
        )
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(codec.len(), 1);
    }

    #[test]
    fn test_build_with_codec_adds_new_labels() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let mut codec = LabelCodec::new(10);
        codec.add_label("pear").unwrap();
        let catalog = ExampleCatalog::build_from_directory(
            dir.path(),
            &DEFAULT_SUFFIXES,
            Some(&mut codec),
            true,
        )
        .unwrap();
        assert_eq!(catalog.len(), 5);
        assert_eq!(codec.encode("pear").unwrap(), 0);
        assert_eq!(codec.encode("apple").unwrap(), 1);
        assert_eq!(codec.encode("banana").unwrap(), 2);
    }
}
