//! ラベル文字列と出力ニューロン番号（スロット）の相互変換
//!
//! スロットは固定長で、一度割り当てた番号は変わりません。
//! `labels.txt` 形式（1行1スロット、`<index>=<label>`）で保存・読み込みします。

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{VisionError, VisionResult};

/// デフォルトのスロット数
pub const DEFAULT_MAX_LABELS: usize = 1000;

/// ラベルコーデック
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCodec {
    labels: Vec<Option<String>>,
    key_to_index: HashMap<String, usize>,
}

impl Default for LabelCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LABELS)
    }
}

impl LabelCodec {
    /// 空のコーデックを作成
    pub fn new(max_labels: usize) -> Self {
        Self {
            labels: vec![None; max_labels],
            key_to_index: HashMap::new(),
        }
    }

    /// スロット数（分類器の出力次元）
    pub fn capacity(&self) -> usize {
        self.labels.len()
    }

    /// 使用中のスロット数
    pub fn len(&self) -> usize {
        self.key_to_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_index.is_empty()
    }

    /// ラベルを追加してスロット番号を返す
    ///
    /// 登録済みなら既存の番号を返します。空きスロットは番号の小さい順に使います。
    pub fn add_label(&mut self, key: &str) -> VisionResult<usize> {
        if let Some(&index) = self.key_to_index.get(key) {
            return Ok(index);
        }

        let free_index = self
            .labels
            .iter()
            .position(Option::is_none)
            .ok_or(VisionError::LabelCapacityExceeded {
                capacity: self.capacity(),
            })?;

        self.labels[free_index] = Some(key.to_string());
        self.key_to_index.insert(key.to_string(), free_index);
        Ok(free_index)
    }

    pub fn encode(&self, key: &str) -> VisionResult<usize> {
        self.key_to_index
            .get(key)
            .copied()
            .ok_or_else(|| VisionError::UnknownLabel(key.to_string()))
    }

    /// スロット番号からラベルを取得（空きスロット・範囲外は `None`）
    pub fn decode(&self, index: usize) -> Option<&str> {
        self.labels.get(index).and_then(|label| label.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_to_index.contains_key(key)
    }

    /// 使用中のスロットを番号順に列挙
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(index, label)| label.as_deref().map(|label| (index, label)))
    }

    /// テーブルファイルに保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VisionResult<()> {
        let mut file = fs::File::create(path.as_ref())?;
        for (index, label) in self.labels.iter().enumerate() {
            writeln!(file, "{}={}", index, label.as_deref().unwrap_or(""))?;
        }
        file.flush()?;
        Ok(())
    }

    /// テーブルファイルから読み込む
    ///
    /// ファイルが無い・壊れている場合は `None` を返します（呼び出し側で新規作成）。
    pub fn load<P: AsRef<Path>>(path: P) -> Option<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("ラベルファイルを読み込めません {}: {}", path.display(), e);
                return None;
            }
        };

        match Self::parse(&content) {
            Ok(codec) => Some(codec),
            Err(e) => {
                tracing::warn!("ラベルファイルが不正です {}: {}", path.display(), e);
                None
            }
        }
    }

    fn parse(content: &str) -> VisionResult<Self> {
        let lines: Vec<&str> = content.lines().collect();
        let mut codec = Self::new(lines.len());

        for (line_no, line) in lines.iter().enumerate() {
            let line = line.trim_end_matches('\r');
            let (index, label) = line.split_once('=').ok_or_else(|| {
                VisionError::InvalidInput(format!("line {}: missing '='", line_no + 1))
            })?;

            let index: usize = index.trim().parse().map_err(|_| {
                VisionError::InvalidInput(format!("line {}: invalid index '{}'", line_no + 1, index))
            })?;
            if index != line_no {
                return Err(VisionError::InvalidInput(format!(
                    "line {}: slot {} out of order",
                    line_no + 1,
                    index
                )));
            }

            if label.is_empty() {
                continue;
            }
            if codec.key_to_index.contains_key(label) {
                return Err(VisionError::InvalidInput(format!(
                    "line {}: duplicate label '{}'",
                    line_no + 1,
                    label
                )));
            }

            // 空きスロットの位置を保つため、行番号のスロットに直接配置する
            codec.labels[index] = Some(label.to_string());
            codec.key_to_index.insert(label.to_string(), index);
        }

        Ok(codec)
    }

    /// サブディレクトリ名をラベルとして登録する
    ///
    /// 名前順に登録するため、スロット番号はファイルシステムの列挙順に依存しません。
    pub fn load_from_directory<P: AsRef<Path>>(
        labels_path: P,
        existing: Option<LabelCodec>,
    ) -> VisionResult<Self> {
        let mut names = Vec::new();
        for entry in fs::read_dir(labels_path.as_ref())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();

        let mut codec = existing.unwrap_or_default();
        for name in &names {
            codec.add_label(name)?;
        }
        Ok(codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_label_is_idempotent() {
        let mut codec = LabelCodec::new(4);
        let first = codec.add_label("apple").unwrap();
        let second = codec.add_label("apple").unwrap();
        assert_eq!(first, second);
        assert_eq!(codec.len(), 1);
        assert_eq!(codec.encode("apple").unwrap(), first);
        assert_eq!(codec.decode(first), Some("apple"));
    }

    #[test]
    fn test_capacity_exceeded_keeps_slots() {
        let mut codec = LabelCodec::new(2);
        codec.add_label("a").unwrap();
        codec.add_label("b").unwrap();
        let before = codec.clone();

        let err = codec.add_label("c").unwrap_err();
        assert!(matches!(err, VisionError::LabelCapacityExceeded { capacity: 2 }));
        assert_eq!(codec, before);
    }

    #[test]
    fn test_encode_unknown_label() {
        let codec = LabelCodec::new(3);
        assert!(matches!(codec.encode("pear"), Err(VisionError::UnknownLabel(_))));
        assert_eq!(codec.decode(99), None);
    }

    #[test]
    fn test_save_load_keeps_empty_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");

        std::fs::write(&path, "0=a\n1=\n2=c\n3=\n4=e\n").unwrap();
        let loaded = LabelCodec::load(&path).unwrap();
        loaded.save(&path).unwrap();
        let reloaded = LabelCodec::load(&path).unwrap();

        assert_eq!(loaded, reloaded);
        assert_eq!(reloaded.capacity(), 5);
        assert_eq!(reloaded.decode(1), None);
        assert_eq!(reloaded.decode(3), None);
        assert_eq!(reloaded.encode("e").unwrap(), 4);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0=a\n1=\n2=c\n3=\n4=e\n");

        for (index, label) in reloaded.iter() {
            assert_eq!(reloaded.encode(label).unwrap(), index);
        }
    }

    #[test]
    fn test_load_table_with_gap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "0=apple\n1=\n2=banana\n").unwrap();

        let codec = LabelCodec::load(&path).unwrap();
        assert_eq!(codec.decode(1), None);
        assert_eq!(codec.encode("banana").unwrap(), 2);
        assert!(!codec.contains("default"));
    }

    #[test]
    fn test_load_missing_or_corrupt_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LabelCodec::load(dir.path().join("missing.txt")).is_none());

        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "0=apple\nbroken line\n").unwrap();
        assert!(LabelCodec::load(&path).is_none());

        std::fs::write(&path, "0=apple\n1=apple\n").unwrap();
        assert!(LabelCodec::load(&path).is_none());
    }

    #[test]
    fn test_load_from_directory_sorts_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["cherry", "apple", "banana"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let codec = LabelCodec::load_from_directory(dir.path(), None).unwrap();
        assert_eq!(codec.capacity(), DEFAULT_MAX_LABELS);
        assert_eq!(codec.encode("apple").unwrap(), 0);
        assert_eq!(codec.encode("banana").unwrap(), 1);
        assert_eq!(codec.encode("cherry").unwrap(), 2);
        assert!(!codec.contains("notes.txt"));

        let mut existing = LabelCodec::new(10);
        existing.add_label("default").unwrap();
        let merged = LabelCodec::load_from_directory(dir.path(), Some(existing)).unwrap();
        assert_eq!(merged.encode("default").unwrap(), 0);
        assert_eq!(merged.encode("apple").unwrap(), 1);
    }
}
