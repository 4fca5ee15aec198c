//! スナップショットのメタデータ
//!
//! tar.gz形式のスナップショットに `metadata.json` として格納されます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// スナップショットのメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: 分類器の重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// バージョン番号（1始まり、保存ごとに増加）
    pub version: u64,

    /// 保存時点の精度
    pub accuracy: f32,

    /// 保存時点の損失
    pub loss: f32,

    /// ラベルのスロット数（分類器の出力次元）
    pub num_labels: usize,

    /// 分類器の入力幅（ピクセル）
    pub input_width: u32,

    /// 分類器の入力高さ（ピクセル）
    pub input_height: u32,

    /// 保存時点のエポック（0始まり）
    #[serde(default)]
    pub epoch: usize,

    /// 保存時点のバッチ（エポック終了時の保存なら `None`）
    #[serde(default)]
    pub batch: Option<usize>,

    /// 保存時刻（ISO8601形式）
    pub saved_at: String,
}

impl SnapshotMetadata {
    /// 新しいメタデータを作成（保存時刻は現在時刻）
    pub fn new(
        version: u64,
        accuracy: f32,
        loss: f32,
        num_labels: usize,
        input_size: (u32, u32),
    ) -> Self {
        Self {
            version,
            accuracy,
            loss,
            num_labels,
            input_width: input_size.0,
            input_height: input_size.1,
            epoch: 0,
            batch: None,
            saved_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with_progress(mut self, epoch: usize, batch: Option<usize>) -> Self {
        self.epoch = epoch;
        self.batch = batch;
        self
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json() {
        let metadata = SnapshotMetadata::new(3, 0.91, 0.25, 1000, (128, 96)).with_progress(1, Some(40));
        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"version\": 3"));

        let parsed = SnapshotMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.input_size(), (128, 96));
        assert!(chrono::DateTime::parse_from_rfc3339(&parsed.saved_at).is_ok());
    }

    #[test]
    fn test_metadata_without_progress_fields() {
        let json = r#"{"version":1,"accuracy":0.5,"loss":1.0,"num_labels":4,
            "input_width":32,"input_height":32,"saved_at":"2024-01-01T00:00:00+00:00"}"#;
        let parsed = SnapshotMetadata::from_json_string(json).unwrap();
        assert_eq!(parsed.epoch, 0);
        assert_eq!(parsed.batch, None);
    }
}
