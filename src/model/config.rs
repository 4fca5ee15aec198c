//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデル・学習・データ拡張・検出の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::analyzer::detector::DetectorConfig;
use crate::dataset::augment::{Augmentation, DEFAULT_INPUT_SIZE};
use crate::dataset::label_codec::DEFAULT_MAX_LABELS;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// モデルディレクトリのルート（`<models_root>/<name>/{data,model}`）
    pub models_root: String,
    /// スナップショットファイル名の接頭辞
    pub snapshot_prefix: String,
    /// 分類器の入力サイズ（幅, 高さ）
    pub input_size: (u32, u32),
    /// ラベルのスロット数
    pub max_labels: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            models_root: "models".to_string(),
            snapshot_prefix: "burn".to_string(),
            input_size: DEFAULT_INPUT_SIZE,
            max_labels: DEFAULT_MAX_LABELS,
            dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// 検証データの割合
    pub validation_split: f32,
    /// 学習データ1件あたりの画像数（元画像 + 拡張画像）
    pub train_additional_images: usize,
    /// 検証データ1件あたりの画像数
    pub validation_additional_images: usize,
    /// 1エポックあたりのスナップショット保存回数
    pub snapshots_per_epoch: usize,
    /// 残すスナップショット数
    pub keep_only_latest: usize,
    /// ラベルごとの上限枚数
    pub max_per_label: Option<usize>,
    /// 上限を適用しないラベル
    pub max_per_label_exclude: Vec<String>,
    /// ランダムシード（`None` なら毎回異なる）
    pub seed: Option<u64>,
    /// エポック終了時に検証を行うか
    pub validate: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 4,
            batch_size: 32,
            learning_rate: 1e-3,
            validation_split: 0.2,
            train_additional_images: 40,
            validation_additional_images: 16,
            snapshots_per_epoch: 20,
            keep_only_latest: 5,
            max_per_label: None,
            max_per_label_exclude: Vec::new(),
            seed: None,
            validate: false,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VisionConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    pub augmentation: Augmentation,
    /// 検出設定
    pub detector: DetectorConfig,
}

impl VisionConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("vision.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: VisionConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// モデルディレクトリのパス
    pub fn model_dir(&self, name: &str) -> PathBuf {
        Path::new(&self.model.models_root).join(name)
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!(
            "モデル: root={}, prefix={}, 入力サイズ={}x{}, スロット数={}",
            self.model.models_root,
            self.model.snapshot_prefix,
            self.model.input_size.0,
            self.model.input_size.1,
            self.model.max_labels
        );
        tracing::info!(
            "学習: エポック数={}, バッチサイズ={}, 学習率={}, 検証割合={}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.validation_split
        );
        tracing::info!(
            "検出: window={}, threshold={}, background='{}'",
            self.detector.window_size,
            self.detector.threshold,
            self.detector.background_label
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VisionConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.max_labels, 1000);
        assert_eq!(config.model.snapshot_prefix, "burn");
        assert_eq!(config.training.num_epochs, 4);
        assert_eq!(config.training.keep_only_latest, 5);
        assert_eq!(config.detector.window_size, 128);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = VisionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: VisionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: VisionConfig =
            serde_json::from_str(r#"{"device_type":"Cpu","training":{"num_epochs":1}}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 1);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.augmentation, Augmentation::default());
    }

    #[test]
    fn test_load_or_default_on_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vision.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(VisionConfig::load_or_default(&path), VisionConfig::default());

        let mut config = VisionConfig::default();
        config.detector.threshold = 0.8;
        config.save(&path).unwrap();
        assert_eq!(VisionConfig::load_or_default(&path).detector.threshold, 0.8);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
