//! 分類器の抽象
//!
//! 学習・推論・検出はすべてこのトレイト越しに分類器を扱います。
//! 具体的な実装は `burn_engine`（feature `ml`）にあります。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dataset::augment::ImageBatch;
use crate::dataset::generator::Batch;
use crate::error::VisionResult;
use crate::model::model_metadata::SnapshotMetadata;

/// 1バッチ分の評価値
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

impl BatchMetrics {
    pub fn new(loss: f32, accuracy: f32) -> Self {
        Self { loss, accuracy }
    }

    /// 複数バッチの平均（空なら `None`）
    pub fn mean(metrics: &[BatchMetrics]) -> Option<BatchMetrics> {
        if metrics.is_empty() {
            return None;
        }
        let n = metrics.len() as f32;
        Some(BatchMetrics {
            loss: metrics.iter().map(|m| m.loss).sum::<f32>() / n,
            accuracy: metrics.iter().map(|m| m.accuracy).sum::<f32>() / n,
        })
    }
}

/// 画像分類器
pub trait Classifier: Send {
    /// 入力サイズ（幅, 高さ）
    fn input_size(&self) -> (u32, u32);

    /// 出力次元（ラベルのスロット数）
    fn num_labels(&self) -> usize;

    /// 画像ごとに全スロットの確率を返す
    fn predict(&self, images: &ImageBatch) -> VisionResult<Vec<Vec<f32>>>;

    /// 1バッチ分の学習
    fn train_batch(&mut self, batch: &Batch) -> VisionResult<BatchMetrics>;

    /// 1バッチ分の評価（重みは更新しない）
    fn evaluate_batch(&self, batch: &Batch) -> VisionResult<BatchMetrics>;

    /// スナップショットとして保存
    fn save(&self, path: &Path, metadata: &SnapshotMetadata) -> VisionResult<()>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn input_size(&self) -> (u32, u32) {
        (**self).input_size()
    }

    fn num_labels(&self) -> usize {
        (**self).num_labels()
    }

    fn predict(&self, images: &ImageBatch) -> VisionResult<Vec<Vec<f32>>> {
        (**self).predict(images)
    }

    fn train_batch(&mut self, batch: &Batch) -> VisionResult<BatchMetrics> {
        (**self).train_batch(batch)
    }

    fn evaluate_batch(&self, batch: &Batch) -> VisionResult<BatchMetrics> {
        (**self).evaluate_batch(batch)
    }

    fn save(&self, path: &Path, metadata: &SnapshotMetadata) -> VisionResult<()> {
        (**self).save(path, metadata)
    }
}

/// 分類器の生成・読み込み
pub trait ClassifierFactory: Send + Sync {
    type Model: Classifier + 'static;

    /// 未学習の分類器を作成
    fn create(&self, num_labels: usize) -> VisionResult<Self::Model>;

    /// スナップショットから読み込む
    fn load(&self, path: &Path, num_labels: usize) -> VisionResult<Self::Model>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_metrics() {
        assert_eq!(BatchMetrics::mean(&[]), None);
        let mean = BatchMetrics::mean(&[BatchMetrics::new(1.0, 0.5), BatchMetrics::new(0.0, 1.0)])
            .unwrap();
        assert_eq!(mean, BatchMetrics::new(0.5, 0.75));
    }
}
