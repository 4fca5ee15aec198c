//! 分類器のファサード
//!
//! モデルディレクトリ（ラベル表 + スナップショット）を1つの推論エンジンとして扱います。

use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::dataset::augment::{load_rgb_image, ImageBatch};
use crate::dataset::label_codec::{LabelCodec, DEFAULT_MAX_LABELS};
use crate::error::{VisionError, VisionResult};
use crate::ml::classifier::{Classifier, ClassifierFactory};
use crate::model::layout::LABELS_FILE;
use crate::model::version_store::{ModelVersionStore, DEFAULT_PREFIX};

/// 1スロット分の予測結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedItem {
    /// ラベル（空きスロットは `None`）
    pub label: Option<String>,
    pub index: usize,
    pub probability: f32,
}

/// 確率の降順に並べる（同率ならスロット番号の昇順）
pub fn rank_predictions(labels: &LabelCodec, scores: &[f32]) -> Vec<PredictedItem> {
    let mut items: Vec<PredictedItem> = scores
        .iter()
        .enumerate()
        .map(|(index, &probability)| PredictedItem {
            label: labels.decode(index).map(str::to_string),
            index,
            probability,
        })
        .collect();
    // 安定ソートなので同率はスロット順のまま
    items.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    items
}

/// 推論エンジン
pub struct VisionModel<F: ClassifierFactory> {
    model_path: PathBuf,
    labels: LabelCodec,
    store: ModelVersionStore,
    factory: F,
    classifier: Option<F::Model>,
}

impl<F: ClassifierFactory> std::fmt::Debug for VisionModel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionModel")
            .field("model_path", &self.model_path)
            .field("labels", &self.labels.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<F: ClassifierFactory> VisionModel<F> {
    /// モデルディレクトリを開く（接頭辞・スロット数はデフォルト）
    pub fn open<P: AsRef<Path>>(model_path: P, factory: F) -> VisionResult<Self> {
        Self::open_with(model_path, DEFAULT_PREFIX, DEFAULT_MAX_LABELS, factory)
    }

    /// モデルディレクトリを開く
    ///
    /// - ラベル表が無い・壊れている場合は空の表を作成して保存
    /// - スナップショットが無い場合は未学習状態（`is_ready() == false`）
    pub fn open_with<P: AsRef<Path>>(
        model_path: P,
        prefix: &str,
        max_labels: usize,
        factory: F,
    ) -> VisionResult<Self> {
        let model_path = model_path.as_ref().to_path_buf();
        let labels_path = model_path.join(LABELS_FILE);

        let labels = match LabelCodec::load(&labels_path) {
            Some(labels) => labels,
            None => {
                tracing::info!("ラベル表を新規作成します: {}", labels_path.display());
                std::fs::create_dir_all(&model_path)?;
                let labels = LabelCodec::new(max_labels);
                labels.save(&labels_path)?;
                labels
            }
        };

        let mut model = Self {
            store: ModelVersionStore::new(&model_path, prefix)?,
            model_path,
            labels,
            factory,
            classifier: None,
        };
        model.reload_classifier()?;
        Ok(model)
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn labels_path(&self) -> PathBuf {
        self.model_path.join(LABELS_FILE)
    }

    pub fn labels(&self) -> &LabelCodec {
        &self.labels
    }

    pub fn labels_mut(&mut self) -> &mut LabelCodec {
        &mut self.labels
    }

    /// ラベル表を保存
    pub fn persist_labels(&self) -> VisionResult<()> {
        self.labels.save(self.labels_path())
    }

    pub fn store(&self) -> &ModelVersionStore {
        &self.store
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn is_ready(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn classifier(&self) -> Option<&F::Model> {
        self.classifier.as_ref()
    }

    /// 分類器を取り出す（未学習なら `None`）
    pub fn take_classifier(&mut self) -> Option<F::Model> {
        self.classifier.take()
    }

    /// 最新のスナップショットを読み直す
    ///
    /// 読み込めないスナップショットは警告を出して1つ古いものを試し、
    /// どれも読めなければ未学習状態になります。
    pub fn reload_classifier(&mut self) -> VisionResult<()> {
        self.store.invalidate();
        self.classifier = None;

        let entries = self.store.scan()?;
        if entries.is_empty() {
            tracing::info!(
                "スナップショットがありません。未学習状態です: {}",
                self.model_path.display()
            );
            return Ok(());
        }

        for entry in &entries {
            match self.factory.load(&entry.path, self.labels.capacity()) {
                Ok(classifier) => {
                    tracing::info!("スナップショットを読み込みました: {}", entry.path.display());
                    self.classifier = Some(classifier);
                    return Ok(());
                }
                Err(e) => tracing::warn!(
                    "スナップショットを読み込めません {}: {}",
                    entry.path.display(),
                    e
                ),
            }
        }

        tracing::warn!(
            "読み込めるスナップショットがありません。未学習状態です: {}",
            self.model_path.display()
        );
        Ok(())
    }

    /// 分類器を差し替える
    pub fn set_classifier(&mut self, classifier: F::Model) -> VisionResult<()> {
        if classifier.num_labels() != self.labels.capacity() {
            return Err(VisionError::InvalidInput(format!(
                "classifier has {} outputs, label table has {} slots",
                classifier.num_labels(),
                self.labels.capacity()
            )));
        }
        self.classifier = Some(classifier);
        Ok(())
    }

    /// 分類器の入力サイズ
    pub fn input_size(&self) -> VisionResult<(u32, u32)> {
        self.classifier
            .as_ref()
            .map(Classifier::input_size)
            .ok_or(VisionError::ModelNotReady)
    }

    /// 画像ごとに全スロットの予測結果を返す
    pub fn predict(&self, images: &ImageBatch) -> VisionResult<Vec<Vec<PredictedItem>>> {
        let classifier = self.classifier.as_ref().ok_or(VisionError::ModelNotReady)?;
        let scores = classifier.predict(images)?;
        Ok(scores
            .iter()
            .map(|row| rank_predictions(&self.labels, row))
            .collect())
    }

    /// 1枚の画像を分類（入力サイズにリサイズ・正規化して推論）
    pub fn predict_image(&self, image: &RgbImage) -> VisionResult<Vec<PredictedItem>> {
        let images = ImageBatch::from_image(image, self.input_size()?);
        self.predict(&images)?
            .into_iter()
            .next()
            .ok_or_else(|| VisionError::InvalidInput("classifier returned no prediction".to_string()))
    }

    /// 画像ファイルを分類
    pub fn predict_from_file<P: AsRef<Path>>(&self, path: P) -> VisionResult<Vec<PredictedItem>> {
        let image = load_rgb_image(path.as_ref())?;
        self.predict_image(&image)
    }
}
