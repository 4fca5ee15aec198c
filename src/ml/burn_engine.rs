//! Burn による `Classifier` 実装

use std::path::Path;

use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        activation::{log_softmax, softmax},
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;

use crate::dataset::augment::ImageBatch;
use crate::dataset::generator::Batch;
use crate::error::{VisionError, VisionResult};
use crate::ml::classifier::{BatchMetrics, Classifier, ClassifierFactory};
use crate::ml::ml_model::{VisionCnn, VisionCnnConfig};
use crate::model::model_metadata::SnapshotMetadata;
use crate::model::model_storage::{load_model_with_metadata, save_model_with_metadata};

/// CPU (NdArray) で学習するバックエンド
pub type CpuBackend = Autodiff<NdArray>;

/// GPU (WGPU) で学習するバックエンド
pub type GpuBackend = Autodiff<Wgpu>;

type StepFn<B> = Box<dyn FnMut(f64, VisionCnn<B>, GradientsParams) -> VisionCnn<B> + Send>;

fn boxed_step<B, O>(mut optimizer: O) -> StepFn<B>
where
    B: AutodiffBackend,
    O: Optimizer<VisionCnn<B>, B> + 'static,
{
    Box::new(move |lr, model, grads| optimizer.step(lr, model, grads))
}

/// NHWC の正規化済み画像を [batch, 3, height, width] のテンソルに変換
fn images_to_tensor<B: Backend>(images: &ImageBatch, device: &B::Device) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(images.data.as_slice(), device)
        .reshape([images.count, images.height, images.width, ImageBatch::CHANNELS])
        .permute([0, 3, 1, 2])
}

fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> VisionResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| VisionError::Other(anyhow::anyhow!("テンソルの取得エラー: {:?}", e)))
}

/// ロジットとone-hotターゲットから正解率を計算
pub fn accuracy(logits: &[f32], targets: &[f32], num_labels: usize) -> f32 {
    if num_labels == 0 || logits.is_empty() {
        return 0.0;
    }
    let argmax = |row: &[f32]| {
        row.iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
    };

    let rows = logits.len() / num_labels;
    let correct = logits
        .chunks(num_labels)
        .zip(targets.chunks(num_labels))
        .filter(|(logit, target)| argmax(logit) == argmax(target))
        .count();
    correct as f32 / rows as f32
}

/// Burn のCNNを使う分類器
pub struct BurnClassifier<B: AutodiffBackend> {
    model: VisionCnn<B>,
    step: StepFn<B>,
    device: B::Device,
    input_size: (u32, u32),
    num_labels: usize,
    learning_rate: f64,
}

impl<B: AutodiffBackend> std::fmt::Debug for BurnClassifier<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurnClassifier")
            .field("input_size", &self.input_size)
            .field("num_labels", &self.num_labels)
            .field("learning_rate", &self.learning_rate)
            .finish()
    }
}

impl<B: AutodiffBackend> BurnClassifier<B> {
    fn from_model(
        model: VisionCnn<B>,
        device: B::Device,
        input_size: (u32, u32),
        num_labels: usize,
        learning_rate: f64,
    ) -> Self {
        Self {
            model,
            step: boxed_step(AdamConfig::new().init::<B, VisionCnn<B>>()),
            device,
            input_size,
            num_labels,
            learning_rate,
        }
    }

    fn check_input(&self, images: &ImageBatch) -> VisionResult<()> {
        let (width, height) = self.input_size;
        if images.width != width as usize || images.height != height as usize {
            return Err(VisionError::InvalidInput(format!(
                "image batch is {}x{}, classifier expects {}x{}",
                images.width, images.height, width, height
            )));
        }
        if images.data.len() != images.count * images.image_len() {
            return Err(VisionError::InvalidInput(format!(
                "image batch has {} values for {} images",
                images.data.len(),
                images.count
            )));
        }
        Ok(())
    }

    fn check_batch(&self, batch: &Batch) -> VisionResult<()> {
        self.check_input(&batch.images)?;
        if batch.num_labels != self.num_labels
            || batch.targets.len() != batch.images.count * self.num_labels
        {
            return Err(VisionError::InvalidInput(format!(
                "targets for {} labels do not match classifier with {} labels",
                batch.num_labels, self.num_labels
            )));
        }
        Ok(())
    }

    fn targets_tensor<BB: Backend>(&self, batch: &Batch, device: &BB::Device) -> Tensor<BB, 2> {
        Tensor::<BB, 1>::from_floats(batch.targets.as_slice(), device)
            .reshape([batch.images.count, self.num_labels])
    }
}

/// 交差エントロピー（one-hotターゲット）
fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    (log_softmax(logits, 1) * targets).sum_dim(1).mean().neg()
}

impl<B: AutodiffBackend> Classifier for BurnClassifier<B> {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }

    fn predict(&self, images: &ImageBatch) -> VisionResult<Vec<Vec<f32>>> {
        self.check_input(images)?;
        if images.count == 0 {
            return Ok(Vec::new());
        }

        let model = self.model.valid();
        let device = self.device.clone();
        let tensor = images_to_tensor::<B::InnerBackend>(images, &device);
        let probabilities = softmax(model.forward(tensor), 1);
        let values = tensor_to_vec(probabilities)?;

        Ok(values
            .chunks(self.num_labels)
            .map(|row| row.to_vec())
            .collect())
    }

    fn train_batch(&mut self, batch: &Batch) -> VisionResult<BatchMetrics> {
        self.check_batch(batch)?;
        if batch.is_empty() {
            return Ok(BatchMetrics::default());
        }

        let images = images_to_tensor::<B>(&batch.images, &self.device);
        let targets = self.targets_tensor::<B>(batch, &self.device);

        let logits = self.model.forward(images);
        let loss = cross_entropy(logits.clone(), targets);
        let loss_value: f32 = loss.clone().into_scalar().elem();
        let logits = tensor_to_vec(logits.detach())?;

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = (self.step)(self.learning_rate, self.model.clone(), grads);

        Ok(BatchMetrics::new(
            loss_value,
            accuracy(&logits, &batch.targets, self.num_labels),
        ))
    }

    fn evaluate_batch(&self, batch: &Batch) -> VisionResult<BatchMetrics> {
        self.check_batch(batch)?;
        if batch.is_empty() {
            return Ok(BatchMetrics::default());
        }

        let model = self.model.valid();
        let device = self.device.clone();
        let images = images_to_tensor::<B::InnerBackend>(&batch.images, &device);
        let targets = self.targets_tensor::<B::InnerBackend>(batch, &device);

        let logits = model.forward(images);
        let loss: f32 = cross_entropy(logits.clone(), targets).into_scalar().elem();
        let logits = tensor_to_vec(logits)?;

        Ok(BatchMetrics::new(
            loss,
            accuracy(&logits, &batch.targets, self.num_labels),
        ))
    }

    fn save(&self, path: &Path, metadata: &SnapshotMetadata) -> VisionResult<()> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let model_binary = recorder
            .record(self.model.clone().into_record(), ())
            .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;
        save_model_with_metadata(path, metadata, &model_binary)?;
        Ok(())
    }
}

/// `BurnClassifier` を作るファクトリ
#[derive(Debug, Clone)]
pub struct BurnClassifierFactory<B: AutodiffBackend> {
    device: B::Device,
    input_size: (u32, u32),
    dropout: f64,
    learning_rate: f64,
}

impl<B: AutodiffBackend> BurnClassifierFactory<B> {
    pub fn new(device: B::Device, input_size: (u32, u32)) -> Self {
        Self {
            device,
            input_size,
            dropout: 0.5,
            learning_rate: 1e-3,
        }
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    fn model_config(&self, num_labels: usize, input_size: (u32, u32)) -> VisionCnnConfig {
        VisionCnnConfig::new(num_labels, input_size.0 as usize, input_size.1 as usize)
            .with_dropout(self.dropout)
    }
}

impl<B: AutodiffBackend> ClassifierFactory for BurnClassifierFactory<B> {
    type Model = BurnClassifier<B>;

    fn create(&self, num_labels: usize) -> VisionResult<Self::Model> {
        let model = self
            .model_config(num_labels, self.input_size)
            .init::<B>(&self.device)?;
        tracing::info!(
            "新しい分類器を作成しました: labels={}, input={}x{}",
            num_labels,
            self.input_size.0,
            self.input_size.1
        );
        Ok(BurnClassifier::from_model(
            model,
            self.device.clone(),
            self.input_size,
            num_labels,
            self.learning_rate,
        ))
    }

    fn load(&self, path: &Path, num_labels: usize) -> VisionResult<Self::Model> {
        let (metadata, model_binary) = load_model_with_metadata(path)?;
        if metadata.num_labels != num_labels {
            return Err(VisionError::InvalidInput(format!(
                "snapshot {} has {} labels, expected {}",
                path.display(),
                metadata.num_labels,
                num_labels
            )));
        }

        let input_size = metadata.input_size();
        let model = self.model_config(num_labels, input_size).init::<B>(&self.device)?;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, &self.device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        tracing::info!(
            "スナップショットを読み込みました: {} (v{})",
            path.display(),
            metadata.version
        );
        Ok(BurnClassifier::from_model(
            model,
            self.device.clone(),
            input_size,
            num_labels,
            self.learning_rate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArrayDevice;

    const SIZE: u32 = 24;

    fn factory() -> BurnClassifierFactory<CpuBackend> {
        BurnClassifierFactory::new(NdArrayDevice::Cpu, (SIZE, SIZE))
    }

    fn batch_of(count: usize, num_labels: usize, label: usize) -> Batch {
        let image_len = (SIZE * SIZE * 3) as usize;
        let mut targets = vec![0.0; count * num_labels];
        for i in 0..count {
            targets[i * num_labels + label] = 1.0;
        }
        Batch {
            images: ImageBatch {
                data: (0..count * image_len).map(|i| (i % 7) as f32 / 7.0 - 0.5).collect(),
                count,
                height: SIZE as usize,
                width: SIZE as usize,
            },
            targets,
            num_labels,
        }
    }

    #[test]
    fn test_accuracy() {
        let logits = [0.1, 0.9, 0.8, 0.2];
        let targets = [0.0, 1.0, 0.0, 1.0];
        assert_eq!(accuracy(&logits, &targets, 2), 0.5);
        assert_eq!(accuracy(&[], &[], 2), 0.0);
    }

    #[test]
    fn test_rejects_too_small_input() {
        let factory = BurnClassifierFactory::<CpuBackend>::new(NdArrayDevice::Cpu, (8, 8));
        assert!(factory.create(3).is_err());
    }

    #[test]
    fn test_predict_returns_probabilities() {
        let classifier = factory().create(5).unwrap();
        let batch = batch_of(2, 5, 0);

        let probabilities = classifier.predict(&batch.images).unwrap();
        assert_eq!(probabilities.len(), 2);
        for row in probabilities {
            assert_eq!(row.len(), 5);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_predict_rejects_wrong_size() {
        let classifier = factory().create(3).unwrap();
        let image = image::RgbImage::new(SIZE + 1, SIZE);
        let images = ImageBatch::from_image(&image, (SIZE + 1, SIZE));
        assert!(matches!(
            classifier.predict(&images),
            Err(VisionError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_train_batch_reports_metrics() {
        let mut classifier = factory().create(3).unwrap();
        let batch = batch_of(4, 3, 1);

        let metrics = classifier.train_batch(&batch).unwrap();
        assert!(metrics.loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));

        let evaluated = classifier.evaluate_batch(&batch).unwrap();
        assert!(evaluated.loss.is_finite());
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burn-version-1-accuracy-0.0000.tar.gz");
        let classifier = factory().create(4).unwrap();
        let metadata = SnapshotMetadata::new(1, 0.0, 0.0, 4, (SIZE, SIZE));
        classifier.save(&path, &metadata).unwrap();

        let loaded = factory().load(&path, 4).unwrap();
        assert_eq!(loaded.input_size(), (SIZE, SIZE));

        let images = batch_of(1, 4, 0).images;
        let before = classifier.predict(&images).unwrap();
        let after = loaded.predict(&images).unwrap();
        for (a, b) in before[0].iter().zip(after[0].iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        assert!(factory().load(&path, 5).is_err());
    }
}
