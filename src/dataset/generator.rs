//! 学習用データの分割とバッチ生成
//!
//! `DatasetSplitter` がデータ一覧を学習用・検証用に分割し、
//! `BatchGenerator` が画像の読み込み・データ拡張・正規化・one-hot化を行います。

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::augment::{load_rgb_image, Augmentation, ImageBatch, DEFAULT_INPUT_SIZE};
use crate::dataset::example_catalog::{Example, ExampleCatalog};
use crate::dataset::label_codec::LabelCodec;
use crate::error::{VisionError, VisionResult};

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// 分割の設定
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOptions {
    /// 検証用に回す割合（先頭から）
    pub validation_split: f32,
    pub shuffle: bool,
    /// ラベルごとの上限枚数
    pub max_per_label: Option<usize>,
    /// 上限を適用しないラベル
    pub max_per_label_exclude: Vec<String>,
    /// シャッフルのシード（`None` なら毎回異なる）
    pub seed: Option<u64>,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            validation_split: 0.0,
            shuffle: true,
            max_per_label: None,
            max_per_label_exclude: Vec::new(),
            seed: None,
        }
    }
}

/// 学習用・検証用への分割結果
#[derive(Debug, Clone)]
pub struct DatasetSplitter {
    codec: LabelCodec,
    dataset: Vec<Example>,
    training: Vec<Example>,
    validation: Vec<Example>,
}

impl DatasetSplitter {
    pub fn new(catalog: &ExampleCatalog, codec: &LabelCodec, options: &SplitOptions) -> Self {
        let mut rng = make_rng(options.seed);

        // コーデックに登録済みのラベルだけを使う
        let mut dataset: Vec<Example> = catalog
            .iter()
            .filter(|example| codec.contains(&example.label))
            .cloned()
            .collect();

        if options.shuffle {
            dataset.shuffle(&mut rng);
        }

        let mut groups: Vec<(String, Vec<Example>)> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        for example in &dataset {
            let index = *group_index.entry(example.label.clone()).or_insert_with(|| {
                groups.push((example.label.clone(), Vec::new()));
                groups.len() - 1
            });
            groups[index].1.push(example.clone());
        }

        if let Some(max_per_label) = options.max_per_label {
            for (label, examples) in groups.iter_mut() {
                if !options.max_per_label_exclude.contains(label) {
                    examples.truncate(max_per_label);
                }
            }

            dataset = groups
                .iter()
                .flat_map(|(_, examples)| examples.iter().cloned())
                .collect();

            if options.shuffle {
                dataset.shuffle(&mut rng);
            }
        }

        let split_at = ((dataset.len() as f64 * options.validation_split as f64).floor() as usize)
            .min(dataset.len());
        let validation = dataset[..split_at].to_vec();
        let training = dataset[split_at..].to_vec();

        for (label, examples) in &groups {
            tracing::debug!(" '{}' - image count: {}", label, examples.len());
        }
        tracing::info!(
            "データ分割: 学習 {} 件 / 検証 {} 件",
            training.len(),
            validation.len()
        );

        Self {
            codec: codec.clone(),
            dataset,
            training,
            validation,
        }
    }

    /// 上限適用・シャッフル後の全データ
    pub fn dataset(&self) -> &[Example] {
        &self.dataset
    }

    pub fn training(&self) -> &[Example] {
        &self.training
    }

    pub fn validation(&self) -> &[Example] {
        &self.validation
    }

    pub fn training_generator(&self, options: GeneratorOptions) -> VisionResult<BatchGenerator> {
        BatchGenerator::new("training", &self.training, &self.codec, options)
    }

    pub fn validation_generator(&self, options: GeneratorOptions) -> VisionResult<BatchGenerator> {
        BatchGenerator::new("validation", &self.validation, &self.codec, options)
    }
}

/// バッチ生成の設定
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorOptions {
    pub batch_size: usize,
    /// 1件あたりの画像数（1なら元画像のみ、n なら元画像 + 拡張画像 n-1 枚）
    pub additional_images: usize,
    /// エポック終了時に並び替えるか
    pub shuffle: bool,
    /// 分類器の入力サイズ（幅, 高さ）
    pub input_size: (u32, u32),
    pub augmentation: Augmentation,
    pub seed: Option<u64>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            additional_images: 1,
            shuffle: true,
            input_size: DEFAULT_INPUT_SIZE,
            augmentation: Augmentation::default(),
            seed: None,
        }
    }
}

/// 学習用バッチ（画像 + one-hotターゲット）
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: ImageBatch,
    /// `images.count × num_labels`
    pub targets: Vec<f32>,
    pub num_labels: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.count
    }

    pub fn is_empty(&self) -> bool {
        self.images.count == 0
    }

    pub fn target(&self, index: usize) -> &[f32] {
        &self.targets[index * self.num_labels..(index + 1) * self.num_labels]
    }

    /// one-hotターゲットのクラス番号
    pub fn target_index(&self, index: usize) -> Option<usize> {
        self.target(index).iter().position(|&v| v == 1.0)
    }
}

/// エポック単位でバッチを生成する
#[derive(Debug)]
pub struct BatchGenerator {
    name: String,
    items: Vec<(Example, usize)>,
    num_labels: usize,
    options: GeneratorOptions,
    rng: StdRng,
}

impl BatchGenerator {
    pub fn new(
        name: &str,
        examples: &[Example],
        codec: &LabelCodec,
        options: GeneratorOptions,
    ) -> VisionResult<Self> {
        if options.batch_size == 0 {
            return Err(VisionError::InvalidInput("batch_size must be >= 1".to_string()));
        }
        if options.additional_images == 0 {
            return Err(VisionError::InvalidInput(
                "additional_images must be >= 1".to_string(),
            ));
        }

        let items = examples
            .iter()
            .map(|example| Ok((example.clone(), codec.encode(&example.label)?)))
            .collect::<VisionResult<Vec<_>>>()?;

        let generator = Self {
            name: name.to_string(),
            items,
            num_labels: codec.capacity(),
            rng: make_rng(options.seed),
            options,
        };

        tracing::debug!(
            "BatchGenerator {}: batch count {}, batch size {}, images per example {}",
            generator.name,
            generator.len(),
            generator.options.batch_size,
            generator.options.additional_images
        );
        Ok(generator)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// バッチ数（端数は捨てる）
    pub fn len(&self) -> usize {
        self.items.len() / self.options.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn example_count(&self) -> usize {
        self.items.len()
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// 1バッチあたりの画像数
    pub fn images_per_batch(&self) -> usize {
        self.options.batch_size * self.options.additional_images
    }

    pub fn examples(&self) -> impl Iterator<Item = &Example> {
        self.items.iter().map(|(example, _)| example)
    }

    /// `index` 番目のバッチを生成
    pub fn batch(&mut self, index: usize) -> VisionResult<Batch> {
        let len = self.len();
        if index >= len {
            return Err(VisionError::IndexOutOfRange { index, len });
        }

        let (width, height) = self.options.input_size;
        let mut images =
            ImageBatch::with_capacity(self.images_per_batch(), width as usize, height as usize);
        let mut targets = Vec::with_capacity(self.images_per_batch() * self.num_labels);

        let start = index * self.options.batch_size;
        for item in start..start + self.options.batch_size {
            let (example, label_index) = &self.items[item];
            let original = load_rgb_image(&example.path)?;

            for variant in 0..self.options.additional_images {
                if variant == 0 {
                    images.push_image(&original);
                } else {
                    let augmented = self.options.augmentation.apply(&original, &mut self.rng);
                    images.push_image(&augmented);
                }

                let offset = targets.len();
                targets.resize(offset + self.num_labels, 0.0);
                targets[offset + label_index] = 1.0;
            }
        }

        Ok(Batch {
            images,
            targets,
            num_labels: self.num_labels,
        })
    }

    /// エポック終了時の処理（シャッフル有効なら並び替え）
    pub fn on_epoch_end(&mut self) {
        tracing::debug!(
            "BatchGenerator {} - epoch ended. shuffle = {}",
            self.name,
            self.options.shuffle
        );
        if self.options.shuffle {
            self.items.shuffle(&mut self.rng);
        }
    }
}
