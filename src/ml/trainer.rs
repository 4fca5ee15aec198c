//! 学習の実行管理
//!
//! 同時に1つだけ学習を走らせ、進捗の参照とキャンセルを提供します。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dataset::augment::Augmentation;
use crate::dataset::example_catalog::ExampleCatalog;
use crate::dataset::generator::{DatasetSplitter, GeneratorOptions, SplitOptions};
use crate::dataset::label_codec::DEFAULT_MAX_LABELS;
use crate::error::{VisionError, VisionResult};
use crate::ml::classifier::{Classifier, ClassifierFactory};
use crate::ml::inference::VisionModel;
use crate::ml::training::{
    fit, publish_status, read_status, MetricsLogObserver, SharedStatus, SnapshotObserver,
    StatusObserver, TrainingObserver, TrainingReport, TrainingState, TrainingStatus,
};
use crate::model::config::VisionConfig;
use crate::model::version_store::{ModelVersionStore, DEFAULT_PREFIX};

/// 学習の設定
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerOptions {
    pub snapshot_prefix: String,
    pub max_labels: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f32,
    pub train_additional_images: usize,
    pub validation_additional_images: usize,
    pub snapshots_per_epoch: usize,
    pub keep_only_latest: usize,
    pub max_per_label: Option<usize>,
    pub max_per_label_exclude: Vec<String>,
    pub seed: Option<u64>,
    pub validate: bool,
    pub augmentation: Augmentation,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            snapshot_prefix: DEFAULT_PREFIX.to_string(),
            max_labels: DEFAULT_MAX_LABELS,
            epochs: 4,
            batch_size: 32,
            validation_split: 0.2,
            train_additional_images: 40,
            validation_additional_images: 16,
            snapshots_per_epoch: 20,
            keep_only_latest: 5,
            max_per_label: None,
            max_per_label_exclude: Vec::new(),
            seed: None,
            validate: false,
            augmentation: Augmentation::default(),
        }
    }
}

impl TrainerOptions {
    pub fn from_config(config: &VisionConfig) -> Self {
        let training = &config.training;
        Self {
            snapshot_prefix: config.model.snapshot_prefix.clone(),
            max_labels: config.model.max_labels,
            epochs: training.num_epochs,
            batch_size: training.batch_size,
            validation_split: training.validation_split,
            train_additional_images: training.train_additional_images,
            validation_additional_images: training.validation_additional_images,
            snapshots_per_epoch: training.snapshots_per_epoch,
            keep_only_latest: training.keep_only_latest,
            max_per_label: training.max_per_label,
            max_per_label_exclude: training.max_per_label_exclude.clone(),
            seed: training.seed,
            validate: training.validate,
            augmentation: config.augmentation.clone(),
        }
    }

    fn generator_options(&self, additional_images: usize, input_size: (u32, u32), offset: u64) -> GeneratorOptions {
        GeneratorOptions {
            batch_size: self.batch_size,
            additional_images,
            shuffle: true,
            input_size,
            augmentation: self.augmentation.clone(),
            seed: self.seed.map(|seed| seed.wrapping_add(offset)),
        }
    }
}

/// `start_training` の結果
#[derive(Debug)]
pub enum StartOutcome {
    Started(TrainingSession),
    /// 既に学習中（エラーではない）
    AlreadyRunning,
}

impl StartOutcome {
    pub fn into_session(self) -> Option<TrainingSession> {
        match self {
            StartOutcome::Started(session) => Some(session),
            StartOutcome::AlreadyRunning => None,
        }
    }
}

/// 実行中の学習
#[derive(Debug)]
pub struct TrainingSession {
    id: Uuid,
    cancel: Arc<AtomicBool>,
    status: SharedStatus,
    handle: JoinHandle<VisionResult<TrainingReport>>,
}

impl TrainingSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// キャンセルを要求（次のバッチの開始前に止まる）
    pub fn cancel(&self) {
        tracing::info!("学習のキャンセルを要求しました: {}", self.id);
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// 進捗のコピー
    pub fn status(&self) -> TrainingStatus {
        read_status(&self.status)
    }

    /// 終了を待つ
    pub async fn wait(self) -> VisionResult<TrainingReport> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(VisionError::Other(anyhow::anyhow!(
                "training worker {} aborted: {}",
                self.id,
                e
            ))),
        }
    }
}

/// 実行中フラグを落とす
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 学習の実行管理
pub struct VisionModelTrainer<F> {
    model_path: PathBuf,
    factory: F,
    options: TrainerOptions,
    running: Arc<AtomicBool>,
}

impl<F> VisionModelTrainer<F>
where
    F: ClassifierFactory + Clone + 'static,
{
    pub fn new<P: Into<PathBuf>>(model_path: P, factory: F, options: TrainerOptions) -> Self {
        Self {
            model_path: model_path.into(),
            factory,
            options,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn options(&self) -> &TrainerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 学習を開始する（tokioランタイム上で呼ぶこと）
    ///
    /// 既に学習中なら `StartOutcome::AlreadyRunning` を返します。
    pub fn start_training(
        &self,
        examples: ExampleCatalog,
        extra_observers: Vec<Box<dyn TrainingObserver>>,
    ) -> StartOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("学習は既に実行中です");
            return StartOutcome::AlreadyRunning;
        }
        let guard = RunningGuard(self.running.clone());

        let id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let status: SharedStatus = Arc::default();
        publish_status(
            &status,
            TrainingStatus {
                state: TrainingState::Running,
                epochs: self.options.epochs,
                ..TrainingStatus::default()
            },
        );

        let worker = Worker {
            id,
            model_path: self.model_path.clone(),
            factory: self.factory.clone(),
            options: self.options.clone(),
            cancel: cancel.clone(),
            status: status.clone(),
        };

        tracing::info!("学習を開始します: {} ({})", id, self.model_path.display());
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let status = worker.status.clone();
            let result = worker.run(examples, extra_observers);
            if let Err(e) = &result {
                tracing::error!("学習に失敗しました: {}", e);
                let mut failed = read_status(&status);
                failed.state = TrainingState::Failed;
                failed.message = Some(e.to_string());
                publish_status(&status, failed);
            }
            result
        });

        StartOutcome::Started(TrainingSession {
            id,
            cancel,
            status,
            handle,
        })
    }
}

/// 学習スレッドで動く処理
struct Worker<F> {
    id: Uuid,
    model_path: PathBuf,
    factory: F,
    options: TrainerOptions,
    cancel: Arc<AtomicBool>,
    status: SharedStatus,
}

impl<F: ClassifierFactory> Worker<F> {
    fn run(
        self,
        examples: ExampleCatalog,
        extra_observers: Vec<Box<dyn TrainingObserver>>,
    ) -> VisionResult<TrainingReport> {
        let options = &self.options;
        let mut vision = VisionModel::open_with(
            &self.model_path,
            &options.snapshot_prefix,
            options.max_labels,
            self.factory,
        )?;

        for label in examples.labels() {
            vision.labels_mut().add_label(label)?;
        }
        vision.persist_labels()?;
        tracing::info!("[{}] ラベル数: {}", self.id, vision.labels().len());

        let splitter = DatasetSplitter::new(
            &examples,
            vision.labels(),
            &SplitOptions {
                validation_split: options.validation_split,
                shuffle: true,
                max_per_label: options.max_per_label,
                max_per_label_exclude: options.max_per_label_exclude.clone(),
                seed: options.seed,
            },
        );

        let mut classifier = match vision.take_classifier() {
            Some(classifier) => classifier,
            None => vision.factory().create(vision.labels().capacity())?,
        };
        let input_size = classifier.input_size();

        let mut train = splitter.training_generator(options.generator_options(
            options.train_additional_images,
            input_size,
            1,
        ))?;
        let mut validation = if options.validate {
            Some(splitter.validation_generator(options.generator_options(
                options.validation_additional_images,
                input_size,
                2,
            ))?)
        } else {
            None
        };

        let store = Arc::new(ModelVersionStore::new(
            &self.model_path,
            &options.snapshot_prefix,
        )?);
        let mut observers: Vec<Box<dyn TrainingObserver>> = vec![
            Box::new(
                SnapshotObserver::new(store, options.keep_only_latest)
                    .with_snapshots_per_epoch(train.len(), options.snapshots_per_epoch),
            ),
            Box::new(StatusObserver::new(self.status.clone())),
            Box::new(MetricsLogObserver::new(10)),
        ];
        observers.extend(extra_observers);

        fit(
            &mut classifier,
            &mut train,
            validation.as_mut(),
            options.epochs,
            &mut observers,
            &self.cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::example_catalog::DEFAULT_SUFFIXES;
    use crate::dataset::label_codec::LabelCodec;
    use crate::ml::classifier::testing::ScriptedFactory;
    use crate::model::version_store::scan_snapshots;
    use image::{Rgb, RgbImage};
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn write_examples(root: &Path, labels: &[&str], per_label: usize) -> ExampleCatalog {
        for (n, label) in labels.iter().enumerate() {
            let dir = root.join(label);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_label {
                RgbImage::from_pixel(12, 12, Rgb([(n * 80) as u8, i as u8, 90]))
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
        ExampleCatalog::build_from_directory(root, &DEFAULT_SUFFIXES, None, false).unwrap()
    }

    fn options() -> TrainerOptions {
        TrainerOptions {
            max_labels: 8,
            epochs: 1,
            batch_size: 2,
            train_additional_images: 2,
            validation_additional_images: 1,
            seed: Some(7),
            ..Default::default()
        }
    }

    /// `on_train_begin` で解放されるまで待つオブザーバ
    struct Gate(Mutex<mpsc::Receiver<()>>);

    impl TrainingObserver for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn on_train_begin(&mut self, _plan: &crate::ml::training::TrainingPlan) -> anyhow::Result<()> {
            let _ = self.0.lock().unwrap().recv();
            Ok(())
        }
    }

    fn gate() -> (mpsc::Sender<()>, Box<dyn TrainingObserver>) {
        let (tx, rx) = mpsc::channel();
        (tx, Box::new(Gate(Mutex::new(rx))))
    }

    #[tokio::test]
    async fn test_training_saves_labels_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = write_examples(&dir.path().join("data"), &["apple", "banana"], 5);
        let model_path = dir.path().join("model");
        let trainer = VisionModelTrainer::new(&model_path, ScriptedFactory::new((8, 8)), options());

        let session = trainer.start_training(catalog, Vec::new()).into_session().unwrap();
        let report = session.wait().await.unwrap();
        assert_eq!(report.epochs_completed, 1);
        // 10件中2件が検証用、学習8件でバッチ4つ
        assert_eq!(report.batches_completed, 4);
        assert!(!trainer.is_running());

        let labels = LabelCodec::load(model_path.join("labels.txt")).unwrap();
        assert_eq!(labels.encode("apple").unwrap(), 0);
        assert_eq!(labels.encode("banana").unwrap(), 1);
        assert_eq!(scan_snapshots(&model_path, "burn").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = write_examples(&dir.path().join("data"), &["apple"], 4);
        let trainer = VisionModelTrainer::new(dir.path().join("model"), ScriptedFactory::new((8, 8)), options());

        let (release, gate) = gate();
        let session = trainer
            .start_training(catalog.clone(), vec![gate])
            .into_session()
            .unwrap();
        assert!(trainer.is_running());
        assert!(matches!(
            trainer.start_training(catalog.clone(), Vec::new()),
            StartOutcome::AlreadyRunning
        ));

        release.send(()).unwrap();
        let first_id = session.id();
        session.wait().await.unwrap();

        let second = trainer.start_training(catalog, Vec::new()).into_session().unwrap();
        assert_ne!(second.id(), first_id);
        second.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_before_first_batch() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = write_examples(&dir.path().join("data"), &["apple"], 6);
        let trainer = VisionModelTrainer::new(dir.path().join("model"), ScriptedFactory::new((8, 8)), options());

        let (release, gate) = gate();
        let session = trainer.start_training(catalog, vec![gate]).into_session().unwrap();
        session.cancel();
        assert!(session.is_cancelled());
        release.send(()).unwrap();

        let status = session.status.clone();
        let report = session.wait().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.batches_completed, 0);
        assert_eq!(read_status(&status).state, TrainingState::Cancelled);
    }

    #[tokio::test]
    async fn test_failure_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = VisionModelTrainer::new(dir.path().join("model"), ScriptedFactory::new((8, 8)), options());

        let session = trainer
            .start_training(ExampleCatalog::default(), Vec::new())
            .into_session()
            .unwrap();
        let status = session.status.clone();
        assert!(session.wait().await.is_err());
        assert!(!trainer.is_running());

        let failed = read_status(&status);
        assert_eq!(failed.state, TrainingState::Failed);
        assert!(failed.message.is_some());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = VisionConfig::default();
        config.training.num_epochs = 9;
        config.model.snapshot_prefix = "cnn".to_string();
        let options = TrainerOptions::from_config(&config);
        assert_eq!(options.epochs, 9);
        assert_eq!(options.snapshot_prefix, "cnn");
        assert_eq!(options.train_additional_images, 40);
    }
}
