//! 学習ループとオブザーバ
//!
//! `fit` がエポック・バッチ単位で分類器を学習し、各タイミングで
//! 登録されたオブザーバ（スナップショット保存・進捗・ログ）を順に呼び出します。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::dataset::generator::BatchGenerator;
use crate::error::{VisionError, VisionResult};
use crate::ml::classifier::{BatchMetrics, Classifier};
use crate::model::version_store::ModelVersionStore;

/// 学習の概要（開始時に通知）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub epochs: usize,
    pub batches_per_epoch: usize,
    pub training_examples: usize,
    pub validation_examples: usize,
}

/// バッチ終了イベント（`epoch`, `batch` は0始まり）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchEnd {
    pub epoch: usize,
    pub batch: usize,
    pub batches: usize,
    pub metrics: BatchMetrics,
    pub duration: Duration,
}

/// エポック終了イベント
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochEnd {
    pub epoch: usize,
    pub epochs: usize,
    /// 学習バッチの平均
    pub metrics: Option<BatchMetrics>,
    /// 検証バッチの平均（検証なしなら `None`）
    pub validation: Option<BatchMetrics>,
}

/// 学習結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs_completed: usize,
    pub batches_completed: usize,
    pub cancelled: bool,
    pub last_metrics: Option<BatchMetrics>,
    pub last_validation: Option<BatchMetrics>,
}

/// 学習中のイベントを受け取る
///
/// エラーはログに出して無視されます。`is_fatal()` が真のオブザーバのエラーだけが学習を中断します。
pub trait TrainingObserver: Send {
    fn name(&self) -> &str;

    fn is_fatal(&self) -> bool {
        false
    }

    fn on_train_begin(&mut self, _plan: &TrainingPlan) -> Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_batch_begin(&mut self, _epoch: usize, _batch: usize) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, _event: &BatchEnd, _model: &dyn Classifier) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _event: &EpochEnd, _model: &dyn Classifier) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _report: &TrainingReport) -> Result<()> {
        Ok(())
    }
}

fn notify<F>(observers: &mut [Box<dyn TrainingObserver>], mut event: F) -> VisionResult<()>
where
    F: FnMut(&mut (dyn TrainingObserver + 'static)) -> Result<()>,
{
    for observer in observers.iter_mut() {
        if let Err(e) = event(observer.as_mut()) {
            if observer.is_fatal() {
                let name = observer.name().to_string();
                return Err(VisionError::Other(e.context(format!("observer '{}' failed", name))));
            }
            tracing::warn!("オブザーバ '{}' でエラーが発生しました: {:#}", observer.name(), e);
        }
    }
    Ok(())
}

/// 学習を実行
///
/// キャンセルはバッチの開始前に確認され、確認された時点でループを抜けます。
pub fn fit<C: Classifier>(
    model: &mut C,
    train: &mut BatchGenerator,
    mut validation: Option<&mut BatchGenerator>,
    epochs: usize,
    observers: &mut [Box<dyn TrainingObserver>],
    cancel: &AtomicBool,
) -> VisionResult<TrainingReport> {
    let batches = train.len();
    if batches == 0 {
        return Err(VisionError::InvalidInput(format!(
            "not enough training examples ({}) for one batch",
            train.example_count()
        )));
    }

    let plan = TrainingPlan {
        epochs,
        batches_per_epoch: batches,
        training_examples: train.example_count(),
        validation_examples: validation.as_ref().map(|v| v.example_count()).unwrap_or(0),
    };
    notify(observers, |o| o.on_train_begin(&plan))?;

    let mut report = TrainingReport::default();

    'epochs: for epoch in 0..epochs {
        notify(observers, |o| o.on_epoch_begin(epoch))?;
        let mut epoch_metrics = Vec::with_capacity(batches);

        for batch_index in 0..batches {
            if cancel.load(Ordering::SeqCst) {
                tracing::info!("学習がキャンセルされました (epoch {}, batch {})", epoch + 1, batch_index);
                report.cancelled = true;
                break 'epochs;
            }

            notify(observers, |o| o.on_batch_begin(epoch, batch_index))?;
            let started = Instant::now();
            let batch = train.batch(batch_index)?;
            let metrics = model.train_batch(&batch)?;
            let event = BatchEnd {
                epoch,
                batch: batch_index,
                batches,
                metrics,
                duration: started.elapsed(),
            };

            report.batches_completed += 1;
            report.last_metrics = Some(metrics);
            epoch_metrics.push(metrics);
            notify(observers, |o| o.on_batch_end(&event, &*model))?;
        }

        let validation_metrics = match validation.as_deref_mut() {
            Some(generator) if !generator.is_empty() => {
                let mut metrics = Vec::with_capacity(generator.len());
                for batch_index in 0..generator.len() {
                    let batch = generator.batch(batch_index)?;
                    metrics.push(model.evaluate_batch(&batch)?);
                }
                generator.on_epoch_end();
                BatchMetrics::mean(&metrics)
            }
            _ => None,
        };
        report.last_validation = validation_metrics;

        let event = EpochEnd {
            epoch,
            epochs,
            metrics: BatchMetrics::mean(&epoch_metrics),
            validation: validation_metrics,
        };
        notify(observers, |o| o.on_epoch_end(&event, &*model))?;
        train.on_epoch_end();
        report.epochs_completed += 1;
    }

    notify(observers, |o| o.on_train_end(&report))?;
    Ok(report)
}

/// 学習の状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// 進捗のスナップショット（`epoch`, `batch` は1始まり）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub state: TrainingState,
    pub epochs: usize,
    pub epoch: usize,
    pub batch: usize,
    pub batches: usize,
    /// 直近のバッチ処理時間の平均（秒）
    pub average_batch_seconds: f64,
    /// エポック終了までの残り時間（秒）
    pub eta_seconds: u64,
    /// `HH:MM:SS` 形式の残り時間
    pub eta: String,
    pub loss: Option<f32>,
    pub accuracy: Option<f32>,
    pub message: Option<String>,
}

impl Default for TrainingStatus {
    fn default() -> Self {
        Self {
            state: TrainingState::Idle,
            epochs: 0,
            epoch: 0,
            batch: 0,
            batches: 0,
            average_batch_seconds: 0.0,
            eta_seconds: 0,
            eta: "NA".to_string(),
            loss: None,
            accuracy: None,
            message: None,
        }
    }
}

/// 秒数を `HH:MM:SS` に変換
pub fn format_eta(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// 共有の進捗状態
pub type SharedStatus = Arc<RwLock<TrainingStatus>>;

/// 状態を丸ごと差し替える
pub fn publish_status(shared: &SharedStatus, status: TrainingStatus) {
    match shared.write() {
        Ok(mut guard) => *guard = status,
        Err(poisoned) => *poisoned.into_inner() = status,
    }
}

/// 状態のコピーを取得
pub fn read_status(shared: &SharedStatus) -> TrainingStatus {
    match shared.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// 進捗状態を更新するオブザーバ
#[derive(Debug)]
pub struct StatusObserver {
    shared: SharedStatus,
    status: TrainingStatus,
    window: usize,
    durations: VecDeque<Duration>,
}

impl StatusObserver {
    /// 平均を取るバッチ数
    pub const DEFAULT_WINDOW: usize = 10;

    pub fn new(shared: SharedStatus) -> Self {
        Self {
            shared,
            status: TrainingStatus::default(),
            window: Self::DEFAULT_WINDOW,
            durations: VecDeque::with_capacity(Self::DEFAULT_WINDOW),
        }
    }

    fn publish(&self) {
        publish_status(&self.shared, self.status.clone());
    }
}

impl TrainingObserver for StatusObserver {
    fn name(&self) -> &str {
        "status"
    }

    fn on_train_begin(&mut self, plan: &TrainingPlan) -> Result<()> {
        self.status = TrainingStatus {
            state: TrainingState::Running,
            epochs: plan.epochs,
            batches: plan.batches_per_epoch,
            ..TrainingStatus::default()
        };
        self.publish();
        Ok(())
    }

    fn on_epoch_begin(&mut self, epoch: usize) -> Result<()> {
        self.durations.clear();
        self.status.epoch = epoch + 1;
        self.status.batch = 0;
        self.publish();
        Ok(())
    }

    fn on_batch_end(&mut self, event: &BatchEnd, _model: &dyn Classifier) -> Result<()> {
        if self.durations.len() == self.window {
            self.durations.pop_front();
        }
        self.durations.push_back(event.duration);

        let average = self.durations.iter().map(Duration::as_secs_f64).sum::<f64>()
            / self.durations.len() as f64;
        let remaining = event.batches.saturating_sub(event.batch + 1);
        let eta_seconds = (average * remaining as f64) as u64;

        self.status.epoch = event.epoch + 1;
        self.status.batch = event.batch + 1;
        self.status.batches = event.batches;
        self.status.average_batch_seconds = average;
        self.status.eta_seconds = eta_seconds;
        self.status.eta = format_eta(eta_seconds);
        self.status.loss = Some(event.metrics.loss);
        self.status.accuracy = Some(event.metrics.accuracy);
        self.publish();
        Ok(())
    }

    fn on_train_end(&mut self, report: &TrainingReport) -> Result<()> {
        self.status.state = if report.cancelled {
            TrainingState::Cancelled
        } else {
            TrainingState::Completed
        };
        self.status.eta_seconds = 0;
        self.status.eta = format_eta(0);
        self.publish();
        Ok(())
    }
}

/// スナップショットを保存するオブザーバ
///
/// `save_every` バッチごと（0始まりのバッチ番号が1以上かつ割り切れる時）と、
/// 各エポックの終了時に保存します。保存に失敗した場合は学習を中断します。
pub struct SnapshotObserver {
    store: Arc<ModelVersionStore>,
    save_every: Option<usize>,
    keep_only_latest: usize,
}

impl SnapshotObserver {
    pub fn new(store: Arc<ModelVersionStore>, keep_only_latest: usize) -> Self {
        Self {
            store,
            save_every: None,
            keep_only_latest,
        }
    }

    /// 1エポックあたり約 `snapshots_per_epoch` 回保存する間隔（`batches / snapshots_per_epoch`）
    pub fn with_snapshots_per_epoch(mut self, batches: usize, snapshots_per_epoch: usize) -> Self {
        self.save_every = match snapshots_per_epoch {
            0 => None,
            n => Some(batches / n).filter(|&every| every > 0),
        };
        self
    }

}

impl TrainingObserver for SnapshotObserver {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn is_fatal(&self) -> bool {
        true
    }

    fn on_batch_end(&mut self, event: &BatchEnd, model: &dyn Classifier) -> Result<()> {
        if let Some(every) = self.save_every {
            if event.batch >= 1 && event.batch % every == 0 {
                self.store.save_at(
                    model,
                    &event.metrics,
                    event.epoch,
                    Some(event.batch),
                    self.keep_only_latest,
                )?;
            }
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, event: &EpochEnd, model: &dyn Classifier) -> Result<()> {
        let metrics = event.metrics.unwrap_or_default();
        self.store
            .save_at(model, &metrics, event.epoch, None, self.keep_only_latest)?;
        Ok(())
    }
}

/// 進捗をログに出すオブザーバ
#[derive(Debug, Default)]
pub struct MetricsLogObserver {
    log_every: usize,
}

impl MetricsLogObserver {
    pub fn new(log_every: usize) -> Self {
        Self { log_every }
    }
}

impl TrainingObserver for MetricsLogObserver {
    fn name(&self) -> &str {
        "metrics-log"
    }

    fn on_train_begin(&mut self, plan: &TrainingPlan) -> Result<()> {
        tracing::info!(
            "学習を開始します: エポック数 {}, バッチ数 {}, 学習データ {} 件, 検証データ {} 件",
            plan.epochs,
            plan.batches_per_epoch,
            plan.training_examples,
            plan.validation_examples
        );
        Ok(())
    }

    fn on_batch_end(&mut self, event: &BatchEnd, _model: &dyn Classifier) -> Result<()> {
        let log_every = self.log_every.max(1);
        if (event.batch + 1) % log_every == 0 {
            tracing::debug!(
                "epoch {} batch {}/{}: loss={:.4}, accuracy={:.4} ({:?})",
                event.epoch + 1,
                event.batch + 1,
                event.batches,
                event.metrics.loss,
                event.metrics.accuracy,
                event.duration
            );
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, event: &EpochEnd, _model: &dyn Classifier) -> Result<()> {
        let metrics = event.metrics.unwrap_or_default();
        match event.validation {
            Some(validation) => tracing::info!(
                "Epoch {}/{} - loss: {:.4}, accuracy: {:.4}, val_loss: {:.4}, val_accuracy: {:.4}",
                event.epoch + 1,
                event.epochs,
                metrics.loss,
                metrics.accuracy,
                validation.loss,
                validation.accuracy
            ),
            None => tracing::info!(
                "Epoch {}/{} - loss: {:.4}, accuracy: {:.4}",
                event.epoch + 1,
                event.epochs,
                metrics.loss,
                metrics.accuracy
            ),
        }
        Ok(())
    }

    fn on_train_end(&mut self, report: &TrainingReport) -> Result<()> {
        tracing::info!(
            "学習が終了しました: {} エポック, {} バッチ{}",
            report.epochs_completed,
            report.batches_completed,
            if report.cancelled { " (キャンセル)" } else { "" }
        );
        Ok(())
    }
}
