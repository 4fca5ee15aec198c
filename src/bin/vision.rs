//! 学習・推論・検出のコマンドラインツール
//!
//! ```text
//! vision train   <models-root> <name>
//! vision predict <model-dir> <image>
//! vision detect  <model-dir> <image>
//! ```
//!
//! 設定ファイルは環境変数 `VISION_CONFIG`（未指定時は `vision.json`）から読み込みます。
#![recursion_limit = "256"]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use burn_ndarray::NdArrayDevice;
use burn_wgpu::WgpuDevice;

use product_vision::analyzer::detect_objects_in_file;
use product_vision::dataset::{ExampleCatalog, DEFAULT_SUFFIXES};
use product_vision::ml::{
    BurnClassifierFactory, ClassifierFactory, CpuBackend, GpuBackend, StartOutcome,
    TrainerOptions, VisionModel, VisionModelTrainer,
};
use product_vision::model::{log_metadata_info, DeviceType, ModelLayout, VisionConfig};

enum Command {
    Train { models_root: PathBuf, name: String },
    Predict { model_dir: PathBuf, image: PathBuf },
    Detect { model_dir: PathBuf, image: PathBuf },
}

fn usage() -> String {
    "usage:\n  vision train <models-root> <name>\n  vision predict <model-dir> <image>\n  vision detect <model-dir> <image>"
        .to_string()
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [command, a, b] => match command.as_str() {
            "train" => Ok(Command::Train {
                models_root: PathBuf::from(a),
                name: b.clone(),
            }),
            "predict" => Ok(Command::Predict {
                model_dir: PathBuf::from(a),
                image: PathBuf::from(b),
            }),
            "detect" => Ok(Command::Detect {
                model_dir: PathBuf::from(a),
                image: PathBuf::from(b),
            }),
            other => anyhow::bail!("unknown command '{}'\n{}", other, usage()),
        },
        _ => anyhow::bail!("{}", usage()),
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = product_vision::logging::init() {
        eprintln!("ログの初期化に失敗しました: {}", e);
    }

    if let Err(e) = run_cli().await {
        eprintln!("エラー: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_cli() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config_path = std::env::var("VISION_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| VisionConfig::default_path());
    let config = VisionConfig::load_or_default(&config_path);
    config.log_summary();

    let input_size = config.model.input_size;
    match config.device_type {
        DeviceType::Cpu => {
            let factory = BurnClassifierFactory::<CpuBackend>::new(NdArrayDevice::Cpu, input_size)
                .with_dropout(config.model.dropout)
                .with_learning_rate(config.training.learning_rate);
            run(factory, command, &config).await
        }
        DeviceType::Wgpu => {
            let factory = BurnClassifierFactory::<GpuBackend>::new(WgpuDevice::default(), input_size)
                .with_dropout(config.model.dropout)
                .with_learning_rate(config.training.learning_rate);
            run(factory, command, &config).await
        }
    }
}

async fn run<F>(factory: F, command: Command, config: &VisionConfig) -> Result<()>
where
    F: ClassifierFactory + Clone + 'static,
{
    match command {
        Command::Train { models_root, name } => train(factory, &models_root, &name, config).await,
        Command::Predict { model_dir, image } => {
            let model = open_model(factory, &model_dir, config)?;
            let items = model
                .predict_from_file(&image)
                .with_context(|| format!("Failed to classify {}", image.display()))?;

            println!("=== 分類結果: {} ===", image.display());
            for item in items.iter().filter(|item| item.label.is_some()).take(5) {
                println!(
                    "  {:>4}  {:<24} {:.4}",
                    item.index,
                    item.label.as_deref().unwrap_or(""),
                    item.probability
                );
            }
            Ok(())
        }
        Command::Detect { model_dir, image } => {
            let model = open_model(factory, &model_dir, config)?;
            let detections = detect_objects_in_file(&model, &image, &config.detector)
                .with_context(|| format!("Failed to detect objects in {}", image.display()))?;

            println!("=== 検出結果: {} ({} 件) ===", image.display(), detections.len());
            for detection in &detections {
                let bbox = detection.bounding_box;
                println!(
                    "  {:<24} {:.4}  ({}, {}) - ({}, {})",
                    detection.label, detection.probability, bbox.x1, bbox.y1, bbox.x2, bbox.y2
                );
            }
            Ok(())
        }
    }
}

fn open_model<F: ClassifierFactory>(
    factory: F,
    model_dir: &Path,
    config: &VisionConfig,
) -> Result<VisionModel<F>> {
    let model = VisionModel::open_with(
        model_dir,
        &config.model.snapshot_prefix,
        config.model.max_labels,
        factory,
    )
    .with_context(|| format!("Failed to open model directory {}", model_dir.display()))?;

    if let Ok(metadata) = model.store().latest_metadata() {
        log_metadata_info(&metadata);
    }
    Ok(model)
}

async fn train<F>(factory: F, models_root: &Path, name: &str, config: &VisionConfig) -> Result<()>
where
    F: ClassifierFactory + Clone + 'static,
{
    let layout = ModelLayout::named(models_root, name);
    layout.create_dirs()?;

    let catalog = ExampleCatalog::build_from_directory(layout.data_dir(), &DEFAULT_SUFFIXES, None, false)
        .with_context(|| format!("Failed to scan {}", layout.data_dir().display()))?;
    tracing::info!("学習データ: {} 件, ラベル: {}", catalog.len(), catalog.labels().join(", "));

    let trainer = VisionModelTrainer::new(layout.model_dir(), factory, TrainerOptions::from_config(config));
    let session = match trainer.start_training(catalog, Vec::new()) {
        StartOutcome::Started(session) => session,
        StartOutcome::AlreadyRunning => anyhow::bail!("training is already running"),
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
            }
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                let status = session.status();
                tracing::info!(
                    "進捗: epoch {}/{}, batch {}/{}, ETA {}",
                    status.epoch,
                    status.epochs,
                    status.batch,
                    status.batches,
                    status.eta
                );
            }
        }
        if !session.is_running() {
            break;
        }
    }

    let report = session.wait().await?;
    println!(
        "学習完了: {} エポック, {} バッチ{}",
        report.epochs_completed,
        report.batches_completed,
        if report.cancelled { " (キャンセル)" } else { "" }
    );
    Ok(())
}
