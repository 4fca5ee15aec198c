//! 画像分類モデルの学習・推論と、スライディングウィンドウによる物体検出
//!
//! - `dataset`: ラベル表、学習データ一覧、データ拡張、バッチ生成
//! - `model`: 設定、スナップショットの保存とバージョン管理
//! - `ml`: 分類器の抽象、推論エンジン、学習ループと実行管理
//! - `analyzer`: 物体検出

pub mod analyzer;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod ml;
pub mod model;

pub use analyzer::{detect_objects, detect_objects_in_file, BoundingBox, Detection, DetectorConfig};
pub use dataset::{Example, ExampleCatalog, LabelCodec};
pub use error::{VisionError, VisionResult};
pub use ml::{
    Classifier, ClassifierFactory, PredictedItem, StartOutcome, TrainingSession, VisionModel,
    VisionModelTrainer,
};
pub use model::{ModelLayout, ModelVersionStore, VisionConfig};
