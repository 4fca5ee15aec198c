//! クレート共通のエラー型

use std::path::PathBuf;

use thiserror::Error;

pub type VisionResult<T> = std::result::Result<T, VisionError>;

#[derive(Debug, Error)]
pub enum VisionError {
    /// ラベルの空きスロットがない
    #[error("max label count reached ({capacity})")]
    LabelCapacityExceeded { capacity: usize },

    /// 未登録のラベル
    #[error("unknown label: {0}")]
    UnknownLabel(String),

    /// スナップショットが1つも見つからない
    #[error("no model snapshot found in {}", .0.display())]
    NoSnapshot(PathBuf),

    /// 分類器が未ロード
    #[error("classifier is not ready (no trained snapshot loaded)")]
    ModelNotReady,

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
