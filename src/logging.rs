//! ログ出力の初期化
//!
//! `tracing` のグローバルサブスクライバを標準出力に設定します。
//! フィルタは `RUST_LOG` で上書きでき、未指定時は `info` です。

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// ログ初期化時のエラー
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// グローバルサブスクライバを設定する（2回目以降は何もしない）
pub fn init() -> Result<(), LoggingError> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true));

    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INITIALIZED.set(());
    tracing::debug!("Logging initialized");
    Ok(())
}
