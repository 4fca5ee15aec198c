//! バージョン付きスナップショットの管理
//!
//! `<prefix>-version-<n>-accuracy-<a>.tar.gz` 形式のファイルを
//! バージョン番号で管理し、保存時に古いものを削除します。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use regex::Regex;

use crate::error::{VisionError, VisionResult};
use crate::ml::classifier::{BatchMetrics, Classifier};
use crate::model::model_metadata::SnapshotMetadata;
use crate::model::model_storage::load_metadata;

/// スナップショットの拡張子
pub const SNAPSHOT_EXTENSION: &str = ".tar.gz";

/// 書き込み中のスナップショットに付ける拡張子
const PARTIAL_EXTENSION: &str = ".part";

/// デフォルトの接頭辞
pub const DEFAULT_PREFIX: &str = "burn";

/// スナップショット1件（パスとバージョン）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub version: u64,
}

fn snapshot_pattern(prefix: &str) -> VisionResult<Regex> {
    let pattern = format!(
        r"^{}-version-(\d+)([.\-a-z0-9]*)?\.tar\.gz$",
        regex::escape(prefix)
    );
    Regex::new(&pattern).map_err(|e| VisionError::InvalidInput(e.to_string()))
}

fn scan_with(base_path: &Path, pattern: &Regex) -> VisionResult<Vec<SnapshotEntry>> {
    let read_dir = match fs::read_dir(base_path) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(captures) = pattern.captures(file_name) else {
            continue;
        };
        // 桁あふれするバージョンは対象外
        let Ok(version) = captures[1].parse::<u64>() else {
            continue;
        };
        if entry.file_type()?.is_file() {
            entries.push(SnapshotEntry {
                path: entry.path(),
                version,
            });
        }
    }

    entries.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| a.path.cmp(&b.path)));
    Ok(entries)
}

/// ディレクトリ内のスナップショットをバージョンの降順で列挙
pub fn scan_snapshots<P: AsRef<Path>>(base_path: P, prefix: &str) -> VisionResult<Vec<SnapshotEntry>> {
    scan_with(base_path.as_ref(), &snapshot_pattern(prefix)?)
}

/// 最新のスナップショットのパス
pub fn find_latest_snapshot<P: AsRef<Path>>(base_path: P, prefix: &str) -> VisionResult<PathBuf> {
    let base_path = base_path.as_ref();
    scan_snapshots(base_path, prefix)?
        .into_iter()
        .next()
        .map(|entry| entry.path)
        .ok_or_else(|| VisionError::NoSnapshot(base_path.to_path_buf()))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_EXTENSION);
    PathBuf::from(name)
}

/// スナップショットの保存先ディレクトリ
#[derive(Debug)]
pub struct ModelVersionStore {
    base_path: PathBuf,
    prefix: String,
    pattern: Regex,
    cache: Mutex<Option<Vec<SnapshotEntry>>>,
}

impl ModelVersionStore {
    pub fn new<P: Into<PathBuf>>(base_path: P, prefix: &str) -> VisionResult<Self> {
        Ok(Self {
            base_path: base_path.into(),
            prefix: prefix.to_string(),
            pattern: snapshot_pattern(prefix)?,
            cache: Mutex::new(None),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// バージョンの降順で列挙（結果はキャッシュされる）
    pub fn scan(&self) -> VisionResult<Vec<SnapshotEntry>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| VisionError::Other(anyhow::anyhow!("snapshot cache lock poisoned")))?;
        if let Some(entries) = cache.as_ref() {
            return Ok(entries.clone());
        }

        let entries = scan_with(&self.base_path, &self.pattern)?;
        *cache = Some(entries.clone());
        Ok(entries)
    }

    /// キャッシュを破棄（外部でファイルを変更した場合に使う）
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    pub fn find_latest(&self) -> VisionResult<PathBuf> {
        self.scan()?
            .into_iter()
            .next()
            .map(|entry| entry.path)
            .ok_or_else(|| VisionError::NoSnapshot(self.base_path.clone()))
    }

    /// 最新スナップショットのメタデータ
    pub fn latest_metadata(&self) -> VisionResult<SnapshotMetadata> {
        let path = self.find_latest()?;
        Ok(load_metadata(&path)?)
    }

    /// 新しいバージョンとして保存し、新しい順に `keep_only_latest` 件だけ残す
    pub fn save<C: Classifier + ?Sized>(
        &self,
        model: &C,
        metrics: &BatchMetrics,
        keep_only_latest: usize,
    ) -> VisionResult<PathBuf> {
        self.save_at(model, metrics, 0, None, keep_only_latest)
    }

    /// エポック・バッチ位置を記録して保存
    pub fn save_at<C: Classifier + ?Sized>(
        &self,
        model: &C,
        metrics: &BatchMetrics,
        epoch: usize,
        batch: Option<usize>,
        keep_only_latest: usize,
    ) -> VisionResult<PathBuf> {
        let existing = self.scan()?;
        let version = existing.first().map(|entry| entry.version).unwrap_or(0) + 1;

        let file_name = format!(
            "{}-version-{}-accuracy-{:.4}{}",
            self.prefix, version, metrics.accuracy, SNAPSHOT_EXTENSION
        );
        let path = self.base_path.join(file_name);
        let metadata = SnapshotMetadata::new(
            version,
            metrics.accuracy,
            metrics.loss,
            model.num_labels(),
            model.input_size(),
        )
        .with_progress(epoch, batch);

        fs::create_dir_all(&self.base_path)?;
        // 書き込み完了まではスナップショット名に一致しない一時ファイルに書く
        let partial = partial_path(&path);
        let saved = model
            .save(&partial, &metadata)
            .and_then(|()| fs::rename(&partial, &path).map_err(VisionError::from));
        if let Err(e) = saved {
            if let Err(remove_error) = fs::remove_file(&partial) {
                if remove_error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "一時ファイルを削除できません {}: {}",
                        partial.display(),
                        remove_error
                    );
                }
            }
            return Err(e);
        }
        self.invalidate();
        tracing::info!("スナップショットを保存しました: {}", path.display());

        let keep = keep_only_latest.max(1);
        if existing.len() >= keep {
            for entry in &existing[keep - 1..] {
                match fs::remove_file(&entry.path) {
                    Ok(()) => tracing::debug!("古いスナップショットを削除: {}", entry.path.display()),
                    Err(e) => tracing::warn!(
                        "スナップショットを削除できません {}: {}",
                        entry.path.display(),
                        e
                    ),
                }
            }
            self.invalidate();
        }

        Ok(path)
    }
}
