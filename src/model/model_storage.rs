//! スナップショットの永続化
//!
//! Tar.gz形式で分類器の重みとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（バージョン、精度、入力サイズなど）
//! - model.bin       - 分類器の重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder};

use crate::model::model_metadata::SnapshotMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共に分類器の重みをTar.gz形式で保存
///
/// `output_path` はそのまま使います（拡張子の付け替えはしません）。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &SnapshotMetadata,
    model_binary: &[u8],
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(output_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", output_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // gzipのフッタまで書き切る
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// Tar.gzからメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<SnapshotMetadata> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return SnapshotMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータと重みを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(SnapshotMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<SnapshotMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(SnapshotMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &SnapshotMetadata) {
    tracing::info!(
        "スナップショット v{}: accuracy={:.4}, loss={:.4}, labels={}, input={}x{}, epoch={}, batch={:?}, saved_at={}",
        metadata.version,
        metadata.accuracy,
        metadata.loss,
        metadata.num_labels,
        metadata.input_width,
        metadata.input_height,
        metadata.epoch,
        metadata.batch,
        metadata.saved_at
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("burn-version-1-accuracy-0.5000.tar.gz");
        let metadata = SnapshotMetadata::new(1, 0.5, 0.7, 10, (32, 32));
        let weights = vec![1u8, 2, 3, 4, 5];

        save_model_with_metadata(&path, &metadata, &weights).unwrap();
        assert!(path.exists());

        assert_eq!(load_metadata(&path).unwrap(), metadata);

        let (loaded_metadata, loaded_weights) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded_metadata.version, 1);
        assert_eq!(loaded_weights, weights);
    }

    #[test]
    fn test_load_missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_metadata(&dir.path().join("missing.tar.gz")).is_err());
    }
}
