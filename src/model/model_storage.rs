//! モデルとマニフェストの永続化
//!
//! Tar.gz形式でマニフェストと重みを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - manifest.json   - マニフェスト（構造・シグネチャ・正規化定数など）
//! - weights.bin     - モデルの重み（バイナリ）
//!
//! 一度作成したファイルは上書きしません。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const MANIFEST_ENTRY: &str = "manifest.json";
const WEIGHTS_ENTRY: &str = "weights.bin";

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// マニフェストと共にモデルをTar.gz形式で保存
///
/// 保存先にファイルが既にある場合はエラーになります。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output_path)
        .with_context(|| format!("Failed to create artifact file: {:?}", output_path))?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, MANIFEST_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, WEIGHTS_ENTRY, model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    Ok(())
}

/// `wanted` に一致するエントリだけを読み込む
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
    let file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open artifact: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut found = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if wanted.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found.push((name, buffer));
        }
    }
    Ok(found)
}

fn take_entry(entries: &mut Vec<(String, Vec<u8>)>, name: &str) -> Result<Vec<u8>> {
    let index = entries
        .iter()
        .position(|(entry_name, _)| entry_name == name)
        .ok_or_else(|| anyhow::anyhow!("{} not found in artifact", name))?;
    Ok(entries.swap_remove(index).1)
}

fn parse_manifest(bytes: Vec<u8>) -> Result<ModelMetadata> {
    let json = String::from_utf8(bytes).context("manifest.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json)
}

/// Tar.gzからマニフェストを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_entries(tar_gz_path, &[MANIFEST_ENTRY])?;
    parse_manifest(take_entry(&mut entries, MANIFEST_ENTRY)?)
}

/// マニフェストとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_entries(tar_gz_path, &[MANIFEST_ENTRY, WEIGHTS_ENTRY])?;
    let metadata = parse_manifest(take_entry(&mut entries, MANIFEST_ENTRY)?)?;
    let binary = take_entry(&mut entries, WEIGHTS_ENTRY)?;
    Ok((metadata, binary))
}

/// マニフェストをログに出す
pub fn log_metadata_info(metadata: &ModelMetadata) {
    log::info!("=== モデルマニフェスト ===");
    log::info!(
        "入力: {} {:?} {:?}",
        metadata.input.name,
        metadata.input.dtype,
        metadata.input.shape
    );
    log::info!(
        "出力: {} {:?} {:?}",
        metadata.output.name,
        metadata.output.dtype,
        metadata.output.shape
    );
    log::info!(
        "正規化: v{} mean={} std={} scale={}",
        metadata.normalization.version,
        metadata.normalization.mean,
        metadata.normalization.std,
        metadata.normalization.pixel_scale
    );
    log::info!("クラス: {}", metadata.class_names.join(", "));
    log::info!("学習エポック数: {}", metadata.num_epochs);
    if let Some(accuracy) = metadata.test_accuracy {
        log::info!("評価データ正解率: {:.4}", accuracy);
    }
    log::info!("エクスポート日時: {}", metadata.exported_at);
}
