//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（パッチサイズ、入力チャネル、Grad-CAM層など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先パス（.gz で終わらなければ .tar.gz を付ける）
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

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

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 戻り値は実際に書き込んだパス。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // gzip ストリームまで閉じる
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    log::info!("モデルを保存しました: {}", tar_gz_path.display());
    Ok(tar_gz_path)
}

/// アーカイブから名前の一致するエントリを1つ読む
fn read_entry(tar_gz_path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(Some(buffer));
        }
    }
    Ok(None)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = read_entry(tar_gz_path, METADATA_ENTRY)?
        .ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))?;
    let json_str = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json_str)
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entry(tar_gz_path, MODEL_ENTRY)?
        .ok_or_else(|| anyhow::anyhow!("model.bin not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
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

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("モデル名: {}", metadata.name);
    println!("パッチサイズ: {}x{}", metadata.patch_height, metadata.patch_width);
    println!("入力チャネル数: {}", metadata.input_channels);
    println!("隠れ次元: {}", metadata.hidden_size);
    println!("Grad-CAM層: {}", metadata.gradcam_layer);
    println!("畳み込み層: {}", metadata.layer_names.join(", "));
    println!("作成日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PatchSize;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("idc_overlay_{}_{}", std::process::id(), name))
    }

    fn metadata() -> ModelMetadata {
        ModelMetadata::new("idc", PatchSize::square(50), 3, 128, "conv3", vec!["conv3".into()])
    }

    #[test]
    fn test_archive_path_extension() {
        assert_eq!(archive_path(Path::new("a/model")), PathBuf::from("a/model.tar.gz"));
        assert_eq!(archive_path(Path::new("a/model.tar.gz")), PathBuf::from("a/model.tar.gz"));
    }

    #[test]
    fn test_save_and_load_archive() {
        let path = temp_path("storage.tar.gz");
        let binary = vec![1u8, 2, 3, 4, 5];
        let saved = metadata();
        let written = save_model_with_metadata(&path, &saved, &binary).unwrap();
        assert_eq!(written, path);

        // 作成時刻まで含めて保存時の値と一致する
        assert_eq!(load_metadata(&path).unwrap(), saved);
        assert_eq!(load_model_binary(&path).unwrap(), binary);
        let (m, b) = load_model_with_metadata(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(m.name, "idc");
        assert_eq!(b, binary);
    }

    #[test]
    fn test_missing_model_entry() {
        let path = temp_path("metadata_only.tar.gz");
        {
            let file = File::create(&path).unwrap();
            let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
            let json = metadata().to_json_string().unwrap();
            append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        assert!(load_metadata(&path).is_ok());
        let err = load_model_with_metadata(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.to_string().contains("model.bin"));
    }
}
