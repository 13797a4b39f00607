//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。
//!
//! ## パッチ分類モデルの前提
//! - 入力: (patch_height, patch_width, input_channels) の画素値を 1/255 で正規化したもの
//! - 出力: IDC陽性確率（0〜1）
//! - Grad-CAM: `gradcam_layer` に指定した畳み込み層の出力を使用

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::PatchSize;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// モデル名（レジストリのキー）
    pub name: String,

    /// 入力パッチの高さ（ピクセル）
    pub patch_height: usize,

    /// 入力パッチの幅（ピクセル）
    pub patch_width: usize,

    /// 入力チャネル数（1: グレースケール, 3: RGB）
    pub input_channels: usize,

    /// 全結合層の隠れ次元
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Grad-CAM に使う畳み込み層名
    pub gradcam_layer: String,

    /// 参照可能な畳み込み層名
    #[serde(default)]
    pub layer_names: Vec<String>,

    /// モデルの作成時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_hidden_size() -> usize {
    128
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        name: impl Into<String>,
        patch_size: PatchSize,
        input_channels: usize,
        hidden_size: usize,
        gradcam_layer: impl Into<String>,
        layer_names: Vec<String>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            name: name.into(),
            patch_height: patch_size.height,
            patch_width: patch_size.width,
            input_channels,
            hidden_size,
            gradcam_layer: gradcam_layer.into(),
            layer_names,
            trained_at,
        }
    }

    pub fn patch_size(&self) -> PatchSize {
        PatchSize::new(self.patch_height, self.patch_width)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let metadata = ModelMetadata::new(
            "idc",
            PatchSize::square(50),
            3,
            128,
            "conv3",
            vec!["conv1".into(), "conv2".into(), "conv3".into()],
        );
        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(restored, metadata);
        assert_eq!(restored.patch_size(), PatchSize::square(50));
    }

    #[test]
    fn test_optional_fields_have_defaults() {
        let json = r#"{
            "name": "old",
            "patch_height": 50,
            "patch_width": 50,
            "input_channels": 1,
            "gradcam_layer": "conv2",
            "trained_at": "2024-01-01T00:00:00+09:00"
        }"#;
        let metadata = ModelMetadata::from_json_string(json).unwrap();
        assert_eq!(metadata.hidden_size, 128);
        assert!(metadata.layer_names.is_empty());
    }
}
