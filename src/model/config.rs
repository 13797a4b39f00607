//! エンジン設定管理モジュール
//!
//! 計算デバイス・モデル一覧・合成パラメータなどをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::compositor::OverlaySettings;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::OverlayEngine;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド（`wgpu` feature が必要）
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// レジストリに登録するモデル
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// モデル名（UIのモデル選択で使う名前）
    pub name: String,
    /// モデルファイル (.tar.gz) のパス
    pub model_path: String,
}

/// タイル実行設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingSettings {
    /// ワーカー数（1 = ラスター順の逐次実行）
    pub workers: usize,
}

impl Default for TilingSettings {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// エンジン設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 登録モデル（設定順）
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    /// 合成パラメータ
    #[serde(default)]
    pub overlay: OverlaySettings,
    /// タイル実行設定
    #[serde(default)]
    pub tiling: TilingSettings,
    /// Grad-CAM の対象クラス
    ///
    /// None = 陽性クラス（モデル出力 p の勾配）。Some(1) も同じ、Some(0) は `1 - p` の勾配。
    #[serde(default)]
    pub gradcam_target: Option<usize>,
}

impl EngineConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("idc_overlay.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    log::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定値の検証
    pub fn validate(&self) -> EngineResult<()> {
        self.overlay.validate()?;
        if self.tiling.workers == 0 {
            return Err(EngineError::Configuration("tiling.workers must be at least 1".to_string()));
        }
        if let Some(target) = self.gradcam_target {
            if target > 1 {
                return Err(EngineError::Configuration(format!(
                    "gradcam_target {} is not a class of a binary classifier",
                    target
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.models {
            if !seen.insert(entry.name.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "model '{}' is registered twice",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// 設定からオーバーレイエンジンを構築
    pub fn build_engine(&self) -> EngineResult<OverlayEngine> {
        self.validate()?;
        OverlayEngine::new(self.overlay.clone(), self.tiling.workers, self.gradcam_target)
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        log::info!("=== エンジン設定 ===");
        log::info!("計算デバイス: {}", self.device_type);
        for entry in &self.models {
            log::info!("モデル: {} ({})", entry.name, entry.model_path);
        }
        log::info!(
            "アルファ: スコア {} / Grad-CAM {}",
            self.overlay.score_alpha,
            self.overlay.gradcam_alpha
        );
        log::info!(
            "ぼかし: {}x{} (sigma {})",
            self.overlay.blur_kernel,
            self.overlay.blur_kernel,
            self.overlay.blur_sigma
        );
        log::info!("ワーカー数: {}", self.tiling.workers);
        match self.gradcam_target {
            Some(target) => log::info!("Grad-CAM 対象クラス: {}", target),
            None => log::info!("Grad-CAM 対象クラス: 陽性クラス (既定)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert!(config.models.is_empty());
        assert_eq!(config.tiling.workers, 1);
        assert_eq!(config.overlay.blur_kernel, 9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut config = EngineConfig::default();
        config.models.push(ModelEntry {
            name: "IDC".to_string(),
            model_path: "models/idc.tar.gz".to_string(),
        });
        config.gradcam_target = Some(1);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.models, config.models);
        assert_eq!(deserialized.gradcam_target, Some(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"device_type": "Wgpu"}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.overlay.score_alpha, 0.3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.tiling.workers = 0;
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        let mut config = EngineConfig::default();
        config.gradcam_target = Some(2);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        let entry = ModelEntry {
            name: "a".to_string(),
            model_path: "a.tar.gz".to_string(),
        };
        config.models = vec![entry.clone(), entry];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.overlay.blur_kernel = 8;
        assert!(config.build_engine().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("idc_overlay_config_{}.json", std::process::id()));
        let mut config = EngineConfig::default();
        config.tiling.workers = 4;
        config.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.tiling.workers, 4);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
