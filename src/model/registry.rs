//! モデルレジストリ
//!
//! 起動時に一度だけ構築する、名前 → モデルハンドルの不変マップ。

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::classifier::ModelHandle;
use crate::engine::error::{EngineError, EngineResult};

#[derive(Debug, Default)]
pub struct ModelRegistry {
    order: Vec<String>,
    handles: HashMap<String, Arc<ModelHandle>>,
}

impl ModelRegistry {
    /// 読み込み済みハンドルから構築（名前の重複はエラー）
    pub fn from_handles(handles: impl IntoIterator<Item = ModelHandle>) -> EngineResult<Self> {
        let mut registry = Self::default();
        for handle in handles {
            let name = handle.name().to_string();
            if registry.handles.contains_key(&name) {
                return Err(EngineError::Configuration(format!(
                    "model '{}' is registered twice",
                    name
                )));
            }
            registry.order.push(name.clone());
            registry.handles.insert(name, Arc::new(handle));
        }
        Ok(registry)
    }

    /// 設定に列挙されたモデルをすべて読み込む
    #[cfg(feature = "ml")]
    pub fn from_config(config: &crate::model::EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let mut handles = Vec::with_capacity(config.models.len());
        for entry in &config.models {
            let handle = crate::ml::load_model_handle(
                &entry.name,
                std::path::Path::new(&entry.model_path),
                config.device_type,
            )?;
            handles.push(handle);
        }
        let registry = Self::from_handles(handles)?;
        log::info!("{} 個のモデルを登録しました", registry.len());
        Ok(registry)
    }

    /// 名前でモデルを取得
    pub fn get(&self, name: &str) -> EngineResult<Arc<ModelHandle>> {
        self.handles.get(name).cloned().ok_or_else(|| {
            EngineError::Configuration(format!(
                "unknown model '{}' (available: {})",
                name,
                self.order.join(", ")
            ))
        })
    }

    /// 設定順のモデル名
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::classifier::testing::MeanIntensityClassifier;
    use crate::types::PatchSize;

    fn handle(name: &str) -> ModelHandle {
        ModelHandle::new(
            name,
            Arc::new(MeanIntensityClassifier::new(3)),
            PatchSize::square(50),
            "feat",
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_and_order() {
        let registry = ModelRegistry::from_handles(vec![handle("IDC"), handle("Baseline")]).unwrap();
        assert_eq!(registry.names(), &["IDC".to_string(), "Baseline".to_string()]);
        assert_eq!(registry.get("Baseline").unwrap().name(), "Baseline");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_model_is_configuration_error() {
        let registry = ModelRegistry::from_handles(vec![handle("IDC")]).unwrap();
        assert!(matches!(registry.get("VGG"), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(ModelRegistry::from_handles(vec![handle("IDC"), handle("IDC")]).is_err());
    }

    #[test]
    fn test_empty_config_builds_empty_registry() {
        #[cfg(feature = "ml")]
        {
            let registry = ModelRegistry::from_config(&crate::model::EngineConfig::default()).unwrap();
            assert!(registry.is_empty());
        }
    }
}
