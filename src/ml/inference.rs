//! モデル推論機能
//!
//! burn の CNN を `PatchClassifier` として公開します。
//! 確率推論は autodiff を外した内部バックエンドで、Grad-CAM は autodiff
//! バックエンドで実行します。

use anyhow::{Context, Result};
use burn::{
    module::{AutodiffModule, Module},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use ndarray::{Array3, ArrayView3};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::engine::classifier::{class_score, ModelHandle, PatchClassifier, POSITIVE_CLASS};
use crate::engine::error::ClassifierError;
use crate::engine::gradcam::LayerGradients;
use crate::ml::ml_model::{ConvLayer, IdcClassifier, IdcClassifierConfig};
use crate::model::{load_model_with_metadata, save_model_with_metadata, DeviceType, ModelMetadata};

/// CPU (NdArray) バックエンド
pub type CpuBackend = burn_autodiff::Autodiff<burn_ndarray::NdArray<f32>>;

/// GPU (WGPU) バックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_autodiff::Autodiff<burn_wgpu::Wgpu>;

fn poisoned<T>(_: T) -> ClassifierError {
    ClassifierError::Backend("model lock poisoned".to_string())
}

fn tensor_values<BB: Backend, const D: usize>(tensor: Tensor<BB, D>) -> Result<Vec<f32>, ClassifierError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ClassifierError::Backend(format!("推論結果の取得エラー: {:?}", e)))
}

fn scalar<BB: Backend, const D: usize>(tensor: Tensor<BB, D>) -> Result<f32, ClassifierError> {
    tensor_values(tensor)?
        .first()
        .copied()
        .ok_or_else(|| ClassifierError::Backend("empty model output".to_string()))
}

/// burn CNN によるパッチ分類器
pub struct BurnPatchClassifier<B: AutodiffBackend> {
    /// Grad-CAM 用（勾配を追跡する）
    model: Mutex<IdcClassifier<B>>,
    /// 確率推論用
    inference_model: Mutex<IdcClassifier<B::InnerBackend>>,
    input_channels: usize,
    patch_height: usize,
    patch_width: usize,
    hidden_size: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> BurnPatchClassifier<B> {
    pub fn new(model: IdcClassifier<B>, config: &IdcClassifierConfig, device: B::Device) -> Self {
        let inference_model = model.valid();
        Self {
            model: Mutex::new(model),
            inference_model: Mutex::new(inference_model),
            input_channels: config.input_channels,
            patch_height: config.patch_height,
            patch_width: config.patch_width,
            hidden_size: config.hidden_size,
            device,
        }
    }

    /// 重みをランダム初期化した分類器
    pub fn init(config: &IdcClassifierConfig, device: B::Device) -> Result<Self> {
        let model = config.init::<B>(&device)?;
        Ok(Self::new(model, config, device))
    }

    /// `BinBytesRecorder` 形式の重みから復元
    pub fn from_bytes(config: &IdcClassifierConfig, model_binary: Vec<u8>, device: B::Device) -> Result<Self> {
        let model = config.init::<B>(&device)?;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        Ok(Self::new(model, config, device))
    }

    /// 重みを `BinBytesRecorder` 形式で書き出す
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let model = self.inference_model.lock().map_err(poisoned)?.clone();
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        <BinBytesRecorder<FullPrecisionSettings> as Recorder<B::InnerBackend>>::record(
            &recorder,
            model.into_record(),
            (),
        )
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
    }

    pub fn config(&self) -> IdcClassifierConfig {
        IdcClassifierConfig::new()
            .with_input_channels(self.input_channels)
            .with_patch_height(self.patch_height)
            .with_patch_width(self.patch_width)
            .with_hidden_size(self.hidden_size)
    }

    /// (H, W, C) パッチを [1, C, H, W] テンソルに変換
    fn input_tensor<BB: Backend<Device = B::Device>>(
        &self,
        patch: ArrayView3<f32>,
    ) -> Result<Tensor<BB, 4>, ClassifierError> {
        let expected = (self.patch_height, self.patch_width, self.input_channels);
        if patch.dim() != expected {
            return Err(ClassifierError::PatchShape {
                expected,
                actual: patch.dim(),
            });
        }
        let chw: Vec<f32> = patch.permuted_axes([2, 0, 1]).iter().copied().collect();
        Ok(Tensor::<BB, 1>::from_floats(chw.as_slice(), &self.device).reshape([
            1,
            self.input_channels,
            self.patch_height,
            self.patch_width,
        ]))
    }
}

impl<B: AutodiffBackend> PatchClassifier for BurnPatchClassifier<B> {
    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn layer_names(&self) -> Vec<String> {
        ConvLayer::ALL.iter().map(|l| l.name().to_string()).collect()
    }

    fn predict(&self, patch: ArrayView3<f32>) -> Result<f32, ClassifierError> {
        let input = self.input_tensor::<B::InnerBackend>(patch)?;
        // テンソルは参照カウントなので複製は安価。ロックは複製の間だけ保持する
        let model = self.inference_model.lock().map_err(poisoned)?.clone();
        scalar(model.predict_probability(input))
    }

    fn layer_gradients(
        &self,
        patch: ArrayView3<f32>,
        layer: &str,
        target_class: Option<usize>,
    ) -> Result<LayerGradients, ClassifierError> {
        let conv = ConvLayer::from_name(layer).ok_or_else(|| ClassifierError::UnknownLayer(layer.to_string()))?;
        let input = self.input_tensor::<B>(patch)?;
        let model = self.model.lock().map_err(poisoned)?.clone();

        // 指定層の出力を勾配の葉にする
        let activations = model.features_until(input, conv).detach().require_grad();
        let probability = sigmoid(model.head_from(activations.clone(), conv));
        let p = scalar(probability.clone())?;

        // 既定はモデル出力 p（陽性クラス）の勾配
        let class_index = target_class.unwrap_or(POSITIVE_CLASS);
        class_score(p, class_index)?;
        let score = if class_index == 0 {
            probability.neg().add_scalar(1.0)
        } else {
            probability
        };

        let grads = score.sum().backward();
        let gradients = activations
            .grad(&grads)
            .ok_or_else(|| ClassifierError::Backend(format!("no gradient for layer '{}'", layer)))?;

        let [_, channels, height, width] = activations.dims();
        let shape = (channels, height, width);
        let to_array = |values: Vec<f32>| {
            Array3::from_shape_vec(shape, values).map_err(|e| ClassifierError::Backend(e.to_string()))
        };

        Ok(LayerGradients {
            activations: to_array(tensor_values(activations.inner())?)?,
            gradients: to_array(tensor_values(gradients)?)?,
            probability: p,
            class_index,
        })
    }
}

/// メタデータから分類器設定を作成（重みを読む前に検証する）
pub fn classifier_config(metadata: &ModelMetadata) -> Result<IdcClassifierConfig> {
    metadata.patch_size().validate()?;
    if ConvLayer::from_name(&metadata.gradcam_layer).is_none() {
        anyhow::bail!(
            "model '{}' has unknown grad-cam layer '{}'",
            metadata.name,
            metadata.gradcam_layer
        );
    }
    // 記録された層名はネットワーク構成と一致しなければならない（空は旧形式として許容）
    let expected: Vec<&str> = ConvLayer::ALL.iter().map(|l| l.name()).collect();
    if !metadata.layer_names.is_empty() && metadata.layer_names != expected {
        anyhow::bail!(
            "model '{}' records layers [{}] but the network has [{}]",
            metadata.name,
            metadata.layer_names.join(", "),
            expected.join(", ")
        );
    }
    Ok(IdcClassifierConfig::new()
        .with_input_channels(metadata.input_channels)
        .with_patch_height(metadata.patch_height)
        .with_patch_width(metadata.patch_width)
        .with_hidden_size(metadata.hidden_size))
}

fn build_handle<B: AutodiffBackend>(
    name: &str,
    metadata: &ModelMetadata,
    model_binary: Vec<u8>,
    device: B::Device,
) -> Result<ModelHandle> {
    let config = classifier_config(metadata)?;
    let classifier = BurnPatchClassifier::<B>::from_bytes(&config, model_binary, device)?;
    let handle = ModelHandle::new(
        name,
        Arc::new(classifier),
        metadata.patch_size(),
        metadata.gradcam_layer.as_str(),
    )?;
    Ok(handle)
}

/// モデルファイルを読み込んでハンドルを作成
pub fn load_model_handle(name: &str, model_path: &Path, device_type: DeviceType) -> Result<ModelHandle> {
    let (metadata, model_binary) = load_model_with_metadata(model_path)
        .with_context(|| format!("Failed to load model '{}' from {:?}", name, model_path))?;
    log::info!(
        "モデル '{}' を読み込みます: {} ({}, 作成 {})",
        name,
        model_path.display(),
        device_type,
        metadata.trained_at
    );

    match device_type {
        DeviceType::Cpu => build_handle::<CpuBackend>(name, &metadata, model_binary, Default::default()),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => build_handle::<GpuBackend>(name, &metadata, model_binary, Default::default()),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => Err(crate::engine::error::EngineError::Configuration(
            "WGPU backend requested but the `wgpu` feature is not enabled".to_string(),
        )
        .into()),
    }
}

/// 分類器をメタデータ付きで保存
pub fn save_classifier<B: AutodiffBackend>(
    output_path: &Path,
    name: &str,
    classifier: &BurnPatchClassifier<B>,
    gradcam_layer: ConvLayer,
) -> Result<PathBuf> {
    let config = classifier.config();
    let metadata = ModelMetadata::new(
        name,
        crate::types::PatchSize::new(config.patch_height, config.patch_width),
        config.input_channels,
        config.hidden_size,
        gradcam_layer.name(),
        classifier.layer_names(),
    );
    let model_binary = classifier.to_bytes()?;
    save_model_with_metadata(output_path, &metadata, &model_binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OverlayEngine;
    use crate::types::PatchSize;
    use ndarray::Array3;

    fn small_config() -> IdcClassifierConfig {
        IdcClassifierConfig::new()
            .with_input_channels(1)
            .with_patch_height(20)
            .with_patch_width(20)
            .with_hidden_size(8)
    }

    fn classifier() -> BurnPatchClassifier<CpuBackend> {
        BurnPatchClassifier::<CpuBackend>::init(&small_config(), Default::default()).unwrap()
    }

    fn patch(value: f32) -> Array3<f32> {
        Array3::from_shape_fn((20, 20, 1), |(y, x, _)| value * ((y + x) % 5) as f32 / 4.0)
    }

    #[test]
    fn test_predict_is_deterministic_probability() {
        let classifier = classifier();
        let p1 = classifier.predict(patch(0.8).view()).unwrap();
        let p2 = classifier.predict(patch(0.8).view()).unwrap();
        assert!((0.0..=1.0).contains(&p1));
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_predict_rejects_wrong_shape() {
        let classifier = classifier();
        let wrong = Array3::<f32>::zeros((20, 20, 3));
        assert!(matches!(
            classifier.predict(wrong.view()),
            Err(ClassifierError::PatchShape { .. })
        ));
    }

    #[test]
    fn test_layer_gradients_shape() {
        let classifier = classifier();
        let result = classifier.layer_gradients(patch(0.5).view(), "conv2", None).unwrap();
        // 20 -> 18 -> 9 -> 7
        assert_eq!(result.activations.dim(), (32, 7, 7));
        assert_eq!(result.gradients.dim(), (32, 7, 7));
        assert_eq!(result.class_index, POSITIVE_CLASS);
        let p = classifier.predict(patch(0.5).view()).unwrap();
        assert!((result.probability - p).abs() < 1e-5);
    }

    #[test]
    fn test_default_target_is_positive_output() {
        let classifier = classifier();
        // 負例・正例どちらの確率でも、既定は p の勾配
        for value in [0.1, 0.9] {
            let default = classifier.layer_gradients(patch(value).view(), "conv3", None).unwrap();
            let positive = classifier.layer_gradients(patch(value).view(), "conv3", Some(1)).unwrap();
            assert_eq!(default.class_index, 1);
            for (a, b) in default.gradients.iter().zip(positive.gradients.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_class_zero_gradient_is_negated() {
        let classifier = classifier();
        let positive = classifier.layer_gradients(patch(0.5).view(), "conv3", Some(1)).unwrap();
        let negative = classifier.layer_gradients(patch(0.5).view(), "conv3", Some(0)).unwrap();
        for (a, b) in positive.gradients.iter().zip(negative.gradients.iter()) {
            assert!((a + b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_unknown_layer_and_class() {
        let classifier = classifier();
        assert!(matches!(
            classifier.layer_gradients(patch(0.5).view(), "dense", None),
            Err(ClassifierError::UnknownLayer(_))
        ));
        assert!(classifier.layer_gradients(patch(0.5).view(), "conv1", Some(2)).is_err());
    }

    #[test]
    fn test_save_and_load_keeps_predictions() {
        let classifier = classifier();
        let path = std::env::temp_dir().join(format!("idc_overlay_model_{}.tar.gz", std::process::id()));
        let written = save_classifier(&path, "idc-test", &classifier, ConvLayer::Conv2).unwrap();

        let handle = load_model_handle("idc-test", &written, DeviceType::Cpu).unwrap();
        std::fs::remove_file(&written).ok();

        assert_eq!(handle.patch_size(), PatchSize::square(20));
        assert_eq!(handle.gradcam_layer(), "conv2");
        let before = classifier.predict(patch(0.3).view()).unwrap();
        let after = handle.classifier().predict(patch(0.3).view()).unwrap();
        assert!((before - after).abs() < 1e-6);
    }

    #[test]
    fn test_classifier_config_rejects_unknown_layer() {
        let metadata = ModelMetadata::new("x", PatchSize::square(50), 3, 128, "block5_conv3", vec![]);
        assert!(classifier_config(&metadata).is_err());
    }

    #[test]
    fn test_classifier_config_checks_recorded_layers() {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let ok = ModelMetadata::new("x", PatchSize::square(50), 3, 128, "conv3", names(&["conv1", "conv2", "conv3"]));
        assert!(classifier_config(&ok).is_ok());

        let legacy = ModelMetadata::new("x", PatchSize::square(50), 3, 128, "conv3", vec![]);
        assert!(classifier_config(&legacy).is_ok());

        let mismatch = ModelMetadata::new("x", PatchSize::square(50), 3, 128, "conv3", names(&["conv1", "conv3"]));
        let err = classifier_config(&mismatch).unwrap_err();
        assert!(err.to_string().contains("records layers"));
    }

    #[test]
    fn test_engine_with_burn_model() {
        let handle = ModelHandle::new("idc", Arc::new(classifier()), PatchSize::square(20), "conv3").unwrap();
        let image = Array3::from_shape_fn((45, 30, 1), |(y, x, _)| ((y * 5 + x * 3) % 256) as u8);
        let engine = OverlayEngine::default();

        let score = engine.score_overlay(image.view(), &handle).unwrap();
        assert_eq!(score.overlay.dim(), (60, 40, 1));
        assert_eq!(score.annotations.len(), 6);

        let gradcam = engine.gradcam_overlay(image.view(), &handle).unwrap();
        assert_eq!(gradcam.overlay.dim(), (60, 40, 1));
        assert_eq!(gradcam.heatmap.dim(), (60, 40, 3));
        for (a, b) in score.annotations.iter().zip(gradcam.annotations.iter()) {
            assert_eq!((a.x, a.y), (b.x, b.y));
            assert!((a.score().unwrap() - b.score().unwrap()).abs() < 1e-4);
        }
    }
}
