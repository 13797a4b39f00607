//! パッチ分類器の契約とモデルハンドル

use ndarray::ArrayView3;
use std::sync::Arc;

use crate::engine::error::{ClassifierError, EngineError, EngineResult};
use crate::engine::gradcam::LayerGradients;
use crate::engine::tiling::check_probability;
use crate::types::PatchSize;

/// 二値パッチ分類器
///
/// 入力パッチは (H, W, C) で [0,1] に正規化済み。
/// 出力は陽性クラス（IDC）の確率。推論呼び出しで内部状態を変更してはならない。
pub trait PatchClassifier: Send + Sync {
    /// 入力チャネル数
    fn input_channels(&self) -> usize;

    /// Grad-CAM に使用可能なレイヤー名
    fn layer_names(&self) -> Vec<String>;

    /// パッチの陽性確率を返す
    fn predict(&self, patch: ArrayView3<f32>) -> Result<f32, ClassifierError>;

    /// 指定レイヤーの活性と、対象クラススコアの勾配を返す
    ///
    /// `target_class` が `None` の場合は陽性クラス（モデル出力 p そのもの）を対象にする。
    /// `Some(0)` は陰性クラスのスコア `1 - p`、`Some(1)` は `p`。
    fn layer_gradients(
        &self,
        patch: ArrayView3<f32>,
        layer: &str,
        target_class: Option<usize>,
    ) -> Result<LayerGradients, ClassifierError>;
}

/// 陽性クラスの判定しきい値
pub const POSITIVE_THRESHOLD: f32 = 0.5;

/// 陽性クラス（IDC）のインデックス。Grad-CAM の既定の対象
pub const POSITIVE_CLASS: usize = 1;

/// 二値分類器の予測クラス
pub fn predicted_class(probability: f32) -> usize {
    if probability >= POSITIVE_THRESHOLD {
        1
    } else {
        0
    }
}

/// 二値分類器のクラススコア（クラス1 = p、クラス0 = 1 - p）
pub fn class_score(probability: f32, class_index: usize) -> Result<f32, ClassifierError> {
    match class_index {
        0 => Ok(1.0 - probability),
        1 => Ok(probability),
        other => Err(ClassifierError::Backend(format!(
            "class index {} is out of range for a binary classifier",
            other
        ))),
    }
}

/// 読み込み済みモデル
///
/// 構築後は不変。`Arc` で共有し、並行した推論呼び出しから読み取り専用で使う。
pub struct ModelHandle {
    name: String,
    patch_size: PatchSize,
    gradcam_layer: String,
    classifier: Arc<dyn PatchClassifier>,
}

impl ModelHandle {
    /// パッチサイズと Grad-CAM レイヤーを検証してハンドルを作成
    pub fn new(
        name: impl Into<String>,
        classifier: Arc<dyn PatchClassifier>,
        patch_size: PatchSize,
        gradcam_layer: impl Into<String>,
    ) -> EngineResult<Self> {
        let name = name.into();
        let gradcam_layer = gradcam_layer.into();
        patch_size.validate()?;

        if classifier.input_channels() == 0 {
            return Err(EngineError::Configuration(format!(
                "model '{}' declares zero input channels",
                name
            )));
        }

        let layers = classifier.layer_names();
        if !layers.iter().any(|l| l == &gradcam_layer) {
            return Err(EngineError::Configuration(format!(
                "model '{}' has no layer '{}' (available: {})",
                name,
                gradcam_layer,
                layers.join(", ")
            )));
        }

        log::info!(
            "model '{}' ready: patch {}, {} channels, grad-cam layer '{}'",
            name,
            patch_size,
            classifier.input_channels(),
            gradcam_layer
        );

        Ok(Self {
            name,
            patch_size,
            gradcam_layer,
            classifier,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patch_size(&self) -> PatchSize {
        self.patch_size
    }

    pub fn gradcam_layer(&self) -> &str {
        &self.gradcam_layer
    }

    pub fn input_channels(&self) -> usize {
        self.classifier.input_channels()
    }

    pub fn classifier(&self) -> &dyn PatchClassifier {
        self.classifier.as_ref()
    }

    /// 1枚のパッチ (PH, PW, C) を分類し、(陽性確率, 予測クラス) を返す
    ///
    /// 形状がモデル入力と異なる場合は `InputShape`。画素値は 1/255 で正規化する。
    pub fn classify_patch(&self, patch: ArrayView3<u8>) -> EngineResult<(f32, usize)> {
        let expected = (self.patch_size.height, self.patch_size.width, self.input_channels());
        if patch.dim() != expected {
            return Err(EngineError::InputShape(format!(
                "patch shape {:?} does not match model '{}' input {:?}",
                patch.dim(),
                self.name,
                expected
            )));
        }
        let normalized = patch.mapv(|v| v as f32 / 255.0);
        let probability = self
            .classifier
            .predict(normalized.view())
            .and_then(check_probability)
            .map_err(|source| EngineError::Inference {
                index: 0,
                row: 0,
                col: 0,
                source,
            })?;
        let class_index = predicted_class(probability);
        log::debug!("model '{}': p = {:.6}, class {}", self.name, probability, class_index);
        Ok((probability, class_index))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("patch_size", &self.patch_size)
            .field("input_channels", &self.input_channels())
            .field("gradcam_layer", &self.gradcam_layer)
            .finish()
    }
}
