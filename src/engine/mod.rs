//! タイル推論・説明オーバーレイエンジン
//!
//! 呼び出しの流れ:
//! パディング → タイル推論（分類器 or Grad-CAM） → 合成 + 注釈
//!
//! エンジンは状態を持たず、同じ画像とモデルハンドルに対して常に同じ結果を返します。

pub mod annotations;
pub mod classifier;
pub mod codec;
pub mod colormap;
pub mod compositor;
pub mod error;
pub mod gradcam;
pub mod padding;
pub mod roi;
pub mod tiling;

use ndarray::{Array2, Array3, ArrayView3};

use crate::types::{Annotation, OverlayMode, PaddingOffset};
use annotations::build_annotations;
use classifier::ModelHandle;
use codec::{EncodedImage, OverlayResponse};
use compositor::{blend, score_heatmap, OverlaySettings};
use error::{EngineError, EngineResult};
use padding::{pad_to_patch_multiple, quantize_unit_image};
use tiling::{assemble_gradcam, assemble_score_mask, TileExecutor, TileMode};

pub use classifier::PatchClassifier;

/// 確率着色モードの結果
#[derive(Debug, Clone)]
pub struct ScoreOverlay {
    /// パディング後の形状 (H', W', C)
    pub overlay: Array3<u8>,
    pub annotations: Vec<Annotation>,
    pub score_mask: Array2<f32>,
    pub offset: PaddingOffset,
}

/// Grad-CAM モードの結果
#[derive(Debug, Clone)]
pub struct GradCamOverlay {
    pub overlay: Array3<u8>,
    /// 着色したヒートマップ (H', W', 3)
    pub heatmap: Array3<u8>,
    pub annotations: Vec<Annotation>,
    pub offset: PaddingOffset,
}

/// モード共通の結果
#[derive(Debug, Clone)]
pub enum OverlayOutput {
    Score(ScoreOverlay),
    GradCam(GradCamOverlay),
}

impl OverlayOutput {
    pub fn overlay(&self) -> &Array3<u8> {
        match self {
            OverlayOutput::Score(o) => &o.overlay,
            OverlayOutput::GradCam(o) => &o.overlay,
        }
    }

    pub fn annotations(&self) -> &[Annotation] {
        match self {
            OverlayOutput::Score(o) => &o.annotations,
            OverlayOutput::GradCam(o) => &o.annotations,
        }
    }

    pub fn heatmap(&self) -> Option<&Array3<u8>> {
        match self {
            OverlayOutput::Score(_) => None,
            OverlayOutput::GradCam(o) => Some(&o.heatmap),
        }
    }

    /// 転送用レスポンスに変換
    pub fn to_response(&self) -> OverlayResponse {
        OverlayResponse {
            roi: EncodedImage::encode(self.overlay().view()),
            heatmap: self.heatmap().map(|h| EncodedImage::encode(h.view())),
            annotations: self.annotations().to_vec(),
        }
    }
}

/// オーバーレイエンジン
///
/// 合成パラメータとタイル実行方式を保持する。モデルハンドルは呼び出しごとに渡す。
pub struct OverlayEngine {
    settings: OverlaySettings,
    executor: TileExecutor,
    gradcam_target: Option<usize>,
}

impl Default for OverlayEngine {
    fn default() -> Self {
        Self {
            settings: OverlaySettings::default(),
            executor: TileExecutor::sequential(),
            gradcam_target: None,
        }
    }
}

impl OverlayEngine {
    pub fn new(
        settings: OverlaySettings,
        workers: usize,
        gradcam_target: Option<usize>,
    ) -> EngineResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            executor: TileExecutor::with_workers(workers)?,
            gradcam_target,
        })
    }

    pub fn settings(&self) -> &OverlaySettings {
        &self.settings
    }

    fn check_channels(image: &ArrayView3<u8>, handle: &ModelHandle) -> EngineResult<()> {
        let channels = image.dim().2;
        if channels != handle.input_channels() {
            return Err(EngineError::InputShape(format!(
                "image has {} channels but model '{}' expects {}",
                channels,
                handle.name(),
                handle.input_channels()
            )));
        }
        Ok(())
    }

    /// パッチごとの陽性確率で着色したオーバーレイと注釈
    pub fn score_overlay(&self, image: ArrayView3<u8>, handle: &ModelHandle) -> EngineResult<ScoreOverlay> {
        Self::check_channels(&image, handle)?;
        let patch = handle.patch_size();
        let padded = pad_to_patch_multiple(image, patch, self.settings.background)?;
        let (height, width, _) = padded.image.dim();

        log::info!(
            "[{}] {}: padded {}x{} -> {} tiles",
            handle.name(),
            OverlayMode::TintPatches,
            height,
            width,
            (height / patch.height) * (width / patch.width)
        );

        let outcomes = self.executor.run(padded.image.view(), handle, TileMode::Score)?;
        let score_mask = assemble_score_mask(&outcomes, height, width, patch);
        let heatmap = score_heatmap(score_mask.view(), &self.settings)?;
        let overlay = blend(heatmap.view(), padded.image.view(), self.settings.score_alpha);

        Ok(ScoreOverlay {
            overlay,
            annotations: build_annotations(&outcomes, patch),
            score_mask,
            offset: padded.offset,
        })
    }

    /// Grad-CAM ヒートマップで着色したオーバーレイ、生ヒートマップと注釈
    pub fn gradcam_overlay(&self, image: ArrayView3<u8>, handle: &ModelHandle) -> EngineResult<GradCamOverlay> {
        Self::check_channels(&image, handle)?;
        let patch = handle.patch_size();
        let padded = pad_to_patch_multiple(image, patch, self.settings.background)?;
        let (height, width, _) = padded.image.dim();

        log::info!(
            "[{}] {} (layer '{}'): padded {}x{} -> {} tiles",
            handle.name(),
            OverlayMode::GradCam,
            handle.gradcam_layer(),
            height,
            width,
            (height / patch.height) * (width / patch.width)
        );

        let mode = TileMode::GradCam {
            alpha: self.settings.gradcam_alpha,
            target_class: self.gradcam_target,
        };
        let outcomes = self.executor.run(padded.image.view(), handle, mode)?;
        let (overlay, heatmap) = assemble_gradcam(&outcomes, padded.image.view(), patch);

        Ok(GradCamOverlay {
            overlay,
            heatmap,
            annotations: build_annotations(&outcomes, patch),
            offset: padded.offset,
        })
    }

    /// モードに応じたオーバーレイを実行
    pub fn run(
        &self,
        mode: OverlayMode,
        image: ArrayView3<u8>,
        handle: &ModelHandle,
    ) -> EngineResult<OverlayOutput> {
        match mode {
            OverlayMode::TintPatches => self.score_overlay(image, handle).map(OverlayOutput::Score),
            OverlayMode::GradCam => self.gradcam_overlay(image, handle).map(OverlayOutput::GradCam),
        }
    }

    /// [0,1] の浮動小数点画像を 8bit に変換してから `run` する
    pub fn run_unit_float(
        &self,
        mode: OverlayMode,
        image: ArrayView3<f32>,
        handle: &ModelHandle,
    ) -> EngineResult<OverlayOutput> {
        let image = quantize_unit_image(image)?;
        self.run(mode, image.view(), handle)
    }
}

/// 既定設定での確率着色オーバーレイ
pub fn score_overlay(image: ArrayView3<u8>, handle: &ModelHandle) -> EngineResult<(Array3<u8>, Vec<Annotation>)> {
    let result = OverlayEngine::default().score_overlay(image, handle)?;
    Ok((result.overlay, result.annotations))
}

/// 既定設定での Grad-CAM オーバーレイ
pub fn gradcam_overlay(
    image: ArrayView3<u8>,
    handle: &ModelHandle,
) -> EngineResult<(Array3<u8>, Array3<u8>, Vec<Annotation>)> {
    let result = OverlayEngine::default().gradcam_overlay(image, handle)?;
    Ok((result.overlay, result.heatmap, result.annotations))
}

/// 指定の合成パラメータでモードに応じたオーバーレイを実行（逐次実行、Grad-CAM は陽性クラス対象）
pub fn run_overlay(
    mode: OverlayMode,
    image: ArrayView3<u8>,
    handle: &ModelHandle,
    settings: &OverlaySettings,
) -> EngineResult<OverlayOutput> {
    OverlayEngine::new(settings.clone(), 1, None)?.run(mode, image, handle)
}
