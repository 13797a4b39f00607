//! オーバーレイ合成
//!
//! スコアマスクをぼかして jet で着色し、元画像とアルファブレンドします。

use image::{GrayImage, Luma};
use imageproc::filter::separable_filter_equal;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::engine::colormap::{jet, luma};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::padding::DEFAULT_BACKGROUND;

/// 合成パラメータ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlaySettings {
    /// スコアモードでのヒートマップの重み（元画像は 1 - alpha）
    pub score_alpha: f32,
    /// Grad-CAMモードでのヒートマップの重み
    pub gradcam_alpha: f32,
    /// ガウシアンぼかしのカーネルサイズ（奇数）
    pub blur_kernel: usize,
    /// ガウシアンぼかしのシグマ
    pub blur_sigma: f32,
    /// パディングの背景色
    pub background: u8,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            score_alpha: 0.3,
            gradcam_alpha: 0.3,
            blur_kernel: 9,
            blur_sigma: 7.0,
            background: DEFAULT_BACKGROUND,
        }
    }
}

impl OverlaySettings {
    pub fn validate(&self) -> EngineResult<()> {
        for (name, alpha) in [("score_alpha", self.score_alpha), ("gradcam_alpha", self.gradcam_alpha)] {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(EngineError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, alpha
                )));
            }
        }
        if self.blur_kernel == 0 || self.blur_kernel % 2 == 0 {
            return Err(EngineError::Configuration(format!(
                "blur_kernel must be a positive odd number, got {}",
                self.blur_kernel
            )));
        }
        if !(self.blur_sigma > 0.0) {
            return Err(EngineError::Configuration(format!(
                "blur_sigma must be positive, got {}",
                self.blur_sigma
            )));
        }
        Ok(())
    }
}

/// 正規化済み1次元ガウシアンカーネル
pub fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let center = (size as f32 - 1.0) / 2.0;
    let weights: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

fn to_gray_image(mask: ArrayView2<u8>) -> EngineResult<GrayImage> {
    let (h, w) = mask.dim();
    GrayImage::from_raw(w as u32, h as u32, mask.iter().copied().collect())
        .ok_or_else(|| EngineError::InputShape(format!("cannot view {}x{} mask as image", h, w)))
}

/// 8bit マスクに固定サイズのガウシアンぼかしをかける
pub fn blur_mask(mask: ArrayView2<u8>, kernel_size: usize, sigma: f32) -> EngineResult<Array2<u8>> {
    let (h, w) = mask.dim();
    let gray = to_gray_image(mask)?;
    let kernel = gaussian_kernel(kernel_size, sigma);
    let blurred: image::ImageBuffer<Luma<u8>, Vec<u8>> = separable_filter_equal(&gray, &kernel);
    Array2::from_shape_vec((h, w), blurred.into_raw())
        .map_err(|e| EngineError::InputShape(format!("blurred mask shape: {}", e)))
}

/// 8bit 強度を jet で RGB に着色 (H, W, 3)
pub fn colorize(intensity: ArrayView2<u8>) -> Array3<u8> {
    let (h, w) = intensity.dim();
    let mut out = Array3::<u8>::zeros((h, w, 3));
    for ((y, x), &v) in intensity.indexed_iter() {
        let rgb = jet(v);
        for c in 0..3 {
            out[[y, x, c]] = rgb[c];
        }
    }
    out
}

/// スコアマスク [0,1] をぼかし済みのカラーヒートマップに変換
pub fn score_heatmap(score_mask: ArrayView2<f32>, settings: &OverlaySettings) -> EngineResult<Array3<u8>> {
    // 255倍して小数部は切り捨て
    let intensity = score_mask.mapv(|p| (p * 255.0).clamp(0.0, 255.0) as u8);
    let blurred = blur_mask(intensity.view(), settings.blur_kernel, settings.blur_sigma)?;
    Ok(colorize(blurred.view()))
}

#[inline]
fn mix(heat: u8, source: u8, alpha: f32) -> u8 {
    (alpha * heat as f32 + (1.0 - alpha) * source as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// `alpha * heatmap + (1 - alpha) * source`
///
/// 出力は `source` と同じ形状。1〜2チャネルの画像にはヒートマップの輝度を、
/// 3チャネル以上には RGB をそのまま合成し、アルファチャネルは元画像を引き継ぐ。
pub fn blend(heatmap: ArrayView3<u8>, source: ArrayView3<u8>, alpha: f32) -> Array3<u8> {
    let (h, w, channels) = source.dim();
    debug_assert_eq!(heatmap.dim(), (h, w, 3));

    let mut out = source.to_owned();
    for y in 0..h {
        for x in 0..w {
            let rgb = [heatmap[[y, x, 0]], heatmap[[y, x, 1]], heatmap[[y, x, 2]]];
            if channels < 3 {
                out[[y, x, 0]] = mix(luma(rgb), source[[y, x, 0]], alpha);
            } else {
                for c in 0..3 {
                    out[[y, x, c]] = mix(rgb[c], source[[y, x, c]], alpha);
                }
            }
        }
    }
    out
}
