//! Grad-CAM
//!
//! 畳み込み層の活性と、その活性に対するクラススコアの勾配から
//! クラス活性化マップを計算し、タイル解像度のカラーヒートマップに変換します。

use image::imageops::{resize, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::{Array2, Array3, ArrayView3, Axis};

use crate::engine::colormap::jet_unit;
use crate::engine::compositor::blend;
use crate::engine::error::ClassifierError;

/// 分類器から取り出した指定レイヤーの活性と勾配
#[derive(Debug, Clone)]
pub struct LayerGradients {
    /// 活性 (C, h, w)
    pub activations: Array3<f32>,
    /// 対象クラススコアの活性に対する勾配 (C, h, w)
    pub gradients: Array3<f32>,
    /// 陽性クラスの確率
    pub probability: f32,
    /// 勾配を計算したクラス
    pub class_index: usize,
}

/// Grad-CAM 済みのタイル
#[derive(Debug, Clone)]
pub struct GradCamTile {
    /// ヒートマップと元タイルの合成 (PH, PW, C)
    pub tinted: Array3<u8>,
    /// 着色したヒートマップ (PH, PW, 3)
    pub heatmap: Array3<u8>,
}

/// クラス活性化マップを [0,1] で計算
///
/// チャネルごとの重みは勾配の空間平均。負値は 0 に切り、最大値で割る。
/// 最大値が 0 の場合は全て 0 を返す。
pub fn class_activation_map(
    activations: ArrayView3<f32>,
    gradients: ArrayView3<f32>,
) -> Result<Array2<f32>, ClassifierError> {
    if activations.dim() != gradients.dim() {
        return Err(ClassifierError::Backend(format!(
            "activation shape {:?} differs from gradient shape {:?}",
            activations.dim(),
            gradients.dim()
        )));
    }
    let (channels, h, w) = activations.dim();
    if channels == 0 || h == 0 || w == 0 {
        return Err(ClassifierError::Backend(format!(
            "empty activation map {:?}",
            activations.dim()
        )));
    }

    let weights = gradients
        .mean_axis(Axis(1))
        .and_then(|m| m.mean_axis(Axis(1)))
        .ok_or_else(|| ClassifierError::Backend("cannot average gradients".to_string()))?;

    let mut cam = Array2::<f32>::zeros((h, w));
    for (weight, channel) in weights.iter().zip(activations.axis_iter(Axis(0))) {
        cam.scaled_add(*weight, &channel);
    }
    cam.mapv_inplace(|v| if v > 0.0 { v } else { 0.0 });

    let max = cam.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 && max.is_finite() {
        cam.mapv_inplace(|v| v / max);
    } else {
        cam.fill(0.0);
    }
    Ok(cam)
}

/// 低解像度のヒートマップをバイリニア補間でタイルサイズに拡大
pub fn resize_heatmap(
    heatmap: &Array2<f32>,
    height: usize,
    width: usize,
) -> Result<Array2<f32>, ClassifierError> {
    let (h, w) = heatmap.dim();
    if (h, w) == (height, width) {
        return Ok(heatmap.clone());
    }
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(w as u32, h as u32, heatmap.iter().copied().collect())
            .ok_or_else(|| ClassifierError::Backend(format!("invalid heatmap shape {}x{}", h, w)))?;
    let resized = resize(&buffer, width as u32, height as u32, FilterType::Triangle);
    let values: Vec<f32> = resized.into_raw().into_iter().map(|v| v.clamp(0.0, 1.0)).collect();
    Array2::from_shape_vec((height, width), values)
        .map_err(|e| ClassifierError::Backend(format!("resized heatmap shape: {}", e)))
}

/// タイルサイズのマップを着色し、タイルと合成
pub fn render_gradcam_tile(tile: ArrayView3<u8>, cam: &Array2<f32>, alpha: f32) -> GradCamTile {
    let (h, w, _) = tile.dim();
    let mut heatmap = Array3::<u8>::zeros((h, w, 3));
    for ((y, x), &v) in cam.indexed_iter() {
        // 8bit に量子化してから着色
        let rgb = jet_unit((255.0 * v).floor() / 255.0);
        for c in 0..3 {
            heatmap[[y, x, c]] = rgb[c];
        }
    }
    let tinted = blend(heatmap.view(), tile, alpha);
    GradCamTile { tinted, heatmap }
}
