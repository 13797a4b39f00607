use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::engine::error::EngineError;

/// パッチ（タイル）サイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSize {
    pub height: usize,
    pub width: usize,
}

impl PatchSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn square(size: usize) -> Self {
        Self::new(size, size)
    }

    /// 高さ・幅が共に正であることを確認
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.height == 0 || self.width == 0 {
            return Err(EngineError::Configuration(format!(
                "patch size must be positive, got {}x{}",
                self.height, self.width
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for PatchSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// パディング量（上下左右のボーダー幅）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingOffset {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

/// タイルごとの注釈
///
/// 座標はパディング後の画像空間でのタイル中心。
/// 並び順はラスター順（上から下、左から右）で、利用側はこの順序に依存する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub x: usize,
    pub y: usize,
    pub text: String,
}

impl Annotation {
    pub fn new(x: usize, y: usize, score: f32) -> Self {
        Self {
            x,
            y,
            text: format!("{:.6}", score),
        }
    }

    /// テキストからスコアを復元
    pub fn score(&self) -> Option<f32> {
        self.text.parse().ok()
    }

    /// パディング前の画像座標へ変換
    ///
    /// ボーダー上のタイル中心は元画像の外側になり得るため、符号付きで返す。
    pub fn to_original_space(&self, offset: &PaddingOffset) -> (i64, i64) {
        (
            self.x as i64 - offset.left as i64,
            self.y as i64 - offset.top as i64,
        )
    }
}

/// オーバーレイの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayMode {
    /// パッチごとの確率で着色
    #[serde(rename = "Tint patches")]
    TintPatches,
    /// Grad-CAMヒートマップで着色
    #[serde(rename = "Grad-Cam")]
    GradCam,
}

impl std::fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlayMode::TintPatches => write!(f, "Tint patches"),
            OverlayMode::GradCam => write!(f, "Grad-Cam"),
        }
    }
}

impl FromStr for OverlayMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tint" | "tint patches" | "tint_patches" => Ok(OverlayMode::TintPatches),
            "gradcam" | "grad-cam" | "grad_cam" => Ok(OverlayMode::GradCam),
            _ => Err(EngineError::Configuration(format!(
                "unknown overlay mode: {}",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_text_has_six_decimals() {
        let a = Annotation::new(25, 75, 0.873421);
        assert_eq!(a.text, "0.873421");
        assert_eq!(a.score(), Some(0.873421));
    }

    #[test]
    fn test_annotation_serializes_as_x_y_text() {
        let a = Annotation::new(25, 75, 0.5);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json, serde_json::json!({"x": 25, "y": 75, "text": "0.500000"}));
    }

    #[test]
    fn test_to_original_space() {
        let offset = PaddingOffset { left: 15, right: 15, top: 10, bottom: 11 };
        let a = Annotation::new(25, 5, 0.1);
        assert_eq!(a.to_original_space(&offset), (10, -5));
    }

    #[test]
    fn test_overlay_mode_names() {
        assert_eq!("Tint patches".parse::<OverlayMode>().unwrap(), OverlayMode::TintPatches);
        assert_eq!("gradcam".parse::<OverlayMode>().unwrap(), OverlayMode::GradCam);
        assert!("heat".parse::<OverlayMode>().is_err());

        let json = serde_json::to_string(&OverlayMode::GradCam).unwrap();
        assert_eq!(json, "\"Grad-Cam\"");
        assert_eq!(format!("{}", OverlayMode::TintPatches), "Tint patches");
    }

    #[test]
    fn test_patch_size_validate() {
        assert!(PatchSize::square(50).validate().is_ok());
        assert!(PatchSize::new(0, 50).validate().is_err());
    }
}
