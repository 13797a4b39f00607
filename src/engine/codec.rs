//! ピクセルバッファの転送用エンコード
//!
//! (H, W, C) の u8 配列を行優先の生バイト列として base64 で包みます。
//! デコード結果はエンコード前と完全に一致します。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::types::Annotation;

/// 形状付きのエンコード済み画像
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    /// base64 (標準アルファベット)
    pub data: String,
}

impl EncodedImage {
    pub fn encode(image: ArrayView3<u8>) -> Self {
        let (height, width, channels) = image.dim();
        // 非連続なビューでも論理順（行優先）で並べる
        let raw: Vec<u8> = image.iter().copied().collect();
        Self {
            height,
            width,
            channels,
            data: STANDARD.encode(raw),
        }
    }

    pub fn decode(&self) -> EngineResult<Array3<u8>> {
        let raw = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| EngineError::Codec(format!("invalid base64: {}", e)))?;
        let expected = self.height * self.width * self.channels;
        if raw.len() != expected {
            return Err(EngineError::Codec(format!(
                "buffer has {} bytes, shape {}x{}x{} needs {}",
                raw.len(),
                self.height,
                self.width,
                self.channels,
                expected
            )));
        }
        Array3::from_shape_vec((self.height, self.width, self.channels), raw)
            .map_err(|e| EngineError::Codec(e.to_string()))
    }
}

/// 転送層向けのレスポンス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayResponse {
    pub roi: EncodedImage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap: Option<EncodedImage>,
    pub annotations: Vec<Annotation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn test_encode_decode_is_bit_identical() {
        let image = Array3::from_shape_fn((7, 5, 3), |(y, x, c)| (y * 31 + x * 7 + c) as u8);
        let encoded = EncodedImage::encode(image.view());
        assert_eq!((encoded.height, encoded.width, encoded.channels), (7, 5, 3));
        assert_eq!(encoded.decode().unwrap(), image);
    }

    #[test]
    fn test_encode_non_contiguous_view() {
        let image = Array3::from_shape_fn((6, 6, 1), |(y, x, _)| (y * 6 + x) as u8);
        let view = image.slice(s![1..4, 2..5, ..]);
        let decoded = EncodedImage::encode(view).decode().unwrap();
        assert_eq!(decoded, view.to_owned());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let mut encoded = EncodedImage::encode(Array3::<u8>::zeros((2, 2, 1)).view());
        encoded.height = 3;
        assert!(matches!(encoded.decode(), Err(EngineError::Codec(_))));

        encoded.data = "***".to_string();
        assert!(matches!(encoded.decode(), Err(EngineError::Codec(_))));
    }

    #[test]
    fn test_response_json_shape() {
        let response = OverlayResponse {
            roi: EncodedImage::encode(Array3::<u8>::zeros((1, 1, 1)).view()),
            heatmap: None,
            annotations: vec![Annotation::new(25, 25, 0.5)],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("heatmap").is_none());
        assert_eq!(json["annotations"][0]["text"], "0.500000");
    }
}
