//! パディング正規化
//!
//! 画像の高さ・幅をパッチサイズの倍数に揃え、元画像を中央に配置します。

use ndarray::{s, Array3, ArrayView3};

use crate::engine::error::{EngineError, EngineResult};
use crate::types::{PaddingOffset, PatchSize};

/// 背景色（白）
pub const DEFAULT_BACKGROUND: u8 = 255;

/// パディング済み画像
#[derive(Debug, Clone)]
pub struct PaddedImage {
    pub image: Array3<u8>,
    pub offset: PaddingOffset,
}

impl PaddedImage {
    pub fn height(&self) -> usize {
        self.image.dim().0
    }

    pub fn width(&self) -> usize {
        self.image.dim().1
    }

    pub fn channels(&self) -> usize {
        self.image.dim().2
    }
}

/// `len` 以上で最小の `patch` の倍数
pub fn padded_extent(len: usize, patch: usize) -> usize {
    len + (patch - len % patch) % patch
}

/// 画像をパッチサイズの倍数へパディング
///
/// 追加分は `floor(extra/2)` を左(上)、`ceil(extra/2)` を右(下)に割り当てる。
pub fn pad_to_patch_multiple(
    image: ArrayView3<u8>,
    patch: PatchSize,
    background: u8,
) -> EngineResult<PaddedImage> {
    patch.validate()?;
    let (height, width, channels) = image.dim();
    if height == 0 || width == 0 || channels == 0 {
        return Err(EngineError::InputShape(format!(
            "image has zero area: {}x{}x{}",
            height, width, channels
        )));
    }

    let padded_h = padded_extent(height, patch.height);
    let padded_w = padded_extent(width, patch.width);
    let extra_h = padded_h - height;
    let extra_w = padded_w - width;

    let offset = PaddingOffset {
        left: extra_w / 2,
        right: extra_w - extra_w / 2,
        top: extra_h / 2,
        bottom: extra_h - extra_h / 2,
    };

    let mut padded = Array3::from_elem((padded_h, padded_w, channels), background);
    padded
        .slice_mut(s![
            offset.top..offset.top + height,
            offset.left..offset.left + width,
            ..
        ])
        .assign(&image);

    log::debug!(
        "padded {}x{} -> {}x{} (offset {:?})",
        height,
        width,
        padded_h,
        padded_w,
        offset
    );

    Ok(PaddedImage {
        image: padded,
        offset,
    })
}

/// [0,1] の浮動小数点画像を 8bit 画像に変換
///
/// エンジンの入口は u8 画像なので、浮動小数点画像は呼び出し前に一度だけ変換する。
/// 範囲外・非有限の値は `InputShape` エラー。
pub fn quantize_unit_image(image: ArrayView3<f32>) -> EngineResult<Array3<u8>> {
    if let Some(bad) = image.iter().find(|v| !(0.0..=1.0).contains(*v)) {
        return Err(EngineError::InputShape(format!(
            "float image values must lie in [0, 1], found {}",
            bad
        )));
    }
    Ok(image.mapv(|v| (v * 255.0).round() as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_quantize_unit_image() {
        let image = Array3::from_shape_vec((1, 4, 1), vec![0.0f32, 0.5, 0.2, 1.0]).unwrap();
        let quantized = quantize_unit_image(image.view()).unwrap();
        assert_eq!(quantized.iter().copied().collect::<Vec<_>>(), vec![0, 128, 51, 255]);

        for bad in [1.5f32, -0.1, f32::NAN] {
            let image = Array3::from_elem((2, 2, 1), bad);
            assert!(matches!(
                quantize_unit_image(image.view()),
                Err(EngineError::InputShape(_))
            ));
        }
    }

    #[test]
    fn test_pads_120_to_150_centered() {
        let image = Array3::<u8>::zeros((120, 120, 1));
        let padded = pad_to_patch_multiple(image.view(), PatchSize::square(50), 255).unwrap();

        assert_eq!(padded.image.dim(), (150, 150, 1));
        assert_eq!(
            padded.offset,
            PaddingOffset { left: 15, right: 15, top: 15, bottom: 15 }
        );
        // ボーダーは背景色、元画像領域はそのまま
        assert_eq!(padded.image[[0, 0, 0]], 255);
        assert_eq!(padded.image[[14, 80, 0]], 255);
        assert_eq!(padded.image[[15, 15, 0]], 0);
        assert_eq!(padded.image[[134, 134, 0]], 0);
        assert_eq!(padded.image[[135, 134, 0]], 255);
    }

    #[test]
    fn test_odd_extra_goes_right_and_bottom() {
        let image = Array3::<u8>::zeros((7, 9, 3));
        let padded = pad_to_patch_multiple(image.view(), PatchSize::new(4, 6), 200).unwrap();

        assert_eq!(padded.image.dim(), (8, 12, 3));
        assert_eq!(
            padded.offset,
            PaddingOffset { left: 1, right: 2, top: 0, bottom: 1 }
        );
        assert_eq!(padded.image[[7, 5, 2]], 200);
    }

    #[test]
    fn test_exact_multiple_adds_no_border() {
        let image = Array3::<u8>::from_elem((100, 50, 3), 7);
        let padded = pad_to_patch_multiple(image.view(), PatchSize::square(50), 255).unwrap();

        assert_eq!(padded.offset, PaddingOffset::default());
        assert_eq!(padded.image, image);
    }

    #[test]
    fn test_padding_is_minimal_for_random_sizes() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let h = rng.gen_range(1..300);
            let w = rng.gen_range(1..300);
            let ph = rng.gen_range(1..64);
            let pw = rng.gen_range(1..64);
            let image = Array3::<u8>::zeros((h, w, 1));
            let padded = pad_to_patch_multiple(image.view(), PatchSize::new(ph, pw), 255).unwrap();

            assert_eq!(padded.height() % ph, 0);
            assert_eq!(padded.width() % pw, 0);
            assert!(padded.height() - h < ph);
            assert!(padded.width() - w < pw);
            assert_eq!(padded.offset.left + padded.offset.right, padded.width() - w);
            assert_eq!(padded.offset.top + padded.offset.bottom, padded.height() - h);
        }
    }

    #[test]
    fn test_zero_area_is_rejected() {
        let image = Array3::<u8>::zeros((0, 10, 3));
        let err = pad_to_patch_multiple(image.view(), PatchSize::square(5), 255).unwrap_err();
        assert!(matches!(err, EngineError::InputShape(_)));
    }

    #[test]
    fn test_zero_patch_is_configuration_error() {
        let image = Array3::<u8>::zeros((10, 10, 3));
        let err = pad_to_patch_multiple(image.view(), PatchSize::new(0, 5), 255).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
