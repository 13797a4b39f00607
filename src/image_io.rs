//! 画像ファイルと (H, W, C) 配列の相互変換

use anyhow::{Context, Result};
use image::{ColorType, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use ndarray::{Array3, ArrayView3};
use std::path::Path;

/// 画像を読み込んで (H, W, C) の u8 配列にする
///
/// グレースケール → 1ch、グレースケール+α → 2ch、RGB → 3ch、RGBA → 4ch。
/// 16bit 画像は 8bit に落とす。
pub fn load_image_array(path: &Path) -> Result<Array3<u8>> {
    let img = image::open(path).with_context(|| format!("Failed to open image: {:?}", path))?;
    let (width, height) = (img.width() as usize, img.height() as usize);

    let (channels, raw) = match img.color() {
        ColorType::L8 | ColorType::L16 => (1, img.into_luma8().into_raw()),
        ColorType::La8 | ColorType::La16 => (2, img.into_luma_alpha8().into_raw()),
        color if color.has_alpha() => (4, img.into_rgba8().into_raw()),
        _ => (3, img.into_rgb8().into_raw()),
    };

    log::debug!("loaded {:?}: {}x{}x{}", path, height, width, channels);
    Array3::from_shape_vec((height, width, channels), raw).context("Image buffer has unexpected size")
}

fn save_buffer<P>(path: &Path, width: u32, height: u32, raw: Vec<u8>) -> Result<()>
where
    P: image::Pixel<Subpixel = u8> + image::PixelWithColorType,
    [P::Subpixel]: image::EncodableLayout,
{
    let buffer = ImageBuffer::<P, Vec<u8>>::from_raw(width, height, raw)
        .ok_or_else(|| anyhow::anyhow!("Image buffer has unexpected size"))?;
    buffer
        .save(path)
        .with_context(|| format!("Failed to save image: {:?}", path))
}

/// (H, W, C) 配列を画像として保存（拡張子で形式を決める）
pub fn save_image_array(path: &Path, image: ArrayView3<u8>) -> Result<()> {
    let (height, width, channels) = image.dim();
    let raw: Vec<u8> = image.iter().copied().collect();
    let (w, h) = (width as u32, height as u32);

    match channels {
        1 => save_buffer::<Luma<u8>>(path, w, h, raw),
        2 => save_buffer::<LumaA<u8>>(path, w, h, raw),
        3 => save_buffer::<Rgb<u8>>(path, w, h, raw),
        4 => save_buffer::<Rgba<u8>>(path, w, h, raw),
        other => anyhow::bail!("Cannot save an image with {} channels", other),
    }
}
