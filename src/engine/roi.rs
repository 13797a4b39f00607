//! ROI（関心領域）の切り出し

use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// UI上で描かれた矩形（角の順序は任意）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiRect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl RoiRect {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// 整数に切り捨て、左上・右下の順に並べた (x0, y0, x1, y1)
    pub fn normalized(&self) -> (i64, i64, i64, i64) {
        let (ax, ay) = (self.x0.trunc() as i64, self.y0.trunc() as i64);
        let (bx, by) = (self.x1.trunc() as i64, self.y1.trunc() as i64);
        (ax.min(bx), ay.min(by), ax.max(bx), ay.max(by))
    }
}

/// 画像から ROI を切り出す
///
/// 幅または高さが 0 の選択は `Ok(None)`（未選択扱い）。
/// 画像範囲をはみ出す矩形はエラーにする。
pub fn select_roi(image: ArrayView3<u8>, rect: &RoiRect) -> EngineResult<Option<Array3<u8>>> {
    let (height, width, _) = image.dim();
    let (x0, y0, x1, y1) = rect.normalized();

    if x0 == x1 || y0 == y1 {
        return Ok(None);
    }

    if x0 < 0 || y0 < 0 || x1 as usize > width || y1 as usize > height {
        let clip = |v: i64| v.max(0) as usize;
        return Err(EngineError::RoiOutOfBounds {
            x0: clip(x0),
            y0: clip(y0),
            x1: clip(x1),
            y1: clip(y1),
            width,
            height,
        });
    }

    let roi = image
        .slice(s![y0 as usize..y1 as usize, x0 as usize..x1 as usize, ..])
        .to_owned();
    Ok(Some(roi))
}
