//! jet カラーマップ
//!
//! matplotlib の `jet` と同じ区分線形の定義点を使います。

type Anchors = &'static [(f32, f32)];

const RED: Anchors = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const GREEN: Anchors = &[
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const BLUE: Anchors = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

fn interpolate(anchors: Anchors, x: f32) -> f32 {
    let mut i = 0;
    while i + 2 < anchors.len() && x > anchors[i + 1].0 {
        i += 1;
    }
    let (x0, y0) = anchors[i];
    let (x1, y1) = anchors[i + 1];
    let t = if x1 > x0 { ((x - x0) / (x1 - x0)).clamp(0.0, 1.0) } else { 0.0 };
    y0 + t * (y1 - y0)
}

/// [0,1] の値を jet の RGB に変換
pub fn jet_unit(value: f32) -> [u8; 3] {
    let x = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let to_u8 = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    [
        to_u8(interpolate(RED, x)),
        to_u8(interpolate(GREEN, x)),
        to_u8(interpolate(BLUE, x)),
    ]
}

/// 8bit の強度を jet の RGB に変換
pub fn jet(value: u8) -> [u8; 3] {
    jet_unit(value as f32 / 255.0)
}

/// RGB の輝度 (ITU-R BT.601)
pub fn luma(rgb: [u8; 3]) -> u8 {
    let y = 0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32;
    y.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jet_endpoints() {
        // 低値は暗い青、高値は暗い赤
        assert_eq!(jet(0), [0, 0, 128]);
        assert_eq!(jet(255), [128, 0, 0]);
    }

    #[test]
    fn test_jet_midpoint_is_greenish() {
        let [r, g, b] = jet_unit(0.5);
        assert!(g > 200);
        assert!(r < 200 && b < 200);
    }

    #[test]
    fn test_non_finite_maps_to_low_end() {
        assert_eq!(jet_unit(f32::NAN), jet(0));
        assert_eq!(jet_unit(7.0), jet(255));
    }

    #[test]
    fn test_luma_of_gray_is_identity() {
        assert_eq!(luma([90, 90, 90]), 90);
        assert_eq!(luma([255, 255, 255]), 255);
    }
}
