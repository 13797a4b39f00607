//! タイル注釈の生成・集計・CSV入出力

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::path::Path;

use crate::engine::tiling::TileOutcome;
use crate::types::{Annotation, PatchSize};

/// タイル結果からラスター順の注釈を作成
pub fn build_annotations(outcomes: &[TileOutcome], patch: PatchSize) -> Vec<Annotation> {
    outcomes
        .iter()
        .map(|o| {
            Annotation::new(
                o.spec.col + patch.width / 2,
                o.spec.row + patch.height / 2,
                o.probability,
            )
        })
        .collect()
}

/// スコアが `threshold` 以上のタイルの割合
///
/// 注釈が空の場合は 0。スコアを読めない注釈は陰性として数える。
pub fn positive_fraction(annotations: &[Annotation], threshold: f32) -> f32 {
    if annotations.is_empty() {
        return 0.0;
    }
    let positives = annotations
        .iter()
        .filter(|a| a.score().map_or(false, |s| s >= threshold))
        .count();
    positives as f32 / annotations.len() as f32
}

/// 注釈を `x,y,text` 形式のCSVに保存
pub fn save_annotations_csv(path: &Path, annotations: &[Annotation]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create annotations CSV: {:?}", path))?;
    for annotation in annotations {
        writer.serialize(annotation)?;
    }
    writer.flush()?;
    Ok(())
}

/// CSVから注釈を読み込む（順序は保持）
pub fn load_annotations_csv(path: &Path) -> Result<Vec<Annotation>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open annotations CSV: {:?}", path))?;

    let mut annotations = Vec::new();
    for result in reader.deserialize() {
        let annotation: Annotation = result?;
        annotations.push(annotation);
    }
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tiling::TileSpec;

    fn outcome(index: usize, row: usize, col: usize, probability: f32) -> TileOutcome {
        TileOutcome {
            spec: TileSpec { index, row, col },
            probability,
            saliency: None,
        }
    }

    #[test]
    fn test_annotation_centers() {
        let outcomes = vec![
            outcome(0, 0, 0, 0.1),
            outcome(1, 0, 50, 0.9),
            outcome(2, 50, 0, 0.5),
        ];
        let annotations = build_annotations(&outcomes, PatchSize::square(50));
        let centers: Vec<(usize, usize)> = annotations.iter().map(|a| (a.x, a.y)).collect();
        assert_eq!(centers, vec![(25, 25), (75, 25), (25, 75)]);
        assert_eq!(annotations[1].text, "0.900000");
    }

    #[test]
    fn test_positive_fraction() {
        let annotations = vec![
            Annotation::new(0, 0, 0.2),
            Annotation::new(1, 0, 0.5),
            Annotation::new(2, 0, 0.8),
            Annotation { x: 3, y: 0, text: "n/a".to_string() },
        ];
        assert_eq!(positive_fraction(&annotations, 0.5), 0.5);
        assert_eq!(positive_fraction(&[], 0.5), 0.0);
    }

    #[test]
    fn test_csv_keeps_order() {
        let path = std::env::temp_dir().join(format!("idc_overlay_annotations_{}.csv", std::process::id()));
        let annotations = vec![
            Annotation::new(25, 25, 0.25),
            Annotation::new(75, 25, 0.75),
            Annotation::new(25, 75, 0.5),
        ];
        save_annotations_csv(&path, &annotations).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("x,y,text"));

        let loaded = load_annotations_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, annotations);
    }
}
