//! 画像（任意で ROI を切り出し）にモデルを適用し、オーバーレイ・ヒートマップ・注釈を書き出す

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use idc_overlay_lib::engine::annotations::{positive_fraction, save_annotations_csv};
use idc_overlay_lib::engine::classifier::POSITIVE_THRESHOLD;
use idc_overlay_lib::image_io::{load_image_array, save_image_array};
use idc_overlay_lib::ml::load_model_handle;
use idc_overlay_lib::{select_roi, EngineConfig, OverlayMode, RoiRect};

const USAGE: &str = "Usage: roi_overlay <image> <model.tar.gz> [tint|gradcam] [out_dir] [x0 y0 x1 y1]";

fn parse_roi(args: &[String]) -> Result<Option<RoiRect>> {
    match args.len() {
        0 => Ok(None),
        4 => {
            let v: Vec<f64> = args
                .iter()
                .map(|a| a.parse::<f64>().with_context(|| format!("invalid ROI coordinate: {}", a)))
                .collect::<Result<_>>()?;
            Ok(Some(RoiRect::new(v[0], v[1], v[2], v[3])))
        }
        _ => anyhow::bail!("ROI needs four coordinates\n{}", USAGE),
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }

    let image_path = PathBuf::from(&args[1]);
    let model_path = PathBuf::from(&args[2]);
    let mode: OverlayMode = match args.get(3) {
        Some(m) => m.parse()?,
        None => OverlayMode::TintPatches,
    };
    let out_dir = args.get(4).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("overlay_output"));
    let roi = parse_roi(args.get(5..).unwrap_or(&[]))?;

    let config = EngineConfig::load_or_default();
    config.display();
    let engine = config.build_engine()?;

    let name = model_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model")
        .trim_end_matches(".tar")
        .to_string();
    let handle = load_model_handle(&name, &model_path, config.device_type)?;

    let image = load_image_array(&image_path)?;
    log::info!("image {}: {:?}", image_path.display(), image.dim());

    let region = match roi {
        Some(rect) => match select_roi(image.view(), &rect)? {
            Some(region) => region,
            None => {
                log::warn!("ROI が空のため何も出力しません");
                return Ok(());
            }
        },
        None => image,
    };

    log::info!("mode: {}", mode);
    let output = engine.run(mode, region.view(), &handle)?;

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", out_dir))?;
    write_outputs(&out_dir, &output)?;

    let fraction = positive_fraction(output.annotations(), POSITIVE_THRESHOLD);
    println!(
        "{} tiles, positive fraction {:.3} (threshold {})",
        output.annotations().len(),
        fraction,
        POSITIVE_THRESHOLD
    );
    Ok(())
}

fn write_outputs(out_dir: &Path, output: &idc_overlay_lib::OverlayOutput) -> Result<()> {
    let overlay_path = out_dir.join("overlay.png");
    save_image_array(&overlay_path, output.overlay().view())?;
    log::info!("wrote {}", overlay_path.display());

    if let Some(heatmap) = output.heatmap() {
        let heatmap_path = out_dir.join("heatmap.png");
        save_image_array(&heatmap_path, heatmap.view())?;
        log::info!("wrote {}", heatmap_path.display());
    }

    let csv_path = out_dir.join("annotations.csv");
    save_annotations_csv(&csv_path, output.annotations())?;
    log::info!("wrote {}", csv_path.display());
    Ok(())
}
