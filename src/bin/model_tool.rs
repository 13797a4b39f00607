//! モデルアーカイブの作成・確認用ツール
//!
//! - `model_tool init <out.tar.gz> [patch] [channels] [layer]`: 重みを初期化したモデルを書き出す
//! - `model_tool info <model.tar.gz>`: メタデータを表示
//! - `model_tool predict <model.tar.gz> <patch.png>`: 1枚のパッチを分類

use anyhow::{Context, Result};
use std::path::PathBuf;

use idc_overlay_lib::image_io::load_image_array;
use idc_overlay_lib::ml::{
    load_model_handle, save_classifier, BurnPatchClassifier, ConvLayer, CpuBackend, IdcClassifierConfig,
};
use idc_overlay_lib::model::{load_metadata, print_metadata_info, DeviceType};

const USAGE: &str = "Usage:\n  model_tool init <out.tar.gz> [patch] [channels] [layer]\n  model_tool info <model.tar.gz>\n  model_tool predict <model.tar.gz> <patch.png> [cpu|wgpu]";

fn parse_or<T: std::str::FromStr>(arg: Option<&String>, default: T, what: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match arg {
        Some(s) => s
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {} '{}': {}", what, s, e)),
        None => Ok(default),
    }
}

fn init(args: &[String]) -> Result<()> {
    let out_path = PathBuf::from(args.first().context(USAGE)?);
    let patch: usize = parse_or(args.get(1), 50, "patch size")?;
    let channels: usize = parse_or(args.get(2), 3, "channel count")?;
    let layer_name = args.get(3).map(String::as_str).unwrap_or("conv3");
    let layer = ConvLayer::from_name(layer_name)
        .ok_or_else(|| anyhow::anyhow!("unknown layer '{}' (conv1, conv2, conv3)", layer_name))?;

    let config = IdcClassifierConfig::new()
        .with_input_channels(channels)
        .with_patch_height(patch)
        .with_patch_width(patch);
    let classifier = BurnPatchClassifier::<CpuBackend>::init(&config, Default::default())?;

    let name = out_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model")
        .trim_end_matches(".tar")
        .to_string();
    let written = save_classifier(&out_path, &name, &classifier, layer)?;
    println!("✓ モデルを作成しました: {}", written.display());
    Ok(())
}

fn info(args: &[String]) -> Result<()> {
    let path = PathBuf::from(args.first().context(USAGE)?);
    let metadata = load_metadata(&path)?;
    print_metadata_info(&metadata);
    Ok(())
}

fn predict(args: &[String]) -> Result<()> {
    let model_path = PathBuf::from(args.first().context(USAGE)?);
    let patch_path = PathBuf::from(args.get(1).context(USAGE)?);
    let device_type = match args.get(2).map(String::as_str) {
        None | Some("cpu") => DeviceType::Cpu,
        Some("wgpu") => DeviceType::Wgpu,
        Some(other) => anyhow::bail!("unknown backend '{}'\n{}", other, USAGE),
    };

    let handle = load_model_handle("model", &model_path, device_type)?;
    let patch = load_image_array(&patch_path)?;
    let (probability, class_index) = handle.classify_patch(patch.view())?;
    println!("Image Prediction: {:.6} (class {})", probability, class_index);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("init") => init(&args[2..]),
        Some("info") => info(&args[2..]),
        Some("predict") => predict(&args[2..]),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}
