//! タイル推論
//!
//! パディング済み画像を重なりのないパッチにラスター順で分割し、
//! パッチごとに分類器（または Grad-CAM）を実行します。

use ndarray::{s, Array2, Array3, ArrayView3};
use rayon::prelude::*;

use crate::engine::classifier::ModelHandle;
use crate::engine::error::{ClassifierError, EngineError, EngineResult};
use crate::engine::gradcam::{class_activation_map, render_gradcam_tile, resize_heatmap, GradCamTile};
use crate::types::PatchSize;

/// タイルごとの処理内容
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileMode {
    /// 陽性確率のみ
    Score,
    /// Grad-CAM ヒートマップと陽性確率
    GradCam {
        alpha: f32,
        target_class: Option<usize>,
    },
}

/// ラスター順のタイル位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub index: usize,
    pub row: usize,
    pub col: usize,
}

/// タイルの処理結果
#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub spec: TileSpec,
    pub probability: f32,
    pub saliency: Option<GradCamTile>,
}

/// 画像上のタイル位置を列挙（行が外側、列が内側）
///
/// パッチサイズに満たない端のタイルは含めない。
pub fn tile_grid(height: usize, width: usize, patch: PatchSize) -> Vec<TileSpec> {
    let mut specs = Vec::new();
    for row in (0..height).step_by(patch.height) {
        for col in (0..width).step_by(patch.width) {
            if row + patch.height > height || col + patch.width > width {
                log::warn!("skipping partial tile at (row {}, col {})", row, col);
                continue;
            }
            specs.push(TileSpec {
                index: specs.len(),
                row,
                col,
            });
        }
    }
    specs
}

/// タイル処理の実行方式
///
/// ワーカー数 1 ではラスター順に逐次実行する。2 以上では固定サイズの
/// スレッドプールで実行し、結果はラスター順に並べ直して返す。
pub struct TileExecutor {
    pool: Option<rayon::ThreadPool>,
}

impl TileExecutor {
    pub fn sequential() -> Self {
        Self { pool: None }
    }

    pub fn with_workers(workers: usize) -> EngineResult<Self> {
        match workers {
            0 => Err(EngineError::Configuration(
                "tiling workers must be at least 1".to_string(),
            )),
            1 => Ok(Self::sequential()),
            n => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("tile-worker-{}", i))
                    .build()
                    .map_err(|e| EngineError::Configuration(format!("tile worker pool: {}", e)))?;
                Ok(Self { pool: Some(pool) })
            }
        }
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.current_num_threads())
    }

    /// 全タイルを処理する。1枚でも失敗すれば呼び出し全体が失敗する
    pub fn run(
        &self,
        image: ArrayView3<u8>,
        handle: &ModelHandle,
        mode: TileMode,
    ) -> EngineResult<Vec<TileOutcome>> {
        let (height, width, _) = image.dim();
        let specs = tile_grid(height, width, handle.patch_size());

        let mut outcomes = match &self.pool {
            None => specs
                .iter()
                .map(|spec| process_tile(image, *spec, handle, mode))
                .collect::<EngineResult<Vec<_>>>()?,
            Some(pool) => pool.install(|| {
                specs
                    .par_iter()
                    .map(|spec| process_tile(image, *spec, handle, mode))
                    .collect::<EngineResult<Vec<_>>>()
            })?,
        };
        outcomes.sort_by_key(|o| o.spec.index);
        Ok(outcomes)
    }
}

impl Default for TileExecutor {
    fn default() -> Self {
        Self::sequential()
    }
}

pub(crate) fn check_probability(p: f32) -> Result<f32, ClassifierError> {
    if !p.is_finite() {
        return Err(ClassifierError::NonFinite(p));
    }
    if !(0.0..=1.0).contains(&p) {
        return Err(ClassifierError::Backend(format!(
            "probability {} is outside [0, 1]",
            p
        )));
    }
    Ok(p)
}

/// 1タイル分の処理
fn process_tile(
    image: ArrayView3<u8>,
    spec: TileSpec,
    handle: &ModelHandle,
    mode: TileMode,
) -> EngineResult<TileOutcome> {
    let patch = handle.patch_size();
    let tile = image.slice(s![
        spec.row..spec.row + patch.height,
        spec.col..spec.col + patch.width,
        ..
    ]);
    let normalized = tile.mapv(|v| v as f32 / 255.0);
    let classifier = handle.classifier();

    let with_context = |source: ClassifierError| {
        log::error!(
            "tile #{} at (row {}, col {}) failed: {}",
            spec.index,
            spec.row,
            spec.col,
            source
        );
        EngineError::Inference {
            index: spec.index,
            row: spec.row,
            col: spec.col,
            source,
        }
    };

    let outcome = match mode {
        TileMode::Score => {
            let probability = classifier
                .predict(normalized.view())
                .and_then(check_probability)
                .map_err(with_context)?;
            TileOutcome {
                spec,
                probability,
                saliency: None,
            }
        }
        TileMode::GradCam { alpha, target_class } => {
            let rendered = classifier
                .layer_gradients(normalized.view(), handle.gradcam_layer(), target_class)
                .and_then(|grads| {
                    let probability = check_probability(grads.probability)?;
                    let cam = class_activation_map(grads.activations.view(), grads.gradients.view())?;
                    let cam = resize_heatmap(&cam, patch.height, patch.width)?;
                    Ok((probability, render_gradcam_tile(tile, &cam, alpha)))
                })
                .map_err(with_context)?;
            TileOutcome {
                spec,
                probability: rendered.0,
                saliency: Some(rendered.1),
            }
        }
    };

    log::debug!(
        "tile #{} (row {}, col {}): p = {:.6}",
        spec.index,
        spec.row,
        spec.col,
        outcome.probability
    );
    Ok(outcome)
}

/// タイルの確率をピクセル単位のスコアマスクに展開
pub fn assemble_score_mask(
    outcomes: &[TileOutcome],
    height: usize,
    width: usize,
    patch: PatchSize,
) -> Array2<f32> {
    let mut mask = Array2::<f32>::zeros((height, width));
    for outcome in outcomes {
        let TileSpec { row, col, .. } = outcome.spec;
        mask.slice_mut(s![row..row + patch.height, col..col + patch.width])
            .fill(outcome.probability);
    }
    mask
}

/// Grad-CAM タイルを全体画像に配置
///
/// 戻り値は (合成済み画像, 着色ヒートマップ)。
pub fn assemble_gradcam(
    outcomes: &[TileOutcome],
    source: ArrayView3<u8>,
    patch: PatchSize,
) -> (Array3<u8>, Array3<u8>) {
    let (height, width, _) = source.dim();
    let mut overlay = source.to_owned();
    let mut heatmap = Array3::<u8>::zeros((height, width, 3));
    for outcome in outcomes {
        let TileSpec { row, col, .. } = outcome.spec;
        if let Some(saliency) = &outcome.saliency {
            overlay
                .slice_mut(s![row..row + patch.height, col..col + patch.width, ..])
                .assign(&saliency.tinted);
            heatmap
                .slice_mut(s![row..row + patch.height, col..col + patch.width, ..])
                .assign(&saliency.heatmap);
        }
    }
    (overlay, heatmap)
}
