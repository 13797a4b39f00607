//! エンジンのエラー種別

use thiserror::Error;

/// 分類器バックエンドが返すエラー
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// 入力パッチの形状がモデルと一致しない
    #[error("patch shape {actual:?} does not match model input {expected:?}")]
    PatchShape {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
    /// 指定されたレイヤーが存在しない
    #[error("unknown layer: {0}")]
    UnknownLayer(String),
    /// 出力に NaN / 無限大が含まれる
    #[error("non-finite classifier output: {0}")]
    NonFinite(f32),
    /// バックエンド内部のエラー
    #[error("backend failure: {0}")]
    Backend(String),
}

/// タイル推論エンジンのエラー
#[derive(Debug, Error)]
pub enum EngineError {
    /// モデルハンドルや設定の不備（構築時にのみ発生）
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 入力画像の形状がモデルと合わない
    #[error("input shape error: {0}")]
    InputShape(String),

    /// タイル単位の推論失敗。呼び出し全体が失敗する
    #[error("inference failed on tile #{index} at (row {row}, col {col}): {source}")]
    Inference {
        index: usize,
        row: usize,
        col: usize,
        #[source]
        source: ClassifierError,
    },

    /// ROI矩形が画像範囲外
    #[error("roi ({x0}, {y0})-({x1}, {y1}) is outside the {width}x{height} image")]
    RoiOutOfBounds {
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
        width: usize,
        height: usize,
    },

    /// ピクセルバッファのエンコード・デコード失敗
    #[error("pixel buffer codec error: {0}")]
    Codec(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
