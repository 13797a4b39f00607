//! 組織画像のタイル推論と説明オーバーレイ
//!
//! 画像をパッチサイズの倍数までパディングし、各タイルをパッチ分類器にかけて
//! 確率着色または Grad-CAM のオーバーレイと、タイルごとの注釈を作ります。

pub mod types;
pub mod engine;
pub mod image_io;
pub mod model;
#[cfg(feature = "ml")]
pub mod ml;

pub use engine::classifier::{ModelHandle, PatchClassifier};
pub use engine::error::{ClassifierError, EngineError, EngineResult};
pub use engine::roi::{select_roi, RoiRect};
pub use engine::{gradcam_overlay, run_overlay, score_overlay, OverlayEngine, OverlayOutput};
pub use model::{EngineConfig, ModelRegistry};
pub use types::{Annotation, OverlayMode, PaddingOffset, PatchSize};
