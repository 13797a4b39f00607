pub mod ml_model;
pub mod inference;

pub use ml_model::{ConvLayer, IdcClassifier, IdcClassifierConfig};
pub use inference::{classifier_config, load_model_handle, save_classifier, BurnPatchClassifier, CpuBackend};
#[cfg(feature = "wgpu")]
pub use inference::GpuBackend;
