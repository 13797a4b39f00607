//! IDCパッチ分類用CNNモデル
//!
//! 組織画像パッチ（既定 50x50）が浸潤性乳管癌 (IDC) を含む確率を出力する
//! 二値分類器です。Grad-CAM 用に、任意の畳み込み層で順伝播を分割できます。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};

use crate::engine::error::EngineError;

/// Grad-CAM に使える畳み込み層
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvLayer {
    Conv1,
    Conv2,
    Conv3,
}

impl ConvLayer {
    pub const ALL: [ConvLayer; 3] = [ConvLayer::Conv1, ConvLayer::Conv2, ConvLayer::Conv3];

    pub fn name(&self) -> &'static str {
        match self {
            ConvLayer::Conv1 => "conv1",
            ConvLayer::Conv2 => "conv2",
            ConvLayer::Conv3 => "conv3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|l| l.name() == name)
    }
}

/// モデル設定
#[derive(Config, Debug)]
pub struct IdcClassifierConfig {
    /// 入力チャネル数（グレースケール 1 / RGB 3）
    #[config(default = 3)]
    pub input_channels: usize,
    /// 入力パッチの高さ
    #[config(default = 50)]
    pub patch_height: usize,
    /// 入力パッチの幅
    #[config(default = 50)]
    pub patch_width: usize,
    /// 全結合層の隠れ次元
    #[config(default = 128)]
    pub hidden_size: usize,
}

/// 1辺の長さが conv/pool を通過した後のサイズ
///
/// - Conv 3x3 (no padding): -2
/// - MaxPool 2x2 (stride 2): /2 (切り捨て)
fn feature_extent(size: usize) -> Option<usize> {
    let after_conv1 = size.checked_sub(2)?;
    let after_pool1 = after_conv1 / 2;
    let after_conv2 = after_pool1.checked_sub(2)?;
    let after_pool2 = after_conv2 / 2;
    let after_conv3 = after_pool2.checked_sub(2)?;
    (after_conv3 > 0).then_some(after_conv3)
}

impl IdcClassifierConfig {
    /// conv3 出力の空間サイズ (h, w)
    pub fn feature_map_size(&self) -> Option<(usize, usize)> {
        Some((feature_extent(self.patch_height)?, feature_extent(self.patch_width)?))
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<IdcClassifier<B>, EngineError> {
        if self.input_channels == 0 || self.hidden_size == 0 {
            return Err(EngineError::Configuration(format!(
                "invalid model config: {} input channels, hidden size {}",
                self.input_channels, self.hidden_size
            )));
        }
        let (fh, fw) = self.feature_map_size().ok_or_else(|| {
            EngineError::Configuration(format!(
                "patch {}x{} is too small for the network (minimum 18x18)",
                self.patch_height, self.patch_width
            ))
        })?;

        // 特徴次元 d = 64チャネル * fh * fw
        let d = 64 * fh * fw;
        log::debug!(
            "IdcClassifier: input {}x{}x{}, conv3 output 64x{}x{}, d = {}, hidden = {}",
            self.input_channels,
            self.patch_height,
            self.patch_width,
            fh,
            fw,
            d,
            self.hidden_size
        );

        Ok(IdcClassifier {
            conv1: Conv2dConfig::new([self.input_channels, 16], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([16, 32], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([32, 64], [3, 3])
                .with_stride([1, 1])
                .init(device),
            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, 1).init(device),
            activation: Relu::new(),
        })
    }
}

/// IDCパッチ分類CNN
///
/// # アーキテクチャ
/// - conv1: Conv 3x3 + ReLU → MaxPool 2x2
/// - conv2: Conv 3x3 + ReLU → MaxPool 2x2
/// - conv3: Conv 3x3 + ReLU
/// - Flatten → FC + ReLU → FC(1) → Sigmoid
#[derive(Module, Debug)]
pub struct IdcClassifier<B: Backend> {
    conv1: Conv2d<B>, // C -> 16
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 16 -> 32
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 32 -> 64

    fc1: Linear<B>, // d -> hidden
    fc2: Linear<B>, // hidden -> 1

    activation: Relu,
}

impl<B: Backend> IdcClassifier<B> {
    /// 入力から指定層の出力（ReLU後、プーリング前）までを計算
    pub fn features_until(&self, images: Tensor<B, 4>, layer: ConvLayer) -> Tensor<B, 4> {
        let x = self.activation.forward(self.conv1.forward(images));
        if layer == ConvLayer::Conv1 {
            return x;
        }
        let x = self.activation.forward(self.conv2.forward(self.pool1.forward(x)));
        if layer == ConvLayer::Conv2 {
            return x;
        }
        self.activation.forward(self.conv3.forward(self.pool2.forward(x)))
    }

    /// 指定層の出力からロジットまでを計算
    pub fn head_from(&self, features: Tensor<B, 4>, layer: ConvLayer) -> Tensor<B, 2> {
        let x = match layer {
            ConvLayer::Conv1 => {
                let x = self.activation.forward(self.conv2.forward(self.pool1.forward(features)));
                self.activation.forward(self.conv3.forward(self.pool2.forward(x)))
            }
            ConvLayer::Conv2 => self.activation.forward(self.conv3.forward(self.pool2.forward(features))),
            ConvLayer::Conv3 => features,
        };

        // Flatten
        let [batch_size, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        self.fc2.forward(x)
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, C, H, W]
    ///
    /// # 戻り値
    /// - ロジット [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.features_until(images, ConvLayer::Conv3);
        self.head_from(features, ConvLayer::Conv3)
    }

    /// 陽性確率 [batch_size, 1]
    pub fn predict_probability(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }
}
