//! 画像分類用のCNNモデル定義

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// 入力画像の最小辺長
///
/// 3x3 Conv (padding無し) ×3 と 2x2 Pool ×2 を通した後に1画素以上残るサイズ。
pub const MIN_INPUT_SIZE: usize = 18;

/// 最終Conv層のチャネル数（= プーリング後の特徴次元）
const FEATURE_CHANNELS: usize = 128;

/// 全結合層の中間次元
const HIDDEN_UNITS: usize = 256;

/// モデル設定
#[derive(Config, Debug)]
pub struct VisionCnnConfig {
    /// 出力クラス数（ラベルのスロット数）
    pub num_classes: usize,
    /// 入力画像の幅
    pub input_width: usize,
    /// 入力画像の高さ
    pub input_height: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl VisionCnnConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> anyhow::Result<VisionCnn<B>> {
        if self.input_width < MIN_INPUT_SIZE || self.input_height < MIN_INPUT_SIZE {
            anyhow::bail!(
                "入力サイズが小さすぎます: {}x{} (最小{}x{}が必要)",
                self.input_width,
                self.input_height,
                MIN_INPUT_SIZE,
                MIN_INPUT_SIZE
            );
        }
        if self.num_classes == 0 {
            anyhow::bail!("クラス数が0です");
        }

        tracing::debug!(
            "[Model] 入力サイズ: {}x{}, クラス数: {}, dropout: {}",
            self.input_width,
            self.input_height,
            self.num_classes,
            self.dropout
        );

        Ok(VisionCnn {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([64, FEATURE_CHANNELS], [3, 3]).init(device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(FEATURE_CHANNELS, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 画像分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 2層
/// - Conv 3x3 + ReLU
/// - Global Average Pooling (入力サイズに依存しない特徴次元)
/// - Dropout
/// - FC: 128 -> 256 + ReLU
/// - FC: 256 -> num_classes
#[derive(Module, Debug)]
pub struct VisionCnn<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    global_pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> VisionCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, height, width]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        // [batch, 128, 1, 1] -> [batch, 128]
        let x = self.global_pool.forward(x);
        let x = x.reshape([batch_size, FEATURE_CHANNELS]);
        let x = self.dropout.forward(x);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }
}
