//! 分類モデルの共通定義
//!
//! 学習ループ・エクスポート・推論サービスはすべて [`ImageClassifier`] を通してモデルを呼び出します。
//! 具体的なネットワーク構造はこのトレイトの裏側に隠れています。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
    train::ClassificationOutput,
};

use crate::ml::dataset::SampleBatch;

/// クラス数
pub const NUM_CLASSES: usize = 10;

/// 入力テンソルの名前
pub const INPUT_NAME: &str = "img";

/// 出力テンソルの名前
pub const OUTPUT_NAME: &str = "result";

/// クラス名の定義（Fashion-MNIST のラベル順）
pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "T-shirt/top",
    "Trouser",
    "Pullover",
    "Dress",
    "Coat",
    "Sandal",
    "Shirt",
    "Sneaker",
    "Bag",
    "Ankle boot",
];

/// 名前付き入力: `img` [batch, 1, 28, 28]
#[derive(Debug, Clone)]
pub struct InferenceInput<B: Backend> {
    pub img: Tensor<B, 4>,
}

impl<B: Backend> InferenceInput<B> {
    pub fn new(img: Tensor<B, 4>) -> Self {
        Self { img }
    }
}

/// 名前付き出力: `result` [batch, num_classes] のクラススコア
#[derive(Debug, Clone)]
pub struct InferenceOutput<B: Backend> {
    pub result: Tensor<B, 2>,
}

/// 「入力テンソルを受け取り名前付き出力を返す」ものすべて
pub trait ImageClassifier<B: Backend> {
    fn infer(&self, input: InferenceInput<B>) -> InferenceOutput<B>;
}

/// 順伝播と損失計算（学習用）
pub fn forward_classification<B: Backend, M: ImageClassifier<B>>(
    model: &M,
    batch: SampleBatch<B>,
) -> ClassificationOutput<B> {
    let output = model.infer(InferenceInput::new(batch.images)).result;
    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output.clone(), batch.targets.clone());

    ClassificationOutput::new(loss, output, batch.targets)
}

/// モデル設定
///
/// エクスポートされるマニフェストに含まれ、推論側はこれだけでネットワークを再構築します。
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    #[config(default = 10)]
    pub num_classes: usize,
    /// 入力チャンネル数
    #[config(default = 1)]
    pub in_channels: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 28)]
    pub image_size: usize,
    /// Conv1 の出力チャンネル数
    #[config(default = 16)]
    pub conv1_channels: usize,
    /// Conv2 の出力チャンネル数
    #[config(default = 32)]
    pub conv2_channels: usize,
    /// 全結合層の中間次元
    #[config(default = 128)]
    pub hidden_size: usize,
    /// ドロップアウト率
    #[config(default = 0.25)]
    pub dropout: f64,
}

impl ClassifierConfig {
    /// Conv2 + Pool2 後の特徴マップの一辺
    ///
    /// Conv (3x3, no padding): size -> size - 2
    /// Pool (2x2, stride 2): size -> size / 2 (切り捨て)
    pub fn feature_map_size(&self) -> usize {
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        after_conv2 / 2
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let feature_map_size = self.feature_map_size().max(1);
        let d = self.conv2_channels * feature_map_size * feature_map_size;

        log::debug!(
            "[Model] 入力 {}x{}x{} -> 特徴マップ {}x{}x{} -> FC {} -> {} -> {}",
            self.in_channels,
            self.image_size,
            self.image_size,
            self.conv2_channels,
            feature_map_size,
            feature_map_size,
            d,
            self.hidden_size,
            self.num_classes
        );

        Classifier {
            conv1: Conv2dConfig::new([self.in_channels, self.conv1_channels], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([self.conv1_channels, self.conv2_channels], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

/// 28x28 グレースケール画像の分類用CNN
///
/// # アーキテクチャ
/// - {Conv 3x3 + ReLU + MaxPool 2x2} x 2層
/// - Flatten
/// - FC: d -> hidden + ReLU + Dropout
/// - FC: hidden -> num_classes（ロジット）
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,

    fc1: Linear<B>,
    fc2: Linear<B>,

    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> Classifier<B> {
    /// 順伝播
    ///
    /// - `images`: [batch_size, 1, 28, 28]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }
}

impl<B: Backend> ImageClassifier<B> for Classifier<B> {
    fn infer(&self, input: InferenceInput<B>) -> InferenceOutput<B> {
        InferenceOutput {
            result: self.forward(input.img),
        }
    }
}
