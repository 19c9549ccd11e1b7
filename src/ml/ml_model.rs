//! 機械学習モデルの共通定義
//!
//! 特徴抽出器（畳み込み層）と分類ヘッドからなる画像分類モデルと、
//! 入力画像の前処理を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
};
use image::imageops::FilterType;

use crate::dataset::InMemoryImage;
use crate::error::ClassifierError;

/// 特徴抽出器の出力次元
pub const FEATURE_DIM: usize = 128;

/// 2回のプーリング後も1x1以上を保つための最小入力サイズ
pub const MIN_IMAGE_SIZE: usize = 4;

/// ImageNetの平均（RGB）
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差（RGB）
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 分類ヘッドの中間層の次元
    #[config(default = 64)]
    pub hidden_size: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 64)]
    pub image_size: usize,
}

impl ModelConfig {
    /// モデルを初期化
    ///
    /// 入力サイズは特徴抽出器の構造に影響しない（最後に全体平均プーリングを行う）。
    pub fn init<B: Backend>(&self, device: &B::Device) -> ImageClassifier<B> {
        ImageClassifier {
            backbone: FeatureExtractor::new(device),
            head: ClassifierHead {
                fc1: LinearConfig::new(FEATURE_DIM, self.hidden_size).init(device),
                dropout: DropoutConfig::new(self.dropout).init(),
                fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
                activation: Relu::new(),
            },
        }
    }
}

/// 特徴抽出器
///
/// # アーキテクチャ
/// - Conv 3x3 (same padding) + ReLU + MaxPool 2x2: 3 -> 32
/// - Conv 3x3 (same padding) + ReLU + MaxPool 2x2: 32 -> 64
/// - Conv 3x3 (same padding) + ReLU: 64 -> 128
/// - 全体平均プーリング -> 128次元
#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    global_pool: AdaptiveAvgPool2d,
    activation: Relu,
}

impl<B: Backend> FeatureExtractor<B> {
    pub fn new(device: &B::Device) -> Self {
        let conv = |channels: [usize; 2]| -> Conv2d<B> {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        let pool = || MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        Self {
            conv1: conv([3, 32]),
            pool1: pool(),
            conv2: conv([32, 64]),
            pool2: pool(),
            conv3: conv([64, FEATURE_DIM]),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
        }
    }

    /// 画像 [batch, 3, size, size] -> 特徴 [batch, FEATURE_DIM]
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

        self.global_pool.forward(x).reshape([batch_size, FEATURE_DIM])
    }
}

/// 分類ヘッド: FEATURE_DIM -> hidden + ReLU + Dropout -> num_classes
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.fc1.forward(features);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }
}

/// 画像分類モデル
#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    backbone: FeatureExtractor<B>,
    head: ClassifierHead<B>,
}

impl<B: Backend> ImageClassifier<B> {
    /// 順伝播
    ///
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    /// クラスごとの確率（softmax）[batch_size, num_classes]
    pub fn scores(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）。(損失, ロジット) を返す
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets);
        (loss, output)
    }

    /// 特徴抽出器を差し替える（転移学習用）
    pub fn with_backbone(mut self, backbone: FeatureExtractor<B>) -> Self {
        self.backbone = backbone;
        self
    }

    /// 特徴抽出器を取り出す
    pub fn into_backbone(self) -> FeatureExtractor<B> {
        self.backbone
    }

    /// 特徴抽出器のパラメータを固定し、分類ヘッドのみ学習対象にする
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }
}

/// 画像をデコードし、リサイズしてImageNetの平均と標準偏差で正規化
///
/// 戻り値は (C, H, W) の順で平坦化したRGBデータ。
pub fn decode_and_normalize(image: &InMemoryImage, size: usize) -> crate::error::Result<Vec<f32>> {
    let decoded = image::load_from_memory(&image.bytes).map_err(|source| ClassifierError::ImageDecode {
        name: image.file_name.clone(),
        source,
    })?;
    let rgb = decoded
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let num_pixels = size * size;
    let mut data = vec![0.0f32; 3 * num_pixels];

    for (i, pixel) in rgb.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * num_pixels + i] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{png_bytes, TestBackend};

    #[test]
    fn forward_shapes_and_scores_sum_to_one() {
        let device = Default::default();
        let model = ModelConfig::new(3).with_hidden_size(8).init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        assert_eq!(model.forward(images.clone()).dims(), [2, 3]);

        let scores = model.scores(images).into_data().to_vec::<f32>().unwrap();
        for row in scores.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "sum = {sum}");
        }
    }

    #[test]
    fn image_size_does_not_change_parameter_count() {
        let device = Default::default();
        let small = ModelConfig::new(2).with_image_size(16).init::<TestBackend>(&device);
        let large = ModelConfig::new(2).with_image_size(96).init::<TestBackend>(&device);
        assert_eq!(small.num_params(), large.num_params());
    }

    #[test]
    fn decode_resizes_and_normalizes() {
        let image = InMemoryImage::new("white.png", png_bytes(40, 20, [255, 255, 255]), None);
        let data = decode_and_normalize(&image, 8).unwrap();
        assert_eq!(data.len(), 3 * 8 * 8);
        let expected_red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((data[0] - expected_red).abs() < 1e-5);
    }

    #[test]
    fn decode_rejects_garbage() {
        let image = InMemoryImage::new("notes.png", b"plain text".to_vec(), None);
        let err = decode_and_normalize(&image, 8).unwrap_err();
        assert!(matches!(err, ClassifierError::ImageDecode { .. }));
    }
}
