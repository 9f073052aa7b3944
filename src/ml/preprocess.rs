//! 前処理の契約
//!
//! 生のピクセル値からモデル入力テンソルへの変換はここだけで定義します。
//! 学習・評価・ゴールデンデータ出力・推論サービスは同じ [`NormalizationContract`] を共有し、
//! 定数はエクスポートされるマニフェストにも書き込まれます。

use std::path::Path;

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ContractError;

/// チャンネル数（グレースケール）
pub const CHANNELS: usize = 1;

/// 画像の高さ
pub const IMAGE_HEIGHT: usize = 28;

/// 画像の幅
pub const IMAGE_WIDTH: usize = 28;

/// 1枚あたりのピクセル数
pub const PIXELS: usize = CHANNELS * IMAGE_HEIGHT * IMAGE_WIDTH;

/// 正規化前の画像（行優先, 1x28x28）
#[derive(Clone, Debug, PartialEq)]
pub struct RawImage([u8; PIXELS]);

impl RawImage {
    pub fn from_vec(pixels: Vec<u8>) -> Result<Self, ContractError> {
        let actual = pixels.len();
        let pixels: [u8; PIXELS] = pixels.try_into().map_err(|_| ContractError::PixelCount {
            expected: PIXELS,
            actual,
        })?;
        Ok(Self(pixels))
    }

    /// 28x28のPNG画像を読み込む（カラー画像はグレースケールに変換）
    pub fn from_png(path: &Path) -> Result<Self> {
        let img = image::open(path)?.to_luma8();
        let (width, height) = img.dimensions();

        if width as usize != IMAGE_WIDTH || height as usize != IMAGE_HEIGHT {
            anyhow::bail!(
                "画像サイズが不正です: {}x{} (期待: {}x{})",
                width,
                height,
                IMAGE_WIDTH,
                IMAGE_HEIGHT
            );
        }

        Ok(Self::from_vec(img.into_raw())?)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.0
    }
}

/// 正規化済みの画像
///
/// [`NormalizationContract::normalize`] からのみ生成されるため、二重に正規化されることはありません。
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedImage(Vec<f32>);

impl NormalizedImage {
    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// [C, H, W] = [1, 28, 28] のテンソルに変換
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::<B, 1>::from_floats(self.0.as_slice(), device).reshape([
            CHANNELS,
            IMAGE_HEIGHT,
            IMAGE_WIDTH,
        ])
    }
}

/// バージョン付きの正規化定数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationContract {
    pub version: u32,
    pub mean: f32,
    pub std: f32,
    /// 生ピクセル値の最大値（[0, 1] へのスケーリングに使用）
    pub pixel_scale: f32,
}

impl NormalizationContract {
    /// Fashion-MNIST 用: ToTensor の後に Normalize((0.5,), (0.5,))
    pub const FASHION_MNIST_V1: Self = Self {
        version: 1,
        mean: 0.5,
        std: 0.5,
        pixel_scale: 255.0,
    };

    /// 推論時の入力形状 [batch, C, H, W]
    pub fn input_shape(&self) -> [usize; 4] {
        [1, CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH]
    }

    pub fn normalize_pixel(&self, pixel: u8) -> f32 {
        (pixel as f32 / self.pixel_scale - self.mean) / self.std
    }

    pub fn normalize(&self, raw: &RawImage) -> NormalizedImage {
        NormalizedImage(raw.0.iter().map(|&p| self.normalize_pixel(p)).collect())
    }

    /// 先頭にバッチ次元を追加して [1, 1, 28, 28] にする
    pub fn reshape_for_inference<B: Backend>(
        &self,
        tensor: Tensor<B, 3>,
    ) -> Result<Tensor<B, 4>, ContractError> {
        let dims = tensor.dims();
        if dims != [CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH] {
            return Err(ContractError::Shape {
                expected: vec![CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH],
                actual: dims.to_vec(),
            });
        }
        Ok(tensor.unsqueeze::<4>())
    }

    /// 生画像から推論用テンソルまでを一度に作る
    pub fn input_tensor<B: Backend>(
        &self,
        raw: &RawImage,
        device: &B::Device,
    ) -> Result<Tensor<B, 4>, ContractError> {
        self.reshape_for_inference(self.normalize(raw).to_tensor::<B>(device))
    }
}

impl Default for NormalizationContract {
    fn default() -> Self {
        Self::FASHION_MNIST_V1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn gradient_image() -> RawImage {
        RawImage::from_vec((0..PIXELS).map(|i| (i % 256) as u8).collect()).unwrap()
    }

    #[test]
    fn test_normalize_range() {
        let contract = NormalizationContract::default();
        let normalized = contract.normalize(&gradient_image());

        assert_eq!(normalized.values().len(), PIXELS);
        assert!(normalized.values().iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(contract.normalize_pixel(0), -1.0);
        assert_eq!(contract.normalize_pixel(255), 1.0);
        assert!(contract.normalize_pixel(128).abs() < 0.01);
    }

    #[test]
    fn test_raw_image_rejects_wrong_length() {
        let err = RawImage::from_vec(vec![0; 100]).unwrap_err();
        assert_eq!(
            err,
            ContractError::PixelCount {
                expected: PIXELS,
                actual: 100
            }
        );
    }

    #[test]
    fn test_reshape_for_inference_keeps_row_major_order() {
        let contract = NormalizationContract::default();
        let device = Default::default();
        let raw = gradient_image();

        let tensor = contract.normalize(&raw).to_tensor::<NdArray>(&device);
        let input = contract.reshape_for_inference(tensor).unwrap();
        assert_eq!(input.dims(), [1, 1, 28, 28]);

        // (y=1, x=2) は行優先で 1 * 28 + 2 番目
        let value = input
            .slice([0..1, 0..1, 1..2, 2..3])
            .into_data()
            .to_vec::<f32>()
            .unwrap()[0];
        assert_eq!(value, contract.normalize_pixel(raw.pixels()[30]));
    }

    #[test]
    fn test_input_tensor_matches_checked_reshape() {
        let contract = NormalizationContract::default();
        let device = Default::default();
        let raw = gradient_image();

        let input = contract.input_tensor::<NdArray>(&raw, &device).unwrap();
        assert_eq!(input.dims(), [1, 1, 28, 28]);

        let expected = contract
            .reshape_for_inference(contract.normalize(&raw).to_tensor::<NdArray>(&device))
            .unwrap();
        assert_eq!(
            input.into_data().to_vec::<f32>().unwrap(),
            expected.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_reshape_for_inference_rejects_wrong_shape() {
        let contract = NormalizationContract::default();
        let device = Default::default();
        let tensor = Tensor::<NdArray, 3>::zeros([1, 32, 32], &device);

        assert!(matches!(
            contract.reshape_for_inference(tensor),
            Err(ContractError::Shape { .. })
        ));
    }
}
