//! 学習済みモデルのエクスポート
//!
//! マニフェストに書いた構造だけでネットワークを再構築し、重みを読み込んで
//! 元のモデルとビット単位で同じ出力になることを確認してから書き出します。

use std::path::Path;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};

use crate::error::ExportError;
use crate::ml::context::{ExecutionContext, Mode};
use crate::ml::ml_model::{
    Classifier, ClassifierConfig, ImageClassifier, InferenceInput, CLASS_NAMES, INPUT_NAME,
    OUTPUT_NAME,
};
use crate::ml::preprocess::{NormalizationContract, RawImage, CHANNELS, IMAGE_HEIGHT, PIXELS};
use crate::model::{save_model_with_metadata, ModelMetadata, TensorSpec};

/// 学習が終わり、これ以上更新されないモデル（構造定義 + パラメータ）
#[derive(Debug)]
pub struct TrainedModel<B: Backend> {
    pub config: ClassifierConfig,
    pub network: Classifier<B>,
    pub num_epochs: usize,
    pub test_accuracy: Option<f64>,
}

/// モデルの重みをバイト列に記録
pub fn record_weights<B: Backend>(network: &Classifier<B>) -> Result<Vec<u8>, ExportError> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(network.clone().into_record(), ())
        .map_err(|e| ExportError::Record(format!("{:?}", e)))
}

/// マニフェストの構造とバイト列の重みからネットワークを再構築
pub fn rebuild_network<B: Backend>(
    architecture: &ClassifierConfig,
    weights: Vec<u8>,
    device: &B::Device,
) -> Result<Classifier<B>, ExportError> {
    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(weights, device)
        .map_err(|e| ExportError::Record(format!("{:?}", e)))?;
    Ok(architecture.init::<B>(device).load_record(record))
}

/// 確認用の入力（画素値が位置によって変わる画像）
fn probe_input<B: Backend>(
    contract: &NormalizationContract,
    device: &B::Device,
) -> Result<Tensor<B, 4>, ExportError> {
    let pixels = (0..PIXELS).map(|i| ((i * 7) % 256) as u8).collect();
    let raw = RawImage::from_vec(pixels)
        .map_err(|e| ExportError::Unscriptable(format!("probe image: {}", e)))?;
    contract
        .input_tensor::<B>(&raw, device)
        .map_err(|e| ExportError::Unscriptable(format!("probe input: {}", e)))
}

/// 出力の形状とビット列
fn scores<B: Backend>(
    model: &impl ImageClassifier<B>,
    input: Tensor<B, 4>,
) -> Result<(Vec<usize>, Vec<u32>), ExportError> {
    let result = model.infer(InferenceInput::new(input)).result;
    let dims = result.dims().to_vec();
    let values = result
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ExportError::Unscriptable(format!("model output is unreadable: {:?}", e)))?;
    Ok((dims, values.into_iter().map(f32::to_bits).collect()))
}

/// 学習済みモデルを自己記述的な成果物（tar.gz）として書き出す
///
/// 次の場合は [`ExportError::Unscriptable`] で失敗し、ファイルは作られません。
/// - 構造の入力形状が前処理の契約と一致しない
/// - 構造から再構築したモデルのパラメータ数が異なる
/// - 出力形状が [1, num_classes] でない
/// - 再構築したモデルの出力がビット単位で一致しない
pub fn export_model<B: Backend>(
    state: &TrainedModel<B>,
    ctx: &ExecutionContext<B>,
    contract: &NormalizationContract,
    path: &Path,
) -> Result<ModelMetadata, ExportError> {
    ctx.ensure(Mode::Inference)?;

    let architecture = &state.config;
    if architecture.in_channels != CHANNELS || architecture.image_size != IMAGE_HEIGHT {
        return Err(ExportError::Unscriptable(format!(
            "architecture expects {}x{}x{} input, contract provides {:?}",
            architecture.in_channels,
            architecture.image_size,
            architecture.image_size,
            contract.input_shape()
        )));
    }
    if architecture.num_classes != CLASS_NAMES.len() {
        return Err(ExportError::Unscriptable(format!(
            "architecture has {} classes, label encoding has {}",
            architecture.num_classes,
            CLASS_NAMES.len()
        )));
    }

    let expected_params = state.network.num_params();
    let rebuilt_params = architecture.init::<B>(&ctx.device).num_params();
    if rebuilt_params != expected_params {
        return Err(ExportError::Unscriptable(format!(
            "architecture describes {} parameters, model has {}",
            rebuilt_params, expected_params
        )));
    }

    let weights = record_weights(&state.network)?;
    let rebuilt = rebuild_network::<B>(architecture, weights.clone(), &ctx.device)?;

    let (live_dims, live_bits) = scores(&state.network, probe_input::<B>(contract, &ctx.device)?)?;
    let (rebuilt_dims, rebuilt_bits) = scores(&rebuilt, probe_input::<B>(contract, &ctx.device)?)?;

    let output_shape = vec![1, architecture.num_classes];
    if live_dims != output_shape || rebuilt_dims != output_shape {
        return Err(ExportError::Unscriptable(format!(
            "output shape {:?} does not match signature {:?}",
            live_dims, output_shape
        )));
    }
    if live_bits != rebuilt_bits {
        return Err(ExportError::Unscriptable(
            "rebuilt model does not reproduce the live model's output".to_string(),
        ));
    }

    let metadata = ModelMetadata::new(
        architecture.clone(),
        TensorSpec::f32(INPUT_NAME, &contract.input_shape()),
        TensorSpec::f32(OUTPUT_NAME, &output_shape),
        *contract,
        CLASS_NAMES.iter().map(|name| name.to_string()).collect(),
        state.num_epochs,
        state.test_accuracy,
    );

    save_model_with_metadata(path, &metadata, &weights).map_err(ExportError::Storage)?;

    log::info!(
        "モデルをエクスポートしました: {} ({} パラメータ, {} バイト)",
        path.display(),
        expected_params,
        weights.len()
    );

    Ok(metadata)
}
