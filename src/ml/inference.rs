//! エクスポート済みモデルによる推論
//!
//! 学習コードの設定は使わず、成果物のマニフェストだけからネットワークを再構築します。

use anyhow::Result;
use std::path::Path;
use burn::tensor::{backend::Backend, Tensor};

use crate::ml::context::{ExecutionContext, Mode};
use crate::ml::export::rebuild_network;
use crate::ml::golden::GoldenRecord;
use crate::ml::ml_model::{Classifier, ImageClassifier, InferenceInput, InferenceOutput};
use crate::ml::preprocess::RawImage;
use crate::model::{load_model_with_metadata, InferRequest, InferResponse, InferenceConfig, ModelMetadata};

/// 推論エンジン
#[derive(Debug)]
pub struct ExportedModel<B: Backend> {
    network: Classifier<B>,
    config: InferenceConfig,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> ExportedModel<B> {
    /// 成果物を読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, ctx: &ExecutionContext<B>) -> Result<Self> {
        ctx.ensure(Mode::Inference)?;

        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let config = InferenceConfig::from_metadata(&metadata);

        let network = rebuild_network::<B>(&metadata.architecture, model_binary, &ctx.device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {}", e))?;

        Ok(Self {
            network,
            config,
            metadata,
            device: ctx.device.clone(),
        })
    }

    /// 名前付きリクエストを推論する
    ///
    /// バッチ次元は可変です。`data` は `shape` の行優先の平坦化として扱います。
    pub fn predict(&self, request: &InferRequest) -> Result<InferResponse> {
        self.config.check_request(request)?;

        let shape: [usize; 4] = request
            .shape
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("入力は4次元である必要があります: {:?}", request.shape))?;
        let img = Tensor::<B, 1>::from_floats(request.data.as_slice(), &self.device).reshape(shape);

        let result = self.infer(InferenceInput::new(img)).result;
        let out_shape = result.dims().to_vec();
        let data = result
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        Ok(InferResponse {
            name: self.config.output.name.clone(),
            shape: out_shape,
            data,
        })
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<String> {
        let raw = RawImage::from_png(image_path.as_ref())?;
        let contract = self.config.normalization;

        let request = InferRequest {
            name: self.config.input.name.clone(),
            shape: contract.input_shape().to_vec(),
            data: contract.normalize(&raw).values().to_vec(),
        };
        let response = self.predict(&request)?;

        let class_idx = response
            .argmax()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))?;
        let class_name = self
            .config
            .class_index_to_label(class_idx)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_idx))?;

        Ok(class_name.to_string())
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

impl<B: Backend> ImageClassifier<B> for ExportedModel<B> {
    fn infer(&self, input: InferenceInput<B>) -> InferenceOutput<B> {
        self.network.infer(input)
    }
}

/// ゴールデンデータ再生の結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub total: usize,
    pub matched: usize,
    /// 予測が `result` と一致しなかったレコードの番号
    pub mismatched: Vec<usize>,
}

impl ReplayReport {
    pub fn match_ratio(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.matched as f64 / self.total as f64)
    }
}

/// ゴールデンデータを推論サービスと同じ経路で再生する
///
/// 各レコードは形状の検証を経てから推論され、最大スコアのクラスを `result` と比較します。
/// 形状が不正なレコードがあればその時点でエラーを返します。
pub fn replay_golden<B: Backend>(
    model: &ExportedModel<B>,
    records: &[GoldenRecord],
) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();

    for (index, record) in records.iter().enumerate() {
        record
            .validate()
            .map_err(|e| anyhow::anyhow!("レコード {} が不正です: {}", index, e))?;

        let response = model.predict(&record.to_request())?;
        report.total += 1;
        if response.argmax() == Some(record.result) {
            report.matched += 1;
        } else {
            report.mismatched.push(index);
        }
    }

    log::info!(
        "ゴールデンデータ再生: {} 件中 {} 件一致",
        report.total,
        report.matched
    );
    if !report.mismatched.is_empty() {
        log::warn!("不一致のレコード: {:?}", report.mismatched);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContractError;
    use crate::ml::export::{export_model, TrainedModel};
    use crate::ml::ml_model::ClassifierConfig;
    use crate::ml::preprocess::{NormalizationContract, PIXELS};
    use burn::backend::NdArray;

    fn exported(dir: &Path) -> (std::path::PathBuf, Classifier<NdArray>) {
        let config = ClassifierConfig::new()
            .with_conv1_channels(4)
            .with_conv2_channels(8)
            .with_hidden_size(16);
        let network = config.init::<NdArray>(&Default::default());
        let state = TrainedModel {
            config,
            network: network.clone(),
            num_epochs: 1,
            test_accuracy: None,
        };
        let path = dir.join("demo.tar.gz");
        export_model(
            &state,
            &ExecutionContext::inference(Default::default()),
            &NormalizationContract::default(),
            &path,
        )
        .unwrap();
        (path, network)
    }

    fn sample_request() -> InferRequest {
        let raw = RawImage::from_vec((0..PIXELS).map(|i| (i % 200) as u8).collect()).unwrap();
        InferRequest {
            name: "img".to_string(),
            shape: vec![1, 1, 28, 28],
            data: NormalizationContract::default().normalize(&raw).values().to_vec(),
        }
    }

    #[test]
    fn test_loaded_model_matches_live_model() {
        let dir = tempfile::tempdir().unwrap();
        let (path, network) = exported(dir.path());
        let ctx = ExecutionContext::<NdArray>::inference(Default::default());
        let model = ExportedModel::load(&path, &ctx).unwrap();

        let request = sample_request();
        let response = model.predict(&request).unwrap();
        assert_eq!(response.name, "result");
        assert_eq!(response.shape, vec![1, 10]);
        assert_eq!(response.data.len(), 10);

        let img = Tensor::<NdArray, 1>::from_floats(request.data.as_slice(), &ctx.device)
            .reshape([1, 1, 28, 28]);
        let live = network
            .infer(InferenceInput::new(img))
            .result
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(response.data, live);
    }

    #[test]
    fn test_exports_are_deterministic() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (path_a, network) = exported(dir_a.path());

        // 同じネットワークをもう一度エクスポート
        let config = ClassifierConfig::new()
            .with_conv1_channels(4)
            .with_conv2_channels(8)
            .with_hidden_size(16);
        let path_b = dir_b.path().join("demo.tar.gz");
        export_model(
            &TrainedModel {
                config,
                network,
                num_epochs: 1,
                test_accuracy: None,
            },
            &ExecutionContext::inference(Default::default()),
            &NormalizationContract::default(),
            &path_b,
        )
        .unwrap();

        let ctx = ExecutionContext::<NdArray>::inference(Default::default());
        let a = ExportedModel::load(&path_a, &ctx).unwrap();
        let b = ExportedModel::load(&path_b, &ctx).unwrap();
        let request = sample_request();
        assert_eq!(
            a.predict(&request).unwrap().data,
            b.predict(&request).unwrap().data
        );
    }

    #[test]
    fn test_predict_rejects_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = exported(dir.path());
        let ctx = ExecutionContext::<NdArray>::inference(Default::default());
        let model = ExportedModel::load(&path, &ctx).unwrap();

        let mut request = sample_request();
        request.name = "image".to_string();
        assert!(model.predict(&request).is_err());

        let mut request = sample_request();
        request.data.pop();
        assert!(model.predict(&request).is_err());
    }

    #[test]
    fn test_predict_rejects_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = exported(dir.path());
        let ctx = ExecutionContext::<NdArray>::inference(Default::default());
        let model = ExportedModel::load(&path, &ctx).unwrap();

        let request = InferRequest {
            name: "img".to_string(),
            shape: vec![0, 1, 28, 28],
            data: Vec::new(),
        };
        let err = model.predict(&request).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContractError>(),
            Some(ContractError::Shape { .. })
        ));
    }

    #[test]
    fn test_replay_golden_counts_matches() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = exported(dir.path());
        let ctx = ExecutionContext::<NdArray>::inference(Default::default());
        let model = ExportedModel::load(&path, &ctx).unwrap();

        let request = sample_request();
        let predicted = model.predict(&request).unwrap().argmax().unwrap();
        let other = (predicted + 1) % 10;

        let records = vec![
            GoldenRecord {
                shape: request.shape.clone(),
                data: request.data.clone(),
                result: predicted,
            },
            GoldenRecord {
                shape: request.shape.clone(),
                data: request.data.clone(),
                result: other,
            },
        ];

        let report = replay_golden(&model, &records).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.matched, 1);
        assert_eq!(report.mismatched, vec![1]);
        assert_eq!(report.match_ratio(), Some(0.5));
    }

    #[test]
    fn test_replay_rejects_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = exported(dir.path());
        let ctx = ExecutionContext::<NdArray>::inference(Default::default());
        let model = ExportedModel::load(&path, &ctx).unwrap();

        let records = vec![GoldenRecord {
            shape: vec![1, 1, 28, 28],
            data: vec![0.0; 10],
            result: 0,
        }];
        assert!(replay_golden(&model, &records).is_err());
    }

    #[test]
    fn test_load_requires_inference_context() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = exported(dir.path());
        let ctx = ExecutionContext::<NdArray>::training(Default::default());
        assert!(ExportedModel::load(&path, &ctx).is_err());
    }
}
