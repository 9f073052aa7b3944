//! マニフェストから得られる推論用の設定
//!
//! 推論リクエストが入出力シグネチャに合っているかをここで検証します。

use serde::{Deserialize, Serialize};

use crate::error::ContractError;
use crate::ml::preprocess::NormalizationContract;
use crate::model::model_metadata::{ModelMetadata, TensorSpec};

/// 名前付きの推論リクエスト（行優先で平坦化したデータ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferRequest {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// 名前付きの推論レスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferResponse {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl InferResponse {
    /// 最大スコアのクラスインデックス（同点の場合は先頭）
    pub fn argmax(&self) -> Option<usize> {
        self.data
            .iter()
            .enumerate()
            .rev()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(index, _)| index)
    }
}

/// モデルマニフェストから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub input: TensorSpec,
    pub output: TensorSpec,
    pub normalization: NormalizationContract,
    pub class_names: Vec<String>,
}

impl InferenceConfig {
    /// マニフェストからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            input: metadata.input.clone(),
            output: metadata.output.clone(),
            normalization: metadata.normalization,
            class_names: metadata.class_names.clone(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスインデックスからクラス名を取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }

    /// リクエストを入力シグネチャと照合する
    ///
    /// 入力名・次元数・バッチ次元（空は不可）・それ以外の各次元・要素数の順に確認します。
    pub fn check_request(&self, request: &InferRequest) -> Result<(), ContractError> {
        if request.name != self.input.name {
            return Err(ContractError::InputName {
                expected: self.input.name.clone(),
                actual: request.name.clone(),
            });
        }

        // バッチ次元は1以上、それ以外の次元は一致すること
        let rank_matches = request.shape.len() == self.input.shape.len();
        if !rank_matches
            || request.shape.first().map_or(true, |&batch| batch == 0)
            || request.shape.get(1..) != self.input.shape.get(1..)
        {
            return Err(ContractError::Shape {
                expected: self.input.shape.clone(),
                actual: request.shape.clone(),
            });
        }

        let expected = request.shape.iter().product::<usize>();
        if request.data.len() != expected {
            return Err(ContractError::ElementCount {
                expected,
                actual: request.data.len(),
            });
        }

        Ok(())
    }

    /// 設定情報をログに出す
    pub fn log_info(&self) {
        log::info!("=== 推論設定 ===");
        log::info!("入力: {} {:?}", self.input.name, self.input.shape);
        log::info!("出力: {} {:?}", self.output.name, self.output.shape);
        log::info!("クラス数: {}", self.num_classes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InferenceConfig {
        InferenceConfig {
            input: TensorSpec::f32("img", &[1, 1, 28, 28]),
            output: TensorSpec::f32("result", &[1, 10]),
            normalization: NormalizationContract::default(),
            class_names: (0..10).map(|i| format!("class_{i}")).collect(),
        }
    }

    fn request(name: &str, shape: &[usize], len: usize) -> InferRequest {
        InferRequest {
            name: name.to_string(),
            shape: shape.to_vec(),
            data: vec![0.0; len],
        }
    }

    #[test]
    fn test_check_request_accepts_batches() {
        let config = config();
        assert!(config.check_request(&request("img", &[1, 1, 28, 28], 784)).is_ok());
        assert!(config.check_request(&request("img", &[2, 1, 28, 28], 1568)).is_ok());
    }

    #[test]
    fn test_check_request_errors() {
        let config = config();

        assert!(matches!(
            config.check_request(&request("image", &[1, 1, 28, 28], 784)),
            Err(ContractError::InputName { .. })
        ));
        assert!(matches!(
            config.check_request(&request("img", &[1, 28, 28], 784)),
            Err(ContractError::Shape { .. })
        ));
        assert!(matches!(
            config.check_request(&request("img", &[1, 1, 28, 27], 756)),
            Err(ContractError::Shape { .. })
        ));
        assert!(matches!(
            config.check_request(&request("img", &[], 0)),
            Err(ContractError::Shape { .. })
        ));
        assert_eq!(
            config.check_request(&request("img", &[1, 1, 28, 28], 783)),
            Err(ContractError::ElementCount {
                expected: 784,
                actual: 783
            })
        );
    }

    #[test]
    fn test_check_request_rejects_empty_batch() {
        let config = config();
        assert_eq!(
            config.check_request(&request("img", &[0, 1, 28, 28], 0)),
            Err(ContractError::Shape {
                expected: vec![1, 1, 28, 28],
                actual: vec![0, 1, 28, 28],
            })
        );
    }

    #[test]
    fn test_class_index_to_label() {
        let config = config();
        assert_eq!(config.class_index_to_label(4), Some("class_4"));
        assert_eq!(config.class_index_to_label(10), None);
    }

    #[test]
    fn test_response_argmax() {
        let response = InferResponse {
            name: "result".to_string(),
            shape: vec![1, 3],
            data: vec![-1.0, 3.5, 0.2],
        };
        assert_eq!(response.argmax(), Some(1));
    }
}
