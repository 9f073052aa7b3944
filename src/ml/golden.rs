//! ゴールデンデータの出力
//!
//! 1行に1つのJSONオブジェクト `{"shape": [1,1,28,28], "data": [...], "result": n}` を書き出します。
//! `data` はモデルに渡したテンソルそのものを行優先で平坦化したものです。

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use burn::tensor::{backend::Backend, ElementConversion};
use serde::{Deserialize, Serialize};

use crate::error::ContractError;
use crate::ml::context::{ExecutionContext, Mode};
use crate::ml::dataset::SampleDataset;
use crate::ml::ml_model::{ImageClassifier, InferenceInput, INPUT_NAME, NUM_CLASSES};
use crate::ml::preprocess::{NormalizationContract, CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH};
use crate::model::{GoldenLabel, InferRequest};

/// ゴールデンデータ1件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoldenRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub result: usize,
}

impl GoldenRecord {
    /// `shape` が [1, 1, 28, 28] で、`data` の長さが形状の積と一致すること
    pub fn validate(&self) -> Result<(), ContractError> {
        let expected = [1, CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH];
        if self.shape != expected {
            return Err(ContractError::Shape {
                expected: expected.to_vec(),
                actual: self.shape.clone(),
            });
        }

        let count = self.shape.iter().product::<usize>();
        if self.data.len() != count {
            return Err(ContractError::ElementCount {
                expected: count,
                actual: self.data.len(),
            });
        }

        if self.result >= NUM_CLASSES {
            return Err(ContractError::Label {
                label: self.result,
                num_classes: NUM_CLASSES,
            });
        }
        Ok(())
    }

    /// 推論サービスへのリクエストに変換
    pub fn to_request(&self) -> InferRequest {
        InferRequest {
            name: INPUT_NAME.to_string(),
            shape: self.shape.clone(),
            data: self.data.clone(),
        }
    }
}

/// 出力結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GoldenSummary {
    /// 書き出した件数
    pub written: usize,
    /// 予測が正解ラベルと一致した件数
    pub agreed: usize,
}

/// 評価データのゴールデンレコードをファイルに書き出す
///
/// 既存のファイルは切り詰めて上書きします。書き込みの途中で失敗した場合、
/// それまでに書いた行はファイルに残ります。
pub fn emit_golden_records<B, M>(
    model: &M,
    ctx: &ExecutionContext<B>,
    contract: &NormalizationContract,
    samples: &SampleDataset,
    label_source: GoldenLabel,
    path: &Path,
) -> Result<GoldenSummary>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    ctx.ensure(Mode::Inference)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let file = File::create(path)
        .with_context(|| format!("Failed to create golden file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    let mut summary = GoldenSummary::default();

    for index in 0..samples.len() {
        let Some(sample) = samples.get(index) else {
            continue;
        };

        let input = contract.input_tensor::<B>(&sample.image, &ctx.device)?;
        let shape = input.dims().to_vec();
        let data = input
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("入力テンソルの取得エラー: {:?}", e))?;

        let scores = model.infer(InferenceInput::new(input)).result;
        let predicted = scores.argmax(1).into_scalar().elem::<i64>() as usize;
        if predicted == sample.label {
            summary.agreed += 1;
        }

        let record = GoldenRecord {
            shape,
            data,
            result: match label_source {
                GoldenLabel::GroundTruth => sample.label,
                GoldenLabel::Prediction => predicted,
            },
        };
        record.validate()?;

        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
        summary.written += 1;
    }

    writer.flush()?;

    log::info!(
        "ゴールデンデータを書き出しました: {} ({} 件, 予測一致 {} 件, ラベル: {:?})",
        path.display(),
        summary.written,
        summary.agreed,
        label_source
    );

    Ok(summary)
}

/// ゴールデンデータを読み込む（空行は無視）
pub fn read_golden_records(path: &Path) -> Result<Vec<GoldenRecord>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open golden file: {:?}", path))?;

    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: GoldenRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid golden record at line {}", line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}
