//! モデル学習と評価
//!
//! INIT -> (FORWARD -> LOSS -> BACKWARD -> UPDATE) x N エポック -> EVAL -> DONE

use std::path::Path;

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{activation::softmax, backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use serde::Serialize;

use crate::error::ContractError;
use crate::ml::context::{ExecutionContext, Mode};
use crate::ml::dataset::{SampleBatcher, SampleDataset};
use crate::ml::ml_model::{forward_classification, ImageClassifier, InferenceInput};
use crate::ml::preprocess::NormalizationContract;
use crate::model::TrainingSettings;

/// 1エポック分の学習結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub total_epochs: usize,
    pub num_batches: usize,
    /// バッチごとの損失の平均
    pub mean_loss: f64,
}

/// 正解数と評価数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    /// 評価数が0の場合は `None`
    pub fn ratio(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.correct as f64 / self.total as f64)
    }
}

/// モデル学習を実行
///
/// エポックごとにデータをシャッフルし、すべてのバッチで1回ずつ最適化ステップを行います。
/// 途中で失敗した場合のリトライや部分的な再開はありません。
pub fn train<B, M>(
    ctx: &ExecutionContext<B>,
    mut model: M,
    dataset: SampleDataset,
    settings: &TrainingSettings,
    contract: NormalizationContract,
    mut on_epoch: impl FnMut(&EpochReport),
) -> Result<M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
{
    ctx.ensure(Mode::Training)?;

    if dataset.is_empty() {
        anyhow::bail!("学習データが見つかりません");
    }
    if settings.batch_size == 0 {
        anyhow::bail!("バッチサイズは1以上である必要があります");
    }

    log::info!(
        "学習を開始します: {} 枚, エポック数: {}, バッチサイズ: {}, 学習率: {}",
        dataset.len(),
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );

    let batcher = SampleBatcher::<B>::new(ctx.device.clone(), contract);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .build(dataset);

    let mut optim = AdamConfig::new().init::<B, M>();

    for epoch in 1..=settings.num_epochs {
        let mut running_loss = 0.0;
        let mut num_batches = 0;

        for batch in dataloader.iter() {
            let item = forward_classification(&model, batch);
            running_loss += item.loss.clone().into_scalar().elem::<f64>();
            num_batches += 1;

            let grads = item.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        let report = EpochReport {
            epoch,
            total_epochs: settings.num_epochs,
            num_batches,
            mean_loss: running_loss / num_batches.max(1) as f64,
        };

        if report.mean_loss.is_finite() {
            log::info!(
                "Epoch {}/{} - Training loss: {:.6}",
                report.epoch,
                report.total_epochs,
                report.mean_loss
            );
        } else {
            log::warn!(
                "Epoch {}/{} - Training loss is not finite: {}",
                report.epoch,
                report.total_epochs,
                report.mean_loss
            );
        }
        on_epoch(&report);
    }

    Ok(model)
}

/// 評価データで正解率を測定
///
/// 推論モードのコンテキスト（自動微分なしのバックエンド）が必要です。
/// スコアをsoftmaxで確率に変換し、最大のクラスを予測とします。
pub fn evaluate<B, M>(
    model: &M,
    ctx: &ExecutionContext<B>,
    contract: NormalizationContract,
    dataset: SampleDataset,
    batch_size: usize,
) -> Result<Accuracy, ContractError>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    ctx.ensure(Mode::Inference)?;

    let mut accuracy = Accuracy::default();
    if dataset.is_empty() {
        return Ok(accuracy);
    }

    let batcher = SampleBatcher::<B>::new(ctx.device.clone(), contract);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size.max(1))
        .build(dataset);

    for batch in dataloader.iter() {
        let [num_items] = batch.targets.dims();
        let scores = model.infer(InferenceInput::new(batch.images)).result;
        let probabilities = softmax(scores, 1);
        let predicted = probabilities.argmax(1);
        let targets = batch.targets.reshape([num_items, 1]);

        let correct = predicted
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        accuracy.correct += correct as usize;
        accuracy.total += num_items;
    }

    Ok(accuracy)
}

/// エポックごとの損失をCSVに書き出す（発散の確認用）
pub fn write_history(path: &Path, reports: &[EpochReport]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create history file: {:?}", path))?;
    for report in reports {
        writer.serialize(report)?;
    }
    writer.flush()?;
    Ok(())
}
