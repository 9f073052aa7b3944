//! 学習からゴールデンデータ出力までの一連の処理
//!
//! 生データ → 前処理 → 学習 → 評価 → エクスポート → ゴールデンデータ の順に実行します。

use std::path::Path;

use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;

use crate::ml::{
    emit_golden_records, evaluate, export_model, train, write_history, Accuracy, EpochReport,
    ExecutionContext, GoldenSummary, NormalizationContract, SampleDataset, Split, TrainedModel,
};
use crate::model::{AppConfig, DataSettings, ModelMetadata};

/// 学習データと評価データを読み込む
///
/// `dataset_dir` が指定されていればIDX形式のファイルを、なければ合成データを使います。
/// 合成データの評価用はクラスあたり学習用の1/5（最低1枚）で、シードも別にします。
pub fn load_datasets(settings: &DataSettings, seed: u64) -> Result<(SampleDataset, SampleDataset)> {
    match &settings.dataset_dir {
        Some(dir) => {
            let dir = Path::new(dir);
            let train_set = SampleDataset::from_idx_dir(dir, Split::Train)
                .with_context(|| format!("Failed to load training data from {:?}", dir))?;
            let test_set = SampleDataset::from_idx_dir(dir, Split::Test)
                .with_context(|| format!("Failed to load test data from {:?}", dir))?;
            Ok((train_set, test_set))
        }
        None => {
            let per_class = settings.synthetic_per_class;
            log::info!("合成データを使用します（クラスあたり {} 枚）", per_class);
            Ok((
                SampleDataset::synthetic(per_class, seed),
                SampleDataset::synthetic((per_class / 5).max(1), seed.wrapping_add(1)),
            ))
        }
    }
}

/// 1回の実行結果
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub epochs: Vec<EpochReport>,
    pub accuracy: Accuracy,
    pub metadata: ModelMetadata,
    pub golden: GoldenSummary,
}

/// 学習・評価・エクスポート・ゴールデンデータ出力を順に実行
///
/// 成果物のパスに既にファイルがある場合は学習を始める前にエラーを返します。
pub fn run<B: AutodiffBackend>(
    config: &AppConfig,
    device: B::Device,
    train_set: SampleDataset,
    test_set: SampleDataset,
) -> Result<RunSummary> {
    let artifact_path = Path::new(&config.export.artifact_path);
    if artifact_path.exists() {
        anyhow::bail!(
            "成果物が既に存在します（上書きしません）: {}",
            artifact_path.display()
        );
    }

    let contract = NormalizationContract::FASHION_MNIST_V1;
    let architecture = config.model.to_classifier_config();
    let train_ctx = ExecutionContext::<B>::training(device);

    let mut epochs = Vec::with_capacity(config.training.num_epochs);
    let model = train(
        &train_ctx,
        architecture.init::<B>(&train_ctx.device),
        train_set,
        &config.training,
        contract,
        |report| epochs.push(report.clone()),
    )?;

    if let Some(history_path) = &config.export.history_path {
        write_history(Path::new(history_path), &epochs)?;
        log::info!("学習履歴を保存しました: {}", history_path);
    }

    let network = model.valid();
    let infer_ctx = train_ctx.to_inference::<B::InnerBackend>();

    let accuracy = evaluate(
        &network,
        &infer_ctx,
        contract,
        test_set.clone(),
        config.training.batch_size,
    )?;
    match accuracy.ratio() {
        Some(ratio) => log::info!(
            "評価データ正解率: {:.2}% ({}/{})",
            ratio * 100.0,
            accuracy.correct,
            accuracy.total
        ),
        None => log::warn!("評価データがありません"),
    }

    let state = TrainedModel {
        config: architecture,
        network,
        num_epochs: config.training.num_epochs,
        test_accuracy: accuracy.ratio(),
    };
    let metadata = export_model(&state, &infer_ctx, &contract, artifact_path)
        .context("Failed to export model")?;

    let golden = emit_golden_records(
        &state.network,
        &infer_ctx,
        &contract,
        &test_set,
        config.export.golden_label,
        Path::new(&config.export.golden_path),
    )?;

    Ok(RunSummary {
        epochs,
        accuracy,
        metadata,
        golden,
    })
}
