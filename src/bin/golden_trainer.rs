//! 学習・ゴールデンデータ再生・単一画像推論のコマンドラインツール

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray};
use clap::{Parser, Subcommand};

use golden_trainer_lib::ml::{read_golden_records, replay_golden, ExecutionContext, ExportedModel};
use golden_trainer_lib::model::{log_metadata_info, AppConfig, DeviceType};
use golden_trainer_lib::pipeline;

#[derive(Parser, Debug)]
#[command(name = "golden_trainer", version, about = "Image classifier trainer and golden fixture generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train, evaluate, export the model and write golden records
    Train {
        /// Path to the JSON config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory holding the IDX dataset files
        #[arg(long, conflicts_with = "synthetic")]
        dataset_dir: Option<String>,

        /// Generate N images per class instead of reading a dataset directory
        #[arg(long, value_name = "N")]
        synthetic: Option<usize>,

        /// Remove an existing artifact before exporting
        #[arg(long)]
        force: bool,
    },
    /// Replay golden records against an exported artifact
    Replay {
        #[arg(long, default_value = "demo.tar.gz")]
        artifact: PathBuf,

        #[arg(long, default_value = "dump.json")]
        golden: PathBuf,
    },
    /// Classify a single 28x28 image with an exported artifact
    Predict {
        #[arg(long, default_value = "demo.tar.gz")]
        artifact: PathBuf,

        #[arg(long)]
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            dataset_dir,
            synthetic,
            force,
        } => {
            let config_path = config.unwrap_or_else(AppConfig::default_path);
            let mut config = AppConfig::load_or_default(&config_path);
            if let Some(dir) = dataset_dir {
                config.data.dataset_dir = Some(dir);
            }
            if let Some(per_class) = synthetic {
                config.data.dataset_dir = None;
                config.data.synthetic_per_class = per_class;
            }
            train(&config, force)
        }
        Command::Replay { artifact, golden } => replay(&artifact, &golden),
        Command::Predict { artifact, image } => predict(&artifact, &image),
    }
}

fn train(config: &AppConfig, force: bool) -> Result<()> {
    config.log_summary();

    let artifact_path = Path::new(&config.export.artifact_path);
    if force && artifact_path.exists() {
        log::warn!("既存の成果物を削除します: {}", artifact_path.display());
        std::fs::remove_file(artifact_path)
            .with_context(|| format!("Failed to remove {:?}", artifact_path))?;
    }

    let (train_set, test_set) = pipeline::load_datasets(&config.data, config.training.seed)?;

    let summary = match config.device_type {
        DeviceType::Cpu => pipeline::run::<Autodiff<NdArray>>(config, Default::default(), train_set, test_set)?,
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            use burn::backend::{wgpu::WgpuDevice, Wgpu};
            pipeline::run::<Autodiff<Wgpu>>(config, WgpuDevice::default(), train_set, test_set)?
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => anyhow::bail!("WGPUバックエンドを使うには `wgpu` フィーチャを有効にしてビルドしてください"),
    };

    log::info!("=== 完了 ===");
    if let Some(last) = summary.epochs.last() {
        log::info!("最終エポックの損失: {:.6}", last.mean_loss);
    }
    if let Some(ratio) = summary.accuracy.ratio() {
        log::info!("正解率: {:.2}%", ratio * 100.0);
    }
    log::info!(
        "ゴールデンレコード: {} 件 (予測一致 {} 件)",
        summary.golden.written,
        summary.golden.agreed
    );
    Ok(())
}

fn replay(artifact: &Path, golden: &Path) -> Result<()> {
    let ctx = ExecutionContext::<NdArray>::inference(Default::default());
    let model = ExportedModel::load(artifact, &ctx)?;
    log_metadata_info(model.metadata());

    let records = read_golden_records(golden)?;
    let report = replay_golden(&model, &records)?;

    if let Some(ratio) = report.match_ratio() {
        println!("{}/{} matched ({:.2}%)", report.matched, report.total, ratio * 100.0);
    } else {
        println!("no records");
    }
    Ok(())
}

fn predict(artifact: &Path, image: &Path) -> Result<()> {
    let ctx = ExecutionContext::<NdArray>::inference(Default::default());
    let model = ExportedModel::load(artifact, &ctx)?;
    model.config().log_info();

    let class_name = model.classify_image(image)?;
    println!("{}", class_name);
    Ok(())
}
