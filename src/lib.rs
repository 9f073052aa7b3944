// 学習・エクスポート・ゴールデンデータ出力
pub mod error;
pub mod ml;
pub mod model;
pub mod pipeline;

pub use error::{ContractError, ExportError};
pub use pipeline::{load_datasets, run, RunSummary};
