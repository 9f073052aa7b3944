//! 学習側と推論サービス側の境界で発生するエラー

use crate::ml::context::Mode;

/// 前処理・入出力シグネチャの契約違反
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractError {
    #[error("pixel count mismatch: expected {expected}, got {actual}")]
    PixelCount { expected: usize, actual: usize },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("label {label} is out of range (num_classes = {num_classes})")]
    Label { label: usize, num_classes: usize },

    #[error("input name mismatch: expected '{expected}', got '{actual}'")]
    InputName { expected: String, actual: String },

    #[error("element count mismatch: shape implies {expected}, got {actual}")]
    ElementCount { expected: usize, actual: usize },

    #[error("operation requires {expected} mode, context is in {actual} mode")]
    Mode { expected: Mode, actual: Mode },
}

/// モデルのエクスポート失敗
///
/// どれも致命的で、フォールバックはありません。
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// マニフェストだけからモデルを再構築できない
    #[error("model cannot be exported as a self-describing artifact: {0}")]
    Unscriptable(String),

    #[error("failed to encode or decode model record: {0}")]
    Record(String),

    #[error("failed to write artifact: {0:#}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Contract(#[from] ContractError),
}
