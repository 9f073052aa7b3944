//! 実行コンテキスト（デバイスと実行モード）
//!
//! デバイスや学習/推論モードをグローバルに切り替えず、各処理に明示的に渡します。

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::ContractError;

/// 実行モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// パラメータを更新する（自動微分あり）
    Training,
    /// パラメータを更新しない（自動微分なし）
    Inference,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Training => write!(f, "training"),
            Mode::Inference => write!(f, "inference"),
        }
    }
}

/// 1回の実行で固定されるデバイスとモード
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    pub device: B::Device,
    pub mode: Mode,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn training(device: B::Device) -> Self {
        Self {
            device,
            mode: Mode::Training,
        }
    }

    pub fn inference(device: B::Device) -> Self {
        Self {
            device,
            mode: Mode::Inference,
        }
    }

    /// 同じデバイスのまま推論用バックエンドのコンテキストへ切り替える
    pub fn to_inference<I>(&self) -> ExecutionContext<I>
    where
        I: Backend<Device = B::Device>,
    {
        ExecutionContext::inference(self.device.clone())
    }

    /// 期待するモードで動作しているか確認
    pub fn ensure(&self, expected: Mode) -> Result<(), ContractError> {
        if self.mode != expected {
            return Err(ContractError::Mode {
                expected,
                actual: self.mode,
            });
        }
        Ok(())
    }
}
