//! エクスポートされるモデルのマニフェスト
//!
//! マニフェストだけでネットワーク構造・入出力シグネチャ・前処理を復元できるようにします。
//! 学習コードを読み込まない推論サービスもこの情報だけで動作します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::preprocess::NormalizationContract;
use crate::ml::ClassifierConfig;

/// マニフェストの形式バージョン
pub const FORMAT_VERSION: u32 = 1;

/// 要素型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
}

/// 名前付きテンソルの仕様
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    /// 先頭はバッチ次元
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn f32(name: &str, shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            dtype: DType::F32,
            shape: shape.to_vec(),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - manifest.json: このメタデータ（JSON形式）
/// - weights.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// ネットワーク構造（これだけでモデルを再構築できる）
    pub architecture: ClassifierConfig,

    /// 入力 `img` [1, 1, 28, 28]
    pub input: TensorSpec,

    /// 出力 `result` [1, num_classes]
    pub output: TensorSpec,

    /// 学習時の正規化定数
    pub normalization: NormalizationContract,

    /// クラスインデックス順のクラス名
    pub class_names: Vec<String>,

    /// 学習エポック数
    pub num_epochs: usize,

    /// 評価データでの正解率（評価していない場合は `None`）
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// モデルのエクスポート時刻（RFC3339形式）
    pub exported_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        architecture: ClassifierConfig,
        input: TensorSpec,
        output: TensorSpec,
        normalization: NormalizationContract,
        class_names: Vec<String>,
        num_epochs: usize,
        test_accuracy: Option<f64>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            architecture,
            input,
            output,
            normalization,
            class_names,
            num_epochs,
            test_accuracy,
            exported_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize manifest to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize manifest from JSON")?;
        if metadata.format_version != FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported manifest format version {} (expected {})",
                metadata.format_version,
                FORMAT_VERSION
            );
        }
        Ok(metadata)
    }
}
