//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデル・学習・データ・エクスポート先をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::ClassifierConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
    /// WGPU (GPU) バックエンド（`wgpu` フィーチャが必要）
    Wgpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Conv1 の出力チャンネル数
    pub conv1_channels: usize,
    /// Conv2 の出力チャンネル数
    pub conv2_channels: usize,
    /// 全結合層の中間次元
    pub hidden_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            conv1_channels: 16,
            conv2_channels: 32,
            hidden_size: 128,
            dropout: 0.25,
        }
    }
}

impl ModelSettings {
    /// ネットワーク構造の設定に変換
    pub fn to_classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig::new()
            .with_conv1_channels(self.conv1_channels)
            .with_conv2_channels(self.conv2_channels)
            .with_hidden_size(self.hidden_size)
            .with_dropout(self.dropout)
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// シャッフル用のランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 64,
            learning_rate: 0.01,
            seed: 42,
        }
    }
}

/// 学習・評価データの取得元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// IDX形式のファイルがあるディレクトリ
    pub dataset_dir: Option<String>,
    /// `dataset_dir` がない場合に生成する合成データのクラスあたり枚数
    pub synthetic_per_class: usize,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            dataset_dir: None,
            synthetic_per_class: 100,
        }
    }
}

/// ゴールデンレコードの `result` に書き込むラベル
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GoldenLabel {
    /// データセットの正解ラベル（データセットの正しさを検証する）
    #[default]
    GroundTruth,
    /// 学習済みモデルの予測（推論サービスとのずれを検出する）
    Prediction,
}

/// エクスポート設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// エクスポートするモデルのパス（tar.gz）
    pub artifact_path: String,
    /// ゴールデンレコードの出力パス（1行1レコードのJSON）
    pub golden_path: String,
    /// ゴールデンレコードに書き込むラベルの種類
    #[serde(default)]
    pub golden_label: GoldenLabel,
    /// エポックごとの損失を書き出すCSV
    #[serde(default)]
    pub history_path: Option<String>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            artifact_path: "demo.tar.gz".to_string(),
            golden_path: "dump.json".to_string(),
            golden_label: GoldenLabel::default(),
            history_path: Some("history.csv".to_string()),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ設定
    #[serde(default)]
    pub data: DataSettings,
    /// エクスポート設定
    pub export: ExportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// 読み込みに失敗した場合もデフォルト設定を使います。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                log::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                log::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出す
    pub fn log_summary(&self) {
        log::info!("計算デバイス: {}", self.device_type);
        log::info!(
            "モデル: conv {} -> {}, hidden {}, dropout {}",
            self.model.conv1_channels,
            self.model.conv2_channels,
            self.model.hidden_size,
            self.model.dropout
        );
        log::info!(
            "トレーニング: エポック数 {}, バッチサイズ {}, 学習率 {}, シード {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed
        );
        log::info!(
            "エクスポート: モデル {}, ゴールデンレコード {} ({:?})",
            self.export.artifact_path,
            self.export.golden_path,
            self.export.golden_label
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.export.golden_label, GoldenLabel::GroundTruth);
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut config = AppConfig::default();
        config.export.golden_label = GoldenLabel::Prediction;

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"golden_label\":\"prediction\""));

        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(deserialized.export.golden_label, GoldenLabel::Prediction);
    }

    #[test]
    fn test_load_or_default_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(AppConfig::load_or_default(&path).training.seed, 42);

        let mut config = AppConfig::default();
        config.training.seed = 7;
        config.save(&path).unwrap();
        assert_eq!(AppConfig::load_or_default(&path).training.seed, 7);

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(AppConfig::load_or_default(&path).training.seed, 42);
    }

    #[test]
    fn test_model_settings_to_classifier_config() {
        let settings = ModelSettings::default();
        let config = settings.to_classifier_config();
        assert_eq!(config.num_classes, 10);
        assert_eq!(config.hidden_size, settings.hidden_size);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
