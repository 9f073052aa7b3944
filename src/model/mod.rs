pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::{DType, ModelMetadata, TensorSpec};
pub use model_storage::{save_model_with_metadata, load_metadata, load_model_with_metadata, log_metadata_info};
pub use inference_config::{InferRequest, InferResponse, InferenceConfig};
pub use config::{AppConfig, DataSettings, DeviceType, ExportSettings, GoldenLabel, ModelSettings, TrainingSettings};
