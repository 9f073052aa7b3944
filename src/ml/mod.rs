pub mod context;
pub mod preprocess;
pub mod ml_model;
pub mod dataset;
pub mod training;
pub mod export;
pub mod golden;
pub mod inference;

pub use context::{ExecutionContext, Mode};
pub use preprocess::{NormalizationContract, NormalizedImage, RawImage, PIXELS};
pub use ml_model::{Classifier, ClassifierConfig, ImageClassifier, InferenceInput, InferenceOutput, NUM_CLASSES, CLASS_NAMES, INPUT_NAME, OUTPUT_NAME};
pub use dataset::{Sample, SampleDataset, Split};
pub use training::{Accuracy, EpochReport, train, evaluate, write_history};
pub use export::{TrainedModel, export_model};
pub use golden::{GoldenRecord, GoldenSummary, emit_golden_records, read_golden_records};
pub use inference::{ExportedModel, ReplayReport, replay_golden};
