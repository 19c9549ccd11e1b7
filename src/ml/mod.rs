pub mod ml_model;
pub mod metrics;
pub mod training;
pub mod inference;

pub use ml_model::{
    decode_and_normalize, ClassifierHead, FeatureExtractor, ImageClassifier, ModelConfig, FEATURE_DIM,
    MIN_IMAGE_SIZE,
};
pub use metrics::{argmax, MulticlassMetrics};
pub use training::{
    classifier_to_bytes, evaluate, fit, load_pretrained_backbone, predict_scores, train_classifier, EpochSummary,
    FitResult, ImageBatch, ImageBatcher, ImageDataset, ImageItem, TrainingOutcome,
};
pub use inference::{InferenceEngine, Prediction};
