//! フォルダ単位のラベル付き画像から分類モデルを学習し、保存したモデルで予測する

pub mod error;
pub mod dataset;
pub mod model;
pub mod ml;
pub mod logging;
pub mod interrupt;
pub mod train_commands;
pub mod predict_commands;

#[cfg(test)]
mod test_utils;

pub use error::{ClassifierError, Result};
pub use predict_commands::run_prediction_pipeline;
pub use train_commands::{run_training_pipeline, TrainingReport};
