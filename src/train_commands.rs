//! 学習プログラムの処理本体

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use burn::tensor::backend::Backend;
use tracing::{info, warn};

use crate::dataset::{load_images_from_directory, InMemoryImage};
use crate::error::{ClassifierError, Result};
use crate::ml::{classifier_to_bytes, train_classifier, InferenceEngine, MulticlassMetrics};
use crate::model::{print_metadata_info, publish_model, save_model_with_metadata, AppConfig, ModelMetadata};

/// 学習実行の結果
#[derive(Debug)]
pub struct TrainingReport {
    pub metrics: MulticlassMetrics,
    pub metadata: ModelMetadata,
    pub output_model: PathBuf,
    pub published_model: PathBuf,
}

/// 学習パイプライン
///
/// 画像の読み込み -> 学習/評価 -> 保存・公開 -> テスト画像1枚での動作確認
pub fn run_training_pipeline<B: Backend>(
    config: &AppConfig,
    device: &B::Device,
    cancel: Arc<AtomicBool>,
) -> Result<TrainingReport> {
    config.validate()?;

    let images_dir = config.assets.training_images_dir();
    info!("学習用画像フォルダ: {}", images_dir.display());

    let records = load_images_from_directory(&images_dir, &config.loader)?;
    if records.is_empty() {
        return Err(ClassifierError::EmptyDataset(images_dir.display().to_string()));
    }
    let images = records
        .iter()
        .map(InMemoryImage::from_record)
        .collect::<Result<Vec<_>>>()?;
    println!("画像の読み込み: {} 枚", images.len());

    println!("=============== モデルを学習しています ===============");
    let outcome = train_classifier::<B>(config, images, device, &cancel)?;
    println!(
        "学習にかかった時間: {:.0} ms ({} エポック)",
        outcome.fit_duration.as_secs_f64() * 1000.0,
        outcome.history.len()
    );

    println!("=============== テストデータで評価しています ===============");
    println!(
        "評価にかかった時間: {:.0} ms ({} 枚)",
        outcome.evaluate_duration.as_secs_f64() * 1000.0,
        outcome.test_size
    );
    outcome.metrics.print("ImageClassifier", &outcome.labels);

    let binary = classifier_to_bytes(&outcome.model)?;
    let output_model = save_model_with_metadata(&config.assets.output_model_path(), &outcome.metadata, &binary)?;
    let published_model = config.assets.published_model_path();
    publish_model(&output_model, &published_model)?;
    println!("モデルを保存しました: {}", output_model.display());
    println!("予測プログラム用にコピーしました: {}", published_model.display());
    print_metadata_info(&outcome.metadata);

    // 学習直後のモデルでテスト画像を1枚予測
    let engine = InferenceEngine::from_trained(outcome.model, &outcome.metadata, device);
    match first_test_image(config)? {
        Some(image) => {
            let prediction = engine.predict(&image)?;
            println!("=============== 学習済みモデルで1枚予測します ===============");
            InferenceEngine::<B>::print_prediction(&image, &prediction);
        }
        None => warn!(
            "テスト画像が見つからないため動作確認をスキップします: {}",
            config.assets.test_images_dir().display()
        ),
    }

    Ok(TrainingReport {
        metrics: outcome.metrics,
        metadata: outcome.metadata,
        output_model,
        published_model,
    })
}

fn first_test_image(config: &AppConfig) -> Result<Option<InMemoryImage>> {
    let dir = config.assets.test_images_dir();
    if !dir.is_dir() {
        return Ok(None);
    }
    load_images_from_directory(&dir, &config.loader.unlabeled())?
        .first()
        .map(InMemoryImage::from_record)
        .transpose()
}
