//! 予測プログラムの処理本体

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use burn::tensor::backend::Backend;
use tracing::{info, warn};

use crate::dataset::{load_in_memory_images_from_directory, InMemoryImage};
use crate::error::{ClassifierError, Result};
use crate::ml::{InferenceEngine, Prediction};
use crate::model::AppConfig;

/// 公開済みモデルでフォルダ内の画像をすべて予測する
///
/// 先頭の画像で1回目（初回）と2回目（ウォーム）の予測時間を計測してから、
/// 全画像をバッチで予測して結果を表示する。
pub fn run_prediction_pipeline<B: Backend>(
    config: &AppConfig,
    device: &B::Device,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<(InMemoryImage, Prediction)>> {
    let model_path = config.assets.published_model_path();
    let load_started = Instant::now();
    let engine = InferenceEngine::<B>::load(&model_path, device)?;
    println!(
        "モデルを読み込みました: {} ({:.0} ms)",
        model_path.display(),
        load_started.elapsed().as_secs_f64() * 1000.0
    );
    engine.config().print_info();

    let images_dir = config.assets.prediction_images_dir();
    let images = load_in_memory_images_from_directory(&images_dir, &config.loader.unlabeled())?;
    if images.is_empty() {
        return Err(ClassifierError::EmptyDataset(images_dir.display().to_string()));
    }
    info!("予測対象: {} 枚 ({})", images.len(), images_dir.display());

    let first = &images[0];
    let started = Instant::now();
    let prediction = engine.predict(first)?;
    println!(
        "1回目の予測にかかった時間: {:.2} ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    InferenceEngine::<B>::print_prediction(first, &prediction);

    let started = Instant::now();
    let warm = engine.predict(first)?;
    println!(
        "2回目の予測にかかった時間: {:.2} ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    if warm.scores != prediction.scores {
        warn!("同じ画像の予測結果が1回目と異なります: {}", first.file_name);
    }

    println!("=============== フォルダ内の画像をすべて予測します ===============");
    let started = Instant::now();
    let predictions = engine.predict_batch(&images, &cancel)?;
    for (image, prediction) in images.iter().zip(&predictions) {
        println!(
            "画像ファイル: [{}], 予測ラベル: [{}], 確率: [{:.4}]",
            image.file_name,
            prediction.predicted_label,
            prediction.top_probability()
        );
    }
    println!(
        "{} 枚の予測にかかった時間: {:.0} ms",
        predictions.len(),
        started.elapsed().as_secs_f64() * 1000.0
    );

    Ok(images.into_iter().zip(predictions).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{classifier_to_bytes, train_classifier};
    use crate::model::save_model_with_metadata;
    use crate::test_utils::{backend_lock, toy_config, toy_images, write_png, TestBackend};

    #[test]
    fn predicts_every_image_in_folder() {
        let _guard = backend_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut config = toy_config();
        config.assets.root = dir.path().to_path_buf();
        let device = Default::default();

        let outcome =
            train_classifier::<TestBackend>(&config, toy_images(10), &device, &AtomicBool::new(false)).unwrap();
        save_model_with_metadata(
            &config.assets.published_model_path(),
            &outcome.metadata,
            &classifier_to_bytes(&outcome.model).unwrap(),
        )
        .unwrap();

        let folder = config.assets.prediction_images_dir();
        for i in 0..3u8 {
            write_png(&folder.join(format!("sample{i}.png")), [200, 30 + i, 40]);
        }
        std::fs::write(folder.join("README.md"), b"not an image").unwrap();

        let results =
            run_prediction_pipeline::<TestBackend>(&config, &device, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(results.len(), 3);
        let names: Vec<_> = results.iter().map(|(image, _)| image.file_name.as_str()).collect();
        assert_eq!(names, ["sample0.png", "sample1.png", "sample2.png"]);
        for (_, prediction) in &results {
            assert!(["blue", "red"].contains(&prediction.predicted_label.as_str()));
        }
    }

    #[test]
    fn raised_cancel_flag_stops_folder_prediction() {
        let _guard = backend_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut config = toy_config();
        config.assets.root = dir.path().to_path_buf();
        let device = Default::default();

        let outcome =
            train_classifier::<TestBackend>(&config, toy_images(5), &device, &AtomicBool::new(false)).unwrap();
        save_model_with_metadata(
            &config.assets.published_model_path(),
            &outcome.metadata,
            &classifier_to_bytes(&outcome.model).unwrap(),
        )
        .unwrap();
        write_png(&config.assets.prediction_images_dir().join("sample.png"), [200, 30, 40]);

        let err = run_prediction_pipeline::<TestBackend>(&config, &device, Arc::new(AtomicBool::new(true)))
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Cancelled));
    }

    #[test]
    fn missing_published_model_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = toy_config();
        config.assets.root = dir.path().to_path_buf();

        let err = run_prediction_pipeline::<TestBackend>(&config, &Default::default(), Arc::new(AtomicBool::new(false)))
            .unwrap_err();
        assert!(matches!(err, ClassifierError::ModelLoad { .. }));
    }
}
