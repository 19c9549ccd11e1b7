//! モデル学習と評価

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use burn::{
    backend::Autodiff,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, ElementConversion, Int, Tensor},
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::dataset::{train_test_split, InMemoryImage, LabelMap};
use crate::error::{ClassifierError, Result};
use crate::ml::inference::classifier_from_bytes;
use crate::ml::metrics::{argmax, MulticlassMetrics};
use crate::ml::{decode_and_normalize, FeatureExtractor, ImageClassifier, ModelConfig};
use crate::model::{load_model_with_metadata, AppConfig, ModelMetadata, ModelSettings, TrainingSettings};

/// 学習ログのターゲット名
const TRAINER_TARGET: &str = "image_classifier::trainer";

/// データセットアイテム（デコード・正規化済みの画素とクラスキー）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub pixels: Vec<f32>,
    pub key: usize,
}

/// 学習・評価用データセット
pub struct ImageDataset {
    items: Vec<ImageItem>,
    image_size: usize,
}

impl ImageDataset {
    /// メモリ上の画像をデコードしてデータセットを作成
    ///
    /// すべての画像がラベルを持ち、そのラベルが `labels` に含まれている必要がある。
    pub fn from_images(images: &[InMemoryImage], labels: &LabelMap, image_size: usize) -> Result<Self> {
        let items = images
            .iter()
            .map(|image| {
                let label = image.label.as_deref().ok_or_else(|| {
                    ClassifierError::Config(format!("ラベルのない画像です: {}", image.file_name))
                })?;
                let key = labels.key_of(label).ok_or_else(|| {
                    ClassifierError::Config(format!("未知のラベルです: {} ({})", label, image.file_name))
                })?;
                Ok(ImageItem {
                    pixels: decode_and_normalize(image, image_size)?,
                    key,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { items, image_size })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn keys(&self) -> Vec<usize> {
        self.items.iter().map(|item| item.key).collect()
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets_vec.push(item.key as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

/// エポックごとの学習状況
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

/// 学習済みモデルと学習履歴
pub struct FitResult<B: Backend> {
    pub model: ImageClassifier<B>,
    pub history: Vec<EpochSummary>,
    /// 採用したモデルのエポック（検証損失が最小のもの）
    pub best_epoch: usize,
}

/// 学習パイプライン全体の結果
pub struct TrainingOutcome<B: Backend> {
    pub model: ImageClassifier<B>,
    pub labels: LabelMap,
    pub metadata: ModelMetadata,
    pub metrics: MulticlassMetrics,
    pub history: Vec<EpochSummary>,
    pub train_size: usize,
    pub test_size: usize,
    pub fit_duration: Duration,
    pub evaluate_duration: Duration,
}

/// データセット全体のスコアベクトルを計算（推論モード）
pub fn predict_scores<B: Backend>(
    model: &ImageClassifier<B>,
    dataset: &ImageDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<Vec<f32>>> {
    let batcher = ImageBatcher::<B>::new(device.clone(), dataset.image_size());
    let mut scores = Vec::with_capacity(dataset.len());

    for start in (0..dataset.len()).step_by(batch_size.max(1)) {
        let end = (start + batch_size).min(dataset.len());
        let items: Vec<ImageItem> = (start..end).filter_map(|i| dataset.get(i)).collect();
        let batch = batcher.batch(items, device);
        let output = model.scores(batch.images);
        let [_, num_classes] = output.dims();
        let values = output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::TrainingFailure(format!("推論結果の取得エラー: {:?}", e)))?;
        scores.extend(values.chunks(num_classes).map(<[f32]>::to_vec));
    }

    Ok(scores)
}

/// テストデータで評価指標を計算
pub fn evaluate<B: Backend>(
    model: &ImageClassifier<B>,
    dataset: &ImageDataset,
    num_classes: usize,
    batch_size: usize,
    device: &B::Device,
) -> Result<MulticlassMetrics> {
    let scores = predict_scores(model, dataset, batch_size, device)?;
    Ok(MulticlassMetrics::compute(&scores, &dataset.keys(), num_classes))
}

/// 学習済みモデルから特徴抽出器を読み込む
pub fn load_pretrained_backbone<B: Backend>(path: &Path, device: &B::Device) -> Result<FeatureExtractor<B>> {
    let (metadata, binary) = load_model_with_metadata(path)?;
    let model = classifier_from_bytes::<B>(path, &metadata, binary, device)?;
    info!(
        "学習済み特徴抽出器を読み込みました: {} ({} クラスのモデル)",
        path.display(),
        metadata.num_classes()
    );
    Ok(model.into_backbone())
}

/// モデルの重みをバイト列に変換（f32精度）
pub fn classifier_to_bytes<B: Backend>(model: &ImageClassifier<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| ClassifierError::TrainingFailure(format!("モデルのシリアライズに失敗しました: {:?}", e)))
}

/// モデルを学習する
///
/// `Autodiff<B>` 上で Adam + 交差エントロピーで学習し、エポックごとに検証データで
/// 損失と正解率を計算する。検証損失が最小だったエポックのモデルを返す。
pub fn fit<B: Backend>(
    model_settings: &ModelSettings,
    training: &TrainingSettings,
    labels: &LabelMap,
    train_set: &ImageDataset,
    valid_set: &ImageDataset,
    device: &B::Device,
    cancel: &AtomicBool,
) -> Result<FitResult<B>> {
    if train_set.len() == 0 || valid_set.len() == 0 {
        return Err(ClassifierError::EmptyDataset(format!(
            "学習データ {} 枚, 検証データ {} 枚",
            train_set.len(),
            valid_set.len()
        )));
    }

    B::seed(device, training.seed);

    let model_config = ModelConfig::new(labels.len())
        .with_hidden_size(model_settings.hidden_size)
        .with_dropout(model_settings.dropout)
        .with_image_size(model_settings.image_size);
    let mut model: ImageClassifier<Autodiff<B>> = model_config.init(device);

    if let Some(ref pretrained) = training.pretrained_model {
        let backbone = load_pretrained_backbone::<Autodiff<B>>(pretrained, device)?;
        model = model.with_backbone(backbone);
        if training.freeze_backbone {
            info!("特徴抽出器を固定し、分類ヘッドのみ学習します");
            model = model.freeze_backbone();
        }
    }

    let mut optimizer = AdamConfig::new().init::<Autodiff<B>, ImageClassifier<Autodiff<B>>>();
    let batcher = ImageBatcher::<Autodiff<B>>::new(device.clone(), train_set.image_size());
    let mut rng = ChaCha8Rng::seed_from_u64(training.seed);
    let timeout = training.fit_timeout_secs.map(Duration::from_secs);
    let started = Instant::now();

    let mut history = Vec::with_capacity(training.num_epochs);
    let mut best: Option<(f64, usize, ImageClassifier<B>)> = None;
    let mut epochs_without_improvement = 0usize;

    info!(
        target: TRAINER_TARGET,
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}, パラメータ数 {}",
        training.num_epochs,
        training.batch_size,
        training.learning_rate,
        model.num_params()
    );

    for epoch in 1..=training.num_epochs {
        let mut indices: Vec<usize> = (0..train_set.len()).collect();
        indices.shuffle(&mut rng);

        let mut epoch_loss = 0.0f64;
        let mut num_batches = 0usize;
        let mut correct = 0usize;

        for chunk in indices.chunks(training.batch_size) {
            if cancel.load(Ordering::Relaxed) {
                return Err(ClassifierError::Cancelled);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(ClassifierError::TrainingFailure(format!(
                        "タイムアウトしました ({} 秒, エポック {})",
                        limit.as_secs(),
                        epoch
                    )));
                }
            }

            let items: Vec<ImageItem> = chunk.iter().filter_map(|&i| train_set.get(i)).collect();
            let batch = batcher.batch(items, device);
            let targets: Vec<usize> = chunk.iter().filter_map(|&i| train_set.get(i)).map(|it| it.key).collect();

            let (loss, output) = model.forward_loss(batch.images, batch.targets);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(ClassifierError::TrainingFailure(format!(
                    "損失が発散しました (エポック {}): {}",
                    epoch, loss_value
                )));
            }

            let [_, num_classes] = output.dims();
            let logits = output
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| ClassifierError::TrainingFailure(format!("出力の取得エラー: {:?}", e)))?;
            correct += logits
                .chunks(num_classes)
                .zip(&targets)
                .filter(|(row, &truth)| argmax(row) == Some(truth))
                .count();

            // 逆伝播とパラメータ更新
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(training.learning_rate, model, grads);

            epoch_loss += loss_value;
            num_batches += 1;
        }

        let valid_model = model.valid();
        let valid_metrics = evaluate(&valid_model, valid_set, labels.len(), training.batch_size, device)?;

        let summary = EpochSummary {
            epoch,
            train_loss: epoch_loss / num_batches.max(1) as f64,
            train_accuracy: correct as f64 / train_set.len() as f64,
            valid_loss: valid_metrics.log_loss,
            valid_accuracy: valid_metrics.micro_accuracy,
        };
        info!(
            target: TRAINER_TARGET,
            "[エポック {:>3}/{}] 学習損失 {:.4}, 学習正解率 {:.2}%, 検証損失 {:.4}, 検証正解率 {:.2}%",
            epoch,
            training.num_epochs,
            summary.train_loss,
            summary.train_accuracy * 100.0,
            summary.valid_loss,
            summary.valid_accuracy * 100.0
        );

        let improved = best
            .as_ref()
            .map_or(true, |(best_loss, _, _)| summary.valid_loss < *best_loss);
        if improved {
            best = Some((summary.valid_loss, epoch, valid_model));
            epochs_without_improvement = 0;
        } else {
            epochs_without_improvement += 1;
        }
        history.push(summary);

        if let Some(patience) = training.early_stopping_patience {
            if epochs_without_improvement >= patience {
                info!(
                    target: TRAINER_TARGET,
                    "検証損失が {} エポック改善しなかったため早期終了します",
                    patience
                );
                break;
            }
        }
    }

    let (best_loss, best_epoch, best_model) = best.ok_or_else(|| {
        ClassifierError::TrainingFailure("1エポックも学習できませんでした".to_string())
    })?;
    info!(
        target: TRAINER_TARGET,
        "エポック {} のモデルを採用します (検証損失 {:.4})",
        best_epoch,
        best_loss
    );

    Ok(FitResult {
        model: best_model,
        history,
        best_epoch,
    })
}

/// ラベル付き画像から学習・評価までを実行する
///
/// 1. ラベル -> キーの対応を値の昇順で作成
/// 2. 固定シードで学習/テストに分割
/// 3. 学習（テストデータを検証に使用）
/// 4. テストデータで評価
pub fn train_classifier<B: Backend>(
    config: &AppConfig,
    images: Vec<InMemoryImage>,
    device: &B::Device,
    cancel: &AtomicBool,
) -> Result<TrainingOutcome<B>> {
    config.validate()?;
    if images.is_empty() {
        return Err(ClassifierError::EmptyDataset("学習用画像がありません".to_string()));
    }

    let labels = LabelMap::from_labels(images.iter().filter_map(|image| image.label.as_deref()));
    if labels.len() < 2 {
        return Err(ClassifierError::TrainingFailure(format!(
            "2クラス以上が必要です (検出: {})",
            labels.labels().join(", ")
        )));
    }
    info!("クラス ({}個): {}", labels.len(), labels.labels().join(", "));

    let split = train_test_split(images, config.training.test_fraction, config.training.seed);
    info!("学習データ: {} 枚, テストデータ: {} 枚", split.train.len(), split.test.len());
    if split.test.is_empty() {
        warn!("テストデータが0枚です。画像を増やすか test_fraction を大きくしてください");
    }

    let image_size = config.model.image_size;
    let train_set = ImageDataset::from_images(&split.train, &labels, image_size)?;
    let test_set = ImageDataset::from_images(&split.test, &labels, image_size)?;

    let fit_started = Instant::now();
    let fitted = fit::<B>(
        &config.model,
        &config.training,
        &labels,
        &train_set,
        &test_set,
        device,
        cancel,
    )?;
    let fit_duration = fit_started.elapsed();

    let evaluate_started = Instant::now();
    let metrics = evaluate(
        &fitted.model,
        &test_set,
        labels.len(),
        config.training.batch_size,
        device,
    )?;
    let evaluate_duration = evaluate_started.elapsed();

    let metadata = ModelMetadata::new(
        labels.labels().to_vec(),
        image_size as u32,
        config.model.hidden_size as u32,
        config.model.dropout,
        fitted.history.len() as u32,
        fitted.best_epoch as u32,
        config.training.seed,
    );

    Ok(TrainingOutcome {
        model: fitted.model,
        labels,
        metadata,
        metrics,
        history: fitted.history,
        train_size: train_set.len(),
        test_size: test_set.len(),
        fit_duration,
        evaluate_duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::save_model_with_metadata;
    use crate::test_utils::{backend_lock, toy_config, toy_images, TestBackend};

    #[test]
    fn dataset_rejects_unlabeled_and_unknown_images() {
        let labels = LabelMap::from_labels(["blue", "red"]);
        let mut images = toy_images(1);
        images[0].label = None;
        assert!(matches!(
            ImageDataset::from_images(&images, &labels, 8),
            Err(ClassifierError::Config(_))
        ));

        let mut images = toy_images(1);
        images[0].label = Some("green".into());
        assert!(ImageDataset::from_images(&images, &labels, 8).is_err());
    }

    #[test]
    fn batcher_stacks_items() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let labels = LabelMap::from_labels(["blue", "red"]);
        let dataset = ImageDataset::from_images(&toy_images(2), &labels, 8).unwrap();
        let batcher = ImageBatcher::<TestBackend>::new(device.clone(), 8);
        let items: Vec<_> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();
        let batch = batcher.batch(items, &device);
        assert_eq!(batch.images.dims(), [4, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [4]);
    }

    #[test]
    fn training_is_deterministic_for_a_seed() {
        let _guard = backend_lock();
        let device = Default::default();
        let config = toy_config();
        let cancel = AtomicBool::new(false);

        let first = train_classifier::<TestBackend>(&config, toy_images(10), &device, &cancel).unwrap();
        let second = train_classifier::<TestBackend>(&config, toy_images(10), &device, &cancel).unwrap();

        assert_eq!(first.train_size, 16);
        assert_eq!(first.test_size, 4);
        assert_eq!(first.labels.labels(), &["blue", "red"]);
        assert_eq!(first.metadata.labels, first.labels.labels());
        assert_eq!(first.metrics.micro_accuracy, second.metrics.micro_accuracy);
        assert!((first.metrics.log_loss - second.metrics.log_loss).abs() < 1e-6);
        assert_eq!(first.history.len(), second.history.len());
        assert_eq!(first.metrics.num_samples, 4);

        let best = first
            .history
            .iter()
            .min_by(|a, b| a.valid_loss.total_cmp(&b.valid_loss))
            .unwrap();
        assert_eq!(first.metadata.best_epoch as usize, best.epoch);
        assert_eq!(first.metadata.num_epochs as usize, first.history.len());
    }

    #[test]
    fn frozen_pretrained_backbone_is_not_updated() {
        let _guard = backend_lock();
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let cancel = AtomicBool::new(false);

        let base = train_classifier::<TestBackend>(&toy_config(), toy_images(10), &device, &cancel).unwrap();
        let artifact = save_model_with_metadata(
            &dir.path().join("base.tar.gz"),
            &base.metadata,
            &classifier_to_bytes(&base.model).unwrap(),
        )
        .unwrap();

        let mut config = toy_config();
        config.training.pretrained_model = Some(artifact.clone());
        config.training.freeze_backbone = true;
        let tuned = train_classifier::<TestBackend>(&config, toy_images(10), &device, &cancel).unwrap();

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let before = Recorder::<TestBackend>::record(
            &recorder,
            load_pretrained_backbone::<TestBackend>(&artifact, &device).unwrap().into_record(),
            (),
        )
        .unwrap();
        let after = Recorder::<TestBackend>::record(&recorder, tuned.model.into_backbone().into_record(), ()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn timeout_and_cancellation_abort_fit() {
        let _guard = backend_lock();
        let device = Default::default();

        let mut config = toy_config();
        config.training.fit_timeout_secs = Some(0);
        let err = train_classifier::<TestBackend>(&config, toy_images(5), &device, &AtomicBool::new(false))
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::TrainingFailure(_)));

        let err = train_classifier::<TestBackend>(&toy_config(), toy_images(5), &device, &AtomicBool::new(true))
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::Cancelled));
    }

    #[test]
    fn invalid_config_is_rejected_before_fitting() {
        let device = Default::default();
        let mut config = toy_config();
        config.model.hidden_size = 0;
        let err = train_classifier::<TestBackend>(&config, toy_images(5), &device, &AtomicBool::new(false))
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::Config(_)));
    }

    #[test]
    fn single_class_is_rejected() {
        let device = Default::default();
        let images: Vec<_> = toy_images(5)
            .into_iter()
            .filter(|image| image.label.as_deref() == Some("red"))
            .collect();
        let err = train_classifier::<TestBackend>(&toy_config(), images, &device, &AtomicBool::new(false))
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::TrainingFailure(_)));
    }
}
