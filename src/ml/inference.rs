//! モデル推論機能

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use serde::Serialize;
use tracing::debug;

use crate::dataset::InMemoryImage;
use crate::error::{ClassifierError, Result};
use crate::ml::{decode_and_normalize, ImageClassifier, ModelConfig};
use crate::model::{load_model_with_metadata, InferenceConfig, ModelMetadata};

/// 1枚の画像に対する予測結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// 予測ラベル（モデル内のキー -> 値の対応で変換済み）
    pub predicted_label: String,
    /// キー順のクラスごとの確率
    pub scores: Vec<f32>,
}

impl Prediction {
    /// 予測ラベルの確率
    pub fn top_probability(&self) -> f32 {
        self.scores.iter().copied().fold(0.0, f32::max)
    }
}

/// メタデータとバイナリから分類モデルを復元
pub(crate) fn classifier_from_bytes<B: Backend>(
    path: &Path,
    metadata: &ModelMetadata,
    binary: Vec<u8>,
    device: &B::Device,
) -> Result<ImageClassifier<B>> {
    let image_size = metadata.image_size as usize;
    let model = ModelConfig::new(metadata.num_classes())
        .with_hidden_size(metadata.hidden_size as usize)
        .with_dropout(metadata.dropout)
        .with_image_size(image_size)
        .init::<B>(device);

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = Recorder::<B>::load(&recorder, binary, device)
        .map_err(|e| ClassifierError::model_load(path, format!("モデル重みの読み込みエラー: {:?}", e)))?;
    let model = model.load_record(record);

    // 出力次元がラベル数と一致するか確認
    let probe = Tensor::<B, 4>::zeros([1, 3, image_size, image_size], device);
    let [_, num_outputs] = model.forward(probe).dims();
    if num_outputs != metadata.num_classes() {
        return Err(ClassifierError::model_load(
            path,
            format!(
                "モデルの出力数 {} がラベル数 {} と一致しません",
                num_outputs,
                metadata.num_classes()
            ),
        ));
    }

    Ok(model)
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: ImageClassifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let path = model_path.as_ref();
        let (metadata, binary) = load_model_with_metadata(path)?;
        let model = classifier_from_bytes::<B>(path, &metadata, binary, device)?;
        debug!("推論エンジンを初期化しました: {}", path.display());

        Ok(Self {
            model,
            config: InferenceConfig::from_metadata(&metadata),
            device: device.clone(),
        })
    }

    /// 学習直後のモデルから推論エンジンを作成
    pub fn from_trained(model: ImageClassifier<B>, metadata: &ModelMetadata, device: &B::Device) -> Self {
        Self {
            model,
            config: InferenceConfig::from_metadata(metadata),
            device: device.clone(),
        }
    }

    /// 単一画像を分類
    pub fn predict(&self, image: &InMemoryImage) -> Result<Prediction> {
        let mut predictions = self.run(std::slice::from_ref(image))?;
        predictions
            .pop()
            .ok_or_else(|| ClassifierError::TrainingFailure("推論結果が空です".to_string()))
    }

    /// 複数画像をバッチ分類（入力と同じ順序）
    ///
    /// `cancel` が立つとそれ以降のバッチは処理せず `Cancelled` を返す。
    pub fn predict_batch(&self, images: &[InMemoryImage], cancel: &AtomicBool) -> Result<Vec<Prediction>> {
        const CHUNK: usize = 16;

        let mut results = Vec::with_capacity(images.len());
        for chunk in images.chunks(CHUNK) {
            if cancel.load(Ordering::Relaxed) {
                return Err(ClassifierError::Cancelled);
            }
            results.extend(self.run(chunk)?);
        }
        Ok(results)
    }

    fn run(&self, images: &[InMemoryImage]) -> Result<Vec<Prediction>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.config.image_size;
        let mut pixels = Vec::with_capacity(images.len() * 3 * size * size);
        for image in images {
            pixels.extend(decode_and_normalize(image, size)?);
        }

        let tensor = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([images.len(), 3, size, size]);
        let probabilities = self.model.scores(tensor);
        // デバイス上でargmaxを取り、キーだけを取り出す
        let keys = probabilities
            .clone()
            .argmax(1)
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| ClassifierError::TrainingFailure(format!("推論結果の取得エラー: {:?}", e)))?;
        let scores = probabilities
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::TrainingFailure(format!("推論結果の取得エラー: {:?}", e)))?;

        let num_classes = self.config.num_total_classes();
        scores
            .chunks(num_classes)
            .zip(keys)
            .map(|(row, key)| {
                let label = usize::try_from(key)
                    .ok()
                    .and_then(|key| self.config.class_index_to_label(key))
                    .ok_or_else(|| {
                        ClassifierError::TrainingFailure(format!("クラスインデックス {} は範囲外です", key))
                    })?;
                Ok(Prediction {
                    predicted_label: label.to_string(),
                    scores: row.to_vec(),
                })
            })
            .collect()
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// 予測結果を表示
    pub fn print_prediction(image: &InMemoryImage, prediction: &Prediction) {
        println!(
            "画像ファイル: [{}], スコア: [{}], 予測ラベル: {}, 確率: {:.4}",
            image.file_name,
            prediction
                .scores
                .iter()
                .map(|s| format!("{:.4}", s))
                .collect::<Vec<_>>()
                .join(", "),
            prediction.predicted_label,
            prediction.top_probability()
        );
    }
}
