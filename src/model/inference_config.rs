//! モデルメタデータを使用した推論設定
//!
//! モデルメタデータから推論に必要な情報（ラベル順・入力サイズ）を取り出します。

use crate::dataset::LabelMap;
use crate::model::model_metadata::ModelMetadata;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// キー順のクラスラベル（キー -> 値の辞書）
    pub labels: LabelMap,

    /// モデル入力解像度
    pub image_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            labels: LabelMap::from_ordered(metadata.labels.clone()),
            image_size: metadata.image_size as usize,
        }
    }

    pub fn num_total_classes(&self) -> usize {
        self.labels.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.labels.label_of(index)
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        println!("\n=== 推論設定 ===");
        println!("クラスラベル: {}", self.labels.labels().join(", "));
        println!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
        println!("総クラス数: {}", self.num_total_classes());
        println!("==================");
    }
}
