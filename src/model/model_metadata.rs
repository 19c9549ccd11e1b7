//! モデルメタデータの定義
//!
//! tar.gz形式のモデルファイルに `metadata.json` として保存されます。
//! ラベルの並び（キー順）はここにしか記録されないため、推論側は必ずこの値を使います。

use serde::{Deserialize, Serialize};

/// 現在のモデルファイル形式のバージョン
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// モデルファイル形式のバージョン
    pub format_version: u32,

    /// クラスラベル（キー順 = スコアベクトルの並び）
    /// 例: ["daisy", "dandelion", "roses", "sunflowers", "tulips"]
    pub labels: Vec<String>,

    /// モデル入力サイズ（正方形）
    pub image_size: u32,

    /// 分類ヘッドの中間層の次元
    pub hidden_size: u32,

    /// 学習時のドロップアウト率
    pub dropout: f64,

    /// 実際に学習したエポック数（早期終了を含む）
    pub num_epochs: u32,

    /// 保存した重みのエポック（検証損失が最小のもの）
    pub best_epoch: u32,

    /// 学習に使用したシード
    pub seed: u64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        labels: Vec<String>,
        image_size: u32,
        hidden_size: u32,
        dropout: f64,
        num_epochs: u32,
        best_epoch: u32,
        seed: u64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            format_version: MODEL_FORMAT_VERSION,
            labels,
            image_size,
            hidden_size,
            dropout,
            num_epochs,
            best_epoch,
            seed,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
