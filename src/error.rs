//! ライブラリ共通のエラー型

use std::path::PathBuf;

use thiserror::Error;

/// 画像分類ライブラリのエラー
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// 入力ディレクトリが存在しない
    #[error("ディレクトリが見つかりません: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// 画像以外のファイル（`skip_non_images = false` の場合のみ）
    #[error("サポートされていないファイル形式です: {}", .0.display())]
    UnsupportedFile(PathBuf),

    /// 学習・推論対象の画像が1枚もない
    #[error("画像が見つかりません: {0}")]
    EmptyDataset(String),

    /// 画像のデコード失敗
    #[error("画像のデコードに失敗しました ({name}): {source}")]
    ImageDecode {
        name: String,
        #[source]
        source: image::ImageError,
    },

    /// モデルアーティファクトの読み込み失敗（存在しない・破損・構造不一致）
    #[error("モデルの読み込みに失敗しました ({}): {reason}", .path.display())]
    ModelLoad { path: PathBuf, reason: String },

    /// 学習処理の失敗（タイムアウトを含む）
    #[error("学習に失敗しました: {0}")]
    TrainingFailure(String),

    /// キャンセルフラグによる中断
    #[error("処理がキャンセルされました")]
    Cancelled,

    /// 設定値の不正
    #[error("設定エラー: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClassifierError {
    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, ClassifierError>;
