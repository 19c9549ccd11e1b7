//! ディレクトリからの画像一覧の読み込み
//!
//! ディレクトリ構成:
//! ```text
//! root/
//! ├── daisy/
//! │   ├── 100080576.jpg
//! │   └── ...
//! └── tulips/
//!     └── ...
//! ```
//! `LabelSource::ParentDirectory` の場合、各画像の直上のディレクトリ名がラベルになります。

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{ClassifierError, Result};
use crate::model::LoaderSettings;

/// 画像ファイルのパスとラベル
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_path: PathBuf,
    /// ラベル（ラベルなしの場合は空文字列）
    pub label: String,
}

/// メモリ上に読み込んだ画像（デコード前のファイル内容）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub label: Option<String>,
}

impl InMemoryImage {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>, label: Option<String>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
            label,
        }
    }

    /// レコードのファイル内容を読み込む
    pub fn from_record(record: &ImageRecord) -> Result<Self> {
        let bytes = std::fs::read(&record.image_path)?;
        let file_name = record
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let label = (!record.label.is_empty()).then(|| record.label.clone());
        Ok(Self::new(file_name, bytes, label))
    }
}

/// ラベルの決め方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSource {
    /// 直上のディレクトリ名
    ParentDirectory,
    /// ファイル名先頭の英字部分（`rose12.jpg` -> `rose`）
    FileNamePrefix,
    /// ラベルなし
    None,
}

impl LabelSource {
    pub fn label_for(&self, path: &Path) -> String {
        match self {
            LabelSource::ParentDirectory => path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            LabelSource::FileNamePrefix => path
                .file_name()
                .map(|n| {
                    n.to_string_lossy()
                        .chars()
                        .take_while(|c| c.is_alphabetic())
                        .collect()
                })
                .unwrap_or_default(),
            LabelSource::None => String::new(),
        }
    }
}

/// 並び替え方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuffleMode {
    None,
    /// 固定シードでシャッフル（再現可能）
    Seeded(u64),
    Random,
}

/// 並び替え（要素の多重集合は変わらない）
pub fn shuffle_records<T>(items: &mut [T], mode: ShuffleMode) {
    match mode {
        ShuffleMode::None => {}
        ShuffleMode::Seeded(seed) => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            items.shuffle(&mut rng);
        }
        ShuffleMode::Random => items.shuffle(&mut rand::thread_rng()),
    }
}

fn is_image_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// ディレクトリを再帰的に走査して (画像パス, ラベル) の一覧を作成
///
/// シャッフル前の順序はパス順で固定。
pub fn load_images_from_directory(root: &Path, settings: &LoaderSettings) -> Result<Vec<ImageRecord>> {
    if !root.is_dir() {
        return Err(ClassifierError::DirectoryNotFound(root.to_path_buf()));
    }

    let mut records = Vec::new();
    let mut skipped = 0usize;

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !is_image_file(path, &settings.extensions) {
            if settings.skip_non_images {
                debug!("画像以外のファイルをスキップ: {}", path.display());
                skipped += 1;
                continue;
            }
            return Err(ClassifierError::UnsupportedFile(path.to_path_buf()));
        }

        records.push(ImageRecord {
            image_path: path.to_path_buf(),
            label: settings.label_source.label_for(path),
        });
    }

    info!(
        "{} 枚の画像を検出しました ({}, スキップ {} 件)",
        records.len(),
        root.display(),
        skipped
    );

    shuffle_records(&mut records, settings.shuffle);
    Ok(records)
}

/// ディレクトリ内の画像をファイル内容ごと読み込む
pub fn load_in_memory_images_from_directory(
    root: &Path,
    settings: &LoaderSettings,
) -> Result<Vec<InMemoryImage>> {
    load_images_from_directory(root, settings)?
        .iter()
        .map(InMemoryImage::from_record)
        .collect()
}
