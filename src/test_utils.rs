//! テスト用ヘルパー

use std::io::Cursor;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use image::{ImageFormat, Rgb, RgbImage};

use crate::dataset::InMemoryImage;
use crate::model::AppConfig;

pub type TestBackend = burn::backend::NdArray;

static BACKEND_LOCK: Mutex<()> = Mutex::new(());

/// 学習を伴うテストを直列化する（バックエンドのシードはプロセス共通）
pub fn backend_lock() -> MutexGuard<'static, ()> {
    BACKEND_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 単色PNGのバイト列
pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// 単色PNGを書き出す（親ディレクトリも作成）
pub fn write_png(path: &Path, color: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, png_bytes(12, 12, color)).unwrap();
}

/// "red" と "blue" の2クラスをそれぞれ `per_class` 枚
pub fn toy_images(per_class: usize) -> Vec<InMemoryImage> {
    let mut images = Vec::with_capacity(per_class * 2);
    for i in 0..per_class {
        let shade = (i * 7 % 40) as u8;
        images.push(InMemoryImage::new(
            format!("red{i}.png"),
            png_bytes(12, 12, [215 + shade, 20 + shade, 30]),
            Some("red".into()),
        ));
        images.push(InMemoryImage::new(
            format!("blue{i}.png"),
            png_bytes(12, 12, [25, 30 + shade, 215 + shade]),
            Some("blue".into()),
        ));
    }
    images
}

/// 小さなモデルで数エポックだけ学習する設定
pub fn toy_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.model.image_size = 16;
    config.model.hidden_size = 16;
    config.model.dropout = 0.1;
    config.training.num_epochs = 3;
    config.training.batch_size = 4;
    config.training.learning_rate = 1e-2;
    config.training.early_stopping_patience = None;
    config
}

/// スコアベクトルの最大要素の位置をキー -> 値の辞書（保存済みラベル順）で引く
pub fn label_by_argmax<'a>(scores: &[f32], labels: &'a [String]) -> Option<&'a str> {
    scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .and_then(|(key, _)| labels.get(key))
        .map(String::as_str)
}
