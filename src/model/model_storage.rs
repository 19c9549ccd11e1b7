//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル順、入力サイズなど）
//! - model.bin       - モデルの重み（バイナリ）

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{ClassifierError, Result};
use crate::model::model_metadata::{ModelMetadata, MODEL_FORMAT_VERSION};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// `output_path` が `.gz` で終わらない場合は `.tar.gz` を付ける。
/// 実際に書き込んだパスを返す。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tar_gz_file = File::create(&tar_gz_path)?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string().map_err(std::io::Error::other)?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // tarアーカイブとgzipストリームを完成させる
    tar_builder.into_inner()?.finish()?;

    Ok(tar_gz_path)
}

/// 学習済みモデルを推論側のパスへコピー
pub fn publish_model(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, destination)?;
    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .map_err(|e| ClassifierError::model_load(tar_gz_path, e))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

fn parse_metadata(tar_gz_path: &Path, json: &str) -> Result<ModelMetadata> {
    let metadata = ModelMetadata::from_json_string(json)
        .map_err(|e| ClassifierError::model_load(tar_gz_path, format!("{METADATA_ENTRY}: {e}")))?;

    if metadata.format_version != MODEL_FORMAT_VERSION {
        return Err(ClassifierError::model_load(
            tar_gz_path,
            format!(
                "未対応のモデル形式バージョンです: {} (対応: {})",
                metadata.format_version, MODEL_FORMAT_VERSION
            ),
        ));
    }
    if metadata.labels.is_empty() {
        return Err(ClassifierError::model_load(tar_gz_path, "ラベルが空です"));
    }
    if metadata.hidden_size == 0 || (metadata.image_size as usize) < crate::ml::MIN_IMAGE_SIZE {
        return Err(ClassifierError::model_load(
            tar_gz_path,
            format!(
                "モデルの構成が不正です (image_size {}, hidden_size {})",
                metadata.image_size, metadata.hidden_size
            ),
        ));
    }
    Ok(metadata)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let (metadata, _) = read_entries(tar_gz_path, false)?;
    metadata.ok_or_else(|| {
        ClassifierError::model_load(tar_gz_path, "metadata.json not found in tar.gz archive")
    })
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    match read_entries(tar_gz_path, true)? {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(ClassifierError::model_load(
            tar_gz_path,
            "metadata.json not found in tar.gz archive",
        )),
        (_, None) => Err(ClassifierError::model_load(
            tar_gz_path,
            "model.bin not found in tar.gz archive",
        )),
    }
}

fn read_entries(
    tar_gz_path: &Path,
    with_binary: bool,
) -> Result<(Option<ModelMetadata>, Option<Vec<u8>>)> {
    let mut archive = open_archive(tar_gz_path)?;
    let corrupt = |e: std::io::Error| ClassifierError::model_load(tar_gz_path, e);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.to_string_lossy().into_owned();

        match path.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str).map_err(corrupt)?;
                metadata_opt = Some(parse_metadata(tar_gz_path, &json_str)?);
                if !with_binary {
                    break;
                }
            }
            MODEL_ENTRY if with_binary => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer).map_err(corrupt)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    Ok((metadata_opt, model_binary_opt))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラスラベル ({}個): {}", metadata.labels.len(), metadata.labels.join(", "));
    println!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    println!("分類ヘッド中間次元: {}", metadata.hidden_size);
    println!("学習エポック数: {} (採用: エポック {})", metadata.num_epochs, metadata.best_epoch);
    println!("シード: {}", metadata.seed);
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata::new(vec!["cats".into(), "dogs".into()], 32, 16, 0.5, 4, 3, 1)
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = sample_metadata();
        let binary: Vec<u8> = (0..=255).collect();

        let written = save_model_with_metadata(&dir.path().join("out/model"), &metadata, &binary).unwrap();
        assert_eq!(written, dir.path().join("out/model.tar.gz"));

        let (loaded_meta, loaded_bin) = load_model_with_metadata(&written).unwrap();
        assert_eq!(loaded_meta, metadata);
        assert_eq!(loaded_bin, binary);
        assert_eq!(load_metadata(&written).unwrap(), metadata);
    }

    #[test]
    fn keeps_explicit_tar_gz_name_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs/image_classifier.tar.gz");
        let written = save_model_with_metadata(&path, &sample_metadata(), b"weights").unwrap();
        assert_eq!(written, path);

        let published = dir.path().join("inputs/MLNETModel/image_classifier.tar.gz");
        publish_model(&written, &published).unwrap();
        assert_eq!(std::fs::read(&written).unwrap(), std::fs::read(&published).unwrap());
    }

    #[test]
    fn missing_file_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model_with_metadata(&dir.path().join("missing.tar.gz")).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelLoad { .. }));
    }

    #[test]
    fn corrupt_file_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar.gz");
        std::fs::write(&path, b"this is not a gzip stream").unwrap();
        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelLoad { .. }));
    }

    #[test]
    fn degenerate_layout_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = sample_metadata();
        metadata.hidden_size = 0;
        let path = save_model_with_metadata(&dir.path().join("zero.tar.gz"), &metadata, b"weights").unwrap();
        let err = load_metadata(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelLoad { .. }));
    }

    #[test]
    fn archive_without_weights_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.tar.gz");
        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let json = sample_metadata().to_json_string().unwrap();
        append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(load_metadata(&path).is_ok());
        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(err.to_string().contains("model.bin"));
    }
}
