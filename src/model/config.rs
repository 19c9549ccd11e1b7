//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、アセットの配置、学習パラメータなどをJSON形式で保存・読み込みします。
//! 学習・推論の各パイプラインにはこの設定を明示的に渡します。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::{LabelSource, ShuffleMode};
use crate::error::{ClassifierError, Result};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// アセットの配置（`root` からの相対パス）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    /// アセットのルートディレクトリ
    pub root: PathBuf,
    /// 学習用画像 (`<label>/<file>`)
    pub training_images: PathBuf,
    /// 推論用画像
    pub prediction_images: PathBuf,
    /// 学習直後の動作確認用画像
    pub test_images: PathBuf,
    /// 学習済みモデルの出力先
    pub output_model: PathBuf,
    /// 推論プログラムが読み込むモデル
    pub published_model: PathBuf,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("assets"),
            training_images: PathBuf::from("inputs/images"),
            prediction_images: PathBuf::from("inputs/images-for-predictions"),
            test_images: PathBuf::from("inputs/test-images"),
            output_model: PathBuf::from("outputs/image_classifier.tar.gz"),
            published_model: PathBuf::from("inputs/MLNETModel/image_classifier.tar.gz"),
        }
    }
}

impl AssetSettings {
    /// `root` と結合した絶対（またはカレント相対）パスを返す
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    pub fn training_images_dir(&self) -> PathBuf {
        self.resolve(&self.training_images)
    }

    pub fn prediction_images_dir(&self) -> PathBuf {
        self.resolve(&self.prediction_images)
    }

    pub fn test_images_dir(&self) -> PathBuf {
        self.resolve(&self.test_images)
    }

    pub fn output_model_path(&self) -> PathBuf {
        self.resolve(&self.output_model)
    }

    pub fn published_model_path(&self) -> PathBuf {
        self.resolve(&self.published_model)
    }
}

/// ディレクトリ走査の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// ラベルの決め方（学習時は親ディレクトリ名）
    pub label_source: LabelSource,
    /// 読み込み後の並び替え
    pub shuffle: ShuffleMode,
    /// 画像として扱う拡張子（小文字）
    pub extensions: Vec<String>,
    /// 画像以外のファイルを黙ってスキップするか
    pub skip_non_images: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            label_source: LabelSource::ParentDirectory,
            shuffle: ShuffleMode::Seeded(1),
            extensions: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
            skip_non_images: true,
        }
    }
}

impl LoaderSettings {
    /// 推論用: ラベルなし・並び替えなし
    pub fn unlabeled(&self) -> Self {
        Self {
            label_source: LabelSource::None,
            shuffle: ShuffleMode::None,
            ..self.clone()
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// モデル入力サイズ（正方形）
    pub image_size: usize,
    /// 分類ヘッドの中間層の次元
    pub hidden_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            image_size: 64,
            hidden_size: 64,
            dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード（分割・初期化・シャッフルすべてに使用）
    pub seed: u64,
    /// テストデータの割合
    pub test_fraction: f64,
    /// 検証損失が改善しないまま許容するエポック数（Noneで無効）
    pub early_stopping_patience: Option<usize>,
    /// 学習全体のタイムアウト（秒）
    pub fit_timeout_secs: Option<u64>,
    /// 特徴抽出器の初期値として使う学習済みモデル（.tar.gz）
    pub pretrained_model: Option<PathBuf>,
    /// 学習済み特徴抽出器を固定して分類ヘッドのみ学習するか
    pub freeze_backbone: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 10,
            learning_rate: 1e-3,
            seed: 1,
            test_fraction: 0.2,
            early_stopping_patience: Some(5),
            fit_timeout_secs: None,
            pretrained_model: None,
            freeze_backbone: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// アセット配置
    pub assets: AssetSettings,
    /// ディレクトリ走査設定
    pub loader: LoaderSettings,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("image_classifier.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| ClassifierError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// ファイルが存在するのに壊れている場合はエラーにする。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            tracing::info!("設定ファイルを読み込みました: {}", path.display());
            Ok(config)
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ClassifierError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の範囲チェック
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if !(t.test_fraction > 0.0 && t.test_fraction < 1.0) {
            return Err(ClassifierError::Config(format!(
                "test_fraction は 0 と 1 の間である必要があります: {}",
                t.test_fraction
            )));
        }
        if t.batch_size == 0 || t.num_epochs == 0 {
            return Err(ClassifierError::Config(
                "batch_size と num_epochs は1以上である必要があります".to_string(),
            ));
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(ClassifierError::Config(format!(
                "learning_rate は正の有限値である必要があります: {}",
                t.learning_rate
            )));
        }
        if self.model.hidden_size == 0 {
            return Err(ClassifierError::Config(
                "hidden_size は1以上である必要があります".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(ClassifierError::Config(format!(
                "dropout は [0, 1) の範囲である必要があります: {}",
                self.model.dropout
            )));
        }
        if self.model.image_size < crate::ml::MIN_IMAGE_SIZE {
            return Err(ClassifierError::Config(format!(
                "image_size が小さすぎます: {} (最小{})",
                self.model.image_size,
                crate::ml::MIN_IMAGE_SIZE
            )));
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("アセット: {}", self.assets.root.display());
        println!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("テスト割合: {}", self.training.test_fraction);
        if let Some(ref pretrained) = self.training.pretrained_model {
            println!("学習済み特徴抽出器: {}", pretrained.display());
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.seed, 1);
        assert_eq!(config.training.test_fraction, 0.2);
        assert_eq!(config.loader.label_source, LabelSource::ParentDirectory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.image_size, deserialized.model.image_size);
        assert_eq!(config.loader.shuffle, deserialized.loader.shuffle);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "device_type": "Cpu",
            "training": { "num_epochs": 3, "seed": 7 },
            "model": { "image_size": 32 },
            "loader": { "skip_non_images": false } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.seed, 7);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.batch_size, defaults.training.batch_size);
        assert_eq!(config.training.test_fraction, 0.2);
        assert!(config.training.freeze_backbone);
        assert_eq!(
            config.training.early_stopping_patience,
            defaults.training.early_stopping_patience
        );
        assert_eq!(config.model.image_size, 32);
        assert_eq!(config.model.hidden_size, defaults.model.hidden_size);
        assert!(!config.loader.skip_non_images);
        assert_eq!(config.loader.extensions, defaults.loader.extensions);
        assert_eq!(config.assets.root, defaults.assets.root);

        let empty: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.device_type, DeviceType::Wgpu);
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn test_asset_paths_are_resolved_from_root() {
        let mut assets = AssetSettings::default();
        assets.root = PathBuf::from("/data/assets");
        assert_eq!(
            assets.published_model_path(),
            PathBuf::from("/data/assets/inputs/MLNETModel/image_classifier.tar.gz")
        );
        assert_eq!(
            assets.training_images_dir(),
            PathBuf::from("/data/assets/inputs/images")
        );
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = AppConfig::default();
        config.training.test_fraction = 1.0;
        assert!(matches!(config.validate(), Err(ClassifierError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_hidden_size() {
        let mut config = AppConfig::default();
        config.model.hidden_size = 0;
        assert!(matches!(config.validate(), Err(ClassifierError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_learning_rate() {
        for rate in [0.0, -0.01, f64::NAN, f64::INFINITY] {
            let mut config = AppConfig::default();
            config.training.learning_rate = rate;
            assert!(
                matches!(config.validate(), Err(ClassifierError::Config(_))),
                "learning_rate = {rate}"
            );
        }
    }

    #[test]
    fn test_load_or_default_rejects_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(AppConfig::load_or_default(&path).is_err());

        let missing = dir.path().join("missing.json");
        assert!(AppConfig::load_or_default(&missing).is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.training.num_epochs = 3;
        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 3);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
