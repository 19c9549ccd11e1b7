pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::{ModelMetadata, MODEL_FORMAT_VERSION};
pub use model_storage::{save_model_with_metadata, publish_model, load_metadata, load_model_with_metadata, print_metadata_info};
pub use inference_config::InferenceConfig;
pub use config::{AppConfig, AssetSettings, DeviceType, LoaderSettings, ModelSettings, TrainingSettings};
