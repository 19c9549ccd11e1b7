pub mod loader;
pub mod split;

pub use loader::{
    load_images_from_directory, load_in_memory_images_from_directory, shuffle_records,
    ImageRecord, InMemoryImage, LabelSource, ShuffleMode,
};
pub use split::{train_test_split, LabelMap, TrainTestSplit};
