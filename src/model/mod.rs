pub mod config;
pub mod layout;
pub mod model_metadata;
pub mod model_storage;
pub mod version_store;

pub use config::{DeviceType, ModelSettings, TrainingSettings, VisionConfig};
pub use layout::{ModelLayout, LABELS_FILE};
pub use model_metadata::SnapshotMetadata;
pub use model_storage::{
    load_metadata, load_model_with_metadata, log_metadata_info, save_model_with_metadata,
};
pub use version_store::{
    find_latest_snapshot, scan_snapshots, ModelVersionStore, SnapshotEntry, DEFAULT_PREFIX,
    SNAPSHOT_EXTENSION,
};
