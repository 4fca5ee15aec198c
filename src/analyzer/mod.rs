pub mod detector;

pub use detector::{
    detect_objects, detect_objects_in_file, extract_tile, plan_tiles, BoundingBox, Detection,
    DetectorConfig, TileGrid,
};
