pub mod augment;
pub mod example_catalog;
pub mod generator;
pub mod label_codec;

pub use augment::{Augmentation, ImageBatch, DEFAULT_INPUT_SIZE};
pub use example_catalog::{Example, ExampleCatalog, DEFAULT_SUFFIXES};
pub use generator::{Batch, BatchGenerator, DatasetSplitter, GeneratorOptions, SplitOptions};
pub use label_codec::{LabelCodec, DEFAULT_MAX_LABELS};
