//! スライディングウィンドウによる物体検出
//!
//! 画像全体を窓サイズの倍数にリサイズして格子状のタイルに切り分け、
//! タイルごとに分類器の最上位ラベルを検出結果とします。

use std::path::Path;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::dataset::augment::{load_rgb_image, resize_exact};
use crate::error::{VisionError, VisionResult};
use crate::ml::classifier::ClassifierFactory;
use crate::ml::inference::VisionModel;

/// 検出の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// タイルの辺長（ピクセル）
    pub window_size: u32,
    /// この確率を超えたものだけを検出とする
    pub threshold: f32,
    /// 背景として無視するラベル
    pub background_label: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 128,
            threshold: 0.5,
            background_label: "default".to_string(),
        }
    }
}

/// リサイズ後の画像座標での矩形（`x2`, `y2` は含まない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// 検出結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub index: usize,
    pub probability: f32,
    pub bounding_box: BoundingBox,
}

/// タイルの格子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    pub window_size: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub steps_x: u32,
    pub steps_y: u32,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        (self.steps_x * self.steps_y) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// タイルを列挙（x方向が外側、y方向が内側）
    pub fn tiles(&self) -> impl Iterator<Item = BoundingBox> + '_ {
        let k = self.window_size;
        (0..self.steps_x).flat_map(move |sx| {
            (0..self.steps_y).map(move |sy| BoundingBox::new(sx * k, sy * k, (sx + 1) * k, (sy + 1) * k))
        })
    }
}

/// 元画像サイズから格子を決める（各辺を窓サイズの倍数に切り上げ）
pub fn plan_tiles(width: u32, height: u32, window_size: u32) -> VisionResult<TileGrid> {
    if window_size == 0 {
        return Err(VisionError::InvalidInput("window_size must be >= 1".to_string()));
    }
    if width == 0 || height == 0 {
        return Err(VisionError::InvalidInput(format!(
            "image is empty ({}x{})",
            width, height
        )));
    }

    let steps_x = width.div_ceil(window_size);
    let steps_y = height.div_ceil(window_size);
    Ok(TileGrid {
        window_size,
        resized_width: steps_x * window_size,
        resized_height: steps_y * window_size,
        steps_x,
        steps_y,
    })
}

/// 画像から矩形を切り出す
pub fn extract_tile(img: &RgbImage, bbox: &BoundingBox) -> VisionResult<RgbImage> {
    if bbox.x2 > img.width() || bbox.y2 > img.height() || bbox.x1 >= bbox.x2 || bbox.y1 >= bbox.y2 {
        return Err(VisionError::InvalidInput(format!(
            "タイル領域が画像範囲外です: ({},{})-({},{}) img_size({},{})",
            bbox.x1,
            bbox.y1,
            bbox.x2,
            bbox.y2,
            img.width(),
            img.height()
        )));
    }
    Ok(image::imageops::crop_imm(img, bbox.x1, bbox.y1, bbox.width(), bbox.height()).to_image())
}

fn classify_tile<F: ClassifierFactory>(
    model: &VisionModel<F>,
    resized: &RgbImage,
    bbox: BoundingBox,
    config: &DetectorConfig,
) -> VisionResult<Option<Detection>> {
    let tile = extract_tile(resized, &bbox)?;
    let top = model
        .predict_image(&tile)?
        .into_iter()
        .next()
        .ok_or_else(|| VisionError::InvalidInput("classifier returned no prediction".to_string()))?;

    let detection = match top.label {
        Some(label) if top.probability > config.threshold && label != config.background_label => {
            Some(Detection {
                label,
                index: top.index,
                probability: top.probability,
                bounding_box: bbox,
            })
        }
        _ => None,
    };
    Ok(detection)
}

/// 画像から物体を検出
///
/// タイル単位の失敗は警告を出して読み飛ばします。座標はリサイズ後の画像基準です。
pub fn detect_objects<F: ClassifierFactory>(
    model: &VisionModel<F>,
    image: &RgbImage,
    config: &DetectorConfig,
) -> VisionResult<Vec<Detection>> {
    if !model.is_ready() {
        return Err(VisionError::ModelNotReady);
    }

    let grid = plan_tiles(image.width(), image.height(), config.window_size)?;
    // 縦横比は保たない
    let resized = resize_exact(image, grid.resized_width, grid.resized_height);
    tracing::debug!(
        "検出: {}x{} -> {}x{}, タイル {}x{}",
        image.width(),
        image.height(),
        grid.resized_width,
        grid.resized_height,
        grid.steps_x,
        grid.steps_y
    );

    let mut detections = Vec::new();
    for bbox in grid.tiles() {
        match classify_tile(model, &resized, bbox, config) {
            Ok(Some(detection)) => detections.push(detection),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                "タイル ({}, {}) の分類に失敗したためスキップします: {}",
                bbox.x1,
                bbox.y1,
                e
            ),
        }
    }

    tracing::info!("検出数: {} / タイル数: {}", detections.len(), grid.len());
    Ok(detections)
}

/// 画像ファイルから物体を検出
pub fn detect_objects_in_file<F: ClassifierFactory, P: AsRef<Path>>(
    model: &VisionModel<F>,
    path: P,
    config: &DetectorConfig,
) -> VisionResult<Vec<Detection>> {
    let image = load_rgb_image(path.as_ref())?;
    detect_objects(model, &image, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::classifier::testing::{ScriptedClassifier, ScriptedFactory};
    use image::Rgb;

    fn model_with(dir: &Path, classifier: ScriptedClassifier) -> VisionModel<ScriptedFactory> {
        let mut model = VisionModel::open_with(dir, "burn", 3, ScriptedFactory::new((16, 16))).unwrap();
        model.labels_mut().add_label("apple").unwrap();
        model.labels_mut().add_label("default").unwrap();
        model.set_classifier(classifier).unwrap();
        model
    }

    #[test]
    fn test_plan_tiles_rounds_up() {
        let grid = plan_tiles(150, 150, 128).unwrap();
        assert_eq!((grid.resized_width, grid.resized_height), (256, 256));
        assert_eq!((grid.steps_x, grid.steps_y), (2, 2));

        let grid = plan_tiles(256, 100, 128).unwrap();
        assert_eq!((grid.resized_width, grid.resized_height), (256, 128));
        assert_eq!(grid.len(), 2);

        assert!(plan_tiles(0, 10, 128).is_err());
        assert!(plan_tiles(10, 10, 0).is_err());
    }

    #[test]
    fn test_tiles_cover_grid_in_order() {
        let grid = plan_tiles(300, 130, 100).unwrap();
        let tiles: Vec<BoundingBox> = grid.tiles().collect();
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[0], BoundingBox::new(0, 0, 100, 100));
        assert_eq!(tiles[1], BoundingBox::new(0, 100, 100, 200));
        assert_eq!(tiles[2], BoundingBox::new(100, 0, 200, 100));

        let covered: u32 = tiles.iter().map(|b| b.width() * b.height()).sum();
        assert_eq!(covered, grid.resized_width * grid.resized_height);
        assert!(tiles
            .iter()
            .all(|b| b.x2 <= grid.resized_width && b.y2 <= grid.resized_height));
    }

    #[test]
    fn test_extract_tile_bounds() {
        let img = RgbImage::from_fn(4, 4, |x, y| Rgb([x as u8, y as u8, 0]));
        let tile = extract_tile(&img, &BoundingBox::new(2, 2, 4, 4)).unwrap();
        assert_eq!(tile.dimensions(), (2, 2));
        assert_eq!(tile.get_pixel(0, 0).0, [2, 2, 0]);
        assert!(extract_tile(&img, &BoundingBox::new(2, 2, 5, 4)).is_err());
    }

    #[test]
    fn test_detects_only_confident_foreground() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = ScriptedClassifier::new(3, (16, 16)).with_default(vec![0.0, 0.99, 0.01]);
        classifier.push(vec![0.92, 0.05, 0.03]);
        let model = model_with(dir.path(), classifier);

        let image = RgbImage::from_pixel(150, 150, Rgb([50, 100, 150]));
        let detections = detect_objects(&model, &image, &DetectorConfig::default()).unwrap();

        assert_eq!(detections.len(), 1);
        let detection = &detections[0];
        assert_eq!(detection.label, "apple");
        assert_eq!(detection.index, 0);
        assert_eq!(detection.probability, 0.92);
        assert_eq!(detection.bounding_box, BoundingBox::new(0, 0, 128, 128));
        assert_eq!(detection.bounding_box.width(), 128);
    }

    #[test]
    fn test_threshold_is_strict_and_empty_slots_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = ScriptedClassifier::new(3, (16, 16)).with_default(vec![0.0, 0.99, 0.01]);
        classifier.push(vec![0.5, 0.3, 0.2]);
        classifier.push(vec![0.1, 0.1, 0.8]);
        let model = model_with(dir.path(), classifier);

        let image = RgbImage::new(256, 128);
        let detections = detect_objects(&model, &image, &DetectorConfig::default()).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn test_failed_tile_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = ScriptedClassifier::new(3, (16, 16)).with_default(vec![0.0, 0.99, 0.01]);
        classifier.push_error("tile failure");
        classifier.push(vec![0.8, 0.1, 0.1]);
        let model = model_with(dir.path(), classifier);

        let image = RgbImage::new(200, 200);
        let detections = detect_objects(&model, &image, &DetectorConfig::default()).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bounding_box, BoundingBox::new(0, 128, 128, 256));
    }

    #[test]
    fn test_unready_model_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = VisionModel::open_with(dir.path(), "burn", 3, ScriptedFactory::new((16, 16))).unwrap();
        let image = RgbImage::new(10, 10);
        assert!(matches!(
            detect_objects(&model, &image, &DetectorConfig::default()),
            Err(VisionError::ModelNotReady)
        ));

        let ready = model_with(&dir.path().join("ready"), ScriptedClassifier::new(3, (16, 16)));
        assert!(detect_objects_in_file(&ready, dir.path().join("missing.png"), &DetectorConfig::default()).is_err());
    }
}
