//! 画像の読み込み・リサイズ・正規化とデータ拡張

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::VisionResult;

/// 分類器の入力サイズ（幅, 高さ）のデフォルト
pub const DEFAULT_INPUT_SIZE: (u32, u32) = (128, 128);

/// NHWC（チャネル数3）の正規化済み画像バッチ
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pub data: Vec<f32>,
    pub count: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageBatch {
    pub const CHANNELS: usize = 3;

    pub fn with_capacity(count: usize, width: usize, height: usize) -> Self {
        Self {
            data: Vec::with_capacity(count * height * width * Self::CHANNELS),
            count: 0,
            height,
            width,
        }
    }

    /// 1枚の画像からバッチを作成（`input_size` にリサイズして正規化）
    pub fn from_image(image: &RgbImage, input_size: (u32, u32)) -> Self {
        let mut batch = Self::with_capacity(1, input_size.0 as usize, input_size.1 as usize);
        batch.push_image(image);
        batch
    }

    /// 画像を追加（バッチのサイズにリサイズして正規化）
    pub fn push_image(&mut self, image: &RgbImage) {
        let resized = resize_exact(image, self.width as u32, self.height as u32);
        self.data.extend(normalize(&resized));
        self.count += 1;
    }

    pub fn image_len(&self) -> usize {
        self.height * self.width * Self::CHANNELS
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let len = self.image_len();
        &self.data[index * len..(index + 1) * len]
    }
}

/// 画像ファイルをRGBで読み込む
pub fn load_rgb_image(path: &Path) -> VisionResult<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

pub fn resize_exact(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.width() == width && image.height() == height {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// 8bitの画素値を [-1, 1] に線形変換（HWC順）
pub fn normalize(image: &RgbImage) -> impl Iterator<Item = f32> + '_ {
    image.as_raw().iter().map(|&v| normalize_value(v))
}

#[inline]
pub fn normalize_value(value: u8) -> f32 {
    value as f32 / 127.5 - 1.0
}

/// データ拡張の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Augmentation {
    /// 回転角の範囲（度、±）
    pub rotation_range: f32,
    /// 横方向シフト（画像幅に対する割合）
    pub width_shift_range: (f32, f32),
    /// 縦方向シフト（画像高さに対する割合）
    pub height_shift_range: (f32, f32),
    /// 明るさの倍率
    pub brightness_range: (f32, f32),
    /// ズーム倍率（x, y 独立に抽選）
    pub zoom_range: (f32, f32),
    /// 範囲外を埋める画素値
    pub fill_value: u8,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            rotation_range: 90.0,
            width_shift_range: (-0.2, 0.2),
            height_shift_range: (-0.2, 0.2),
            brightness_range: (0.8, 1.2),
            zoom_range: (0.5, 2.0),
            fill_value: 255,
        }
    }
}

impl Augmentation {
    /// ランダムな変換を1回適用した画像を返す（サイズは元画像と同じ）
    pub fn apply<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let params = TransformParams {
            angle: sample(rng, -self.rotation_range, self.rotation_range).to_radians(),
            shift_x: sample(rng, self.width_shift_range.0, self.width_shift_range.1)
                * image.width() as f32,
            shift_y: sample(rng, self.height_shift_range.0, self.height_shift_range.1)
                * image.height() as f32,
            zoom_x: sample(rng, self.zoom_range.0, self.zoom_range.1),
            zoom_y: sample(rng, self.zoom_range.0, self.zoom_range.1),
            brightness: sample(rng, self.brightness_range.0, self.brightness_range.1),
        };
        params.warp(image, self.fill_value)
    }
}

fn sample<R: Rng>(rng: &mut R, low: f32, high: f32) -> f32 {
    if high > low {
        rng.gen_range(low..high)
    } else {
        low
    }
}

/// 1回分のアフィン変換パラメータ
#[derive(Debug, Clone, Copy)]
struct TransformParams {
    angle: f32,
    shift_x: f32,
    shift_y: f32,
    zoom_x: f32,
    zoom_y: f32,
    brightness: f32,
}

impl TransformParams {
    /// 出力画素ごとに入力座標を逆算してバイリニア補間する
    fn warp(&self, image: &RgbImage, fill_value: u8) -> RgbImage {
        let (width, height) = image.dimensions();
        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;
        let (sin, cos) = self.angle.sin_cos();
        let fill = [fill_value as f32; 3];

        let mut out = RgbImage::new(width, height);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let rx = cos * dx + sin * dy;
            let ry = -sin * dx + cos * dy;
            let src_x = rx * self.zoom_x + cx + self.shift_x;
            let src_y = ry * self.zoom_y + cy + self.shift_y;

            let rgb = sample_bilinear(image, src_x, src_y).unwrap_or(fill);
            *pixel = Rgb(rgb.map(|v| (v * self.brightness).round().clamp(0.0, 255.0) as u8));
        }
        out
    }
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Option<[f32; 3]> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return None;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut rgb = [0.0f32; 3];
    for (c, value) in rgb.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = top * (1.0 - fy) + bottom * fy;
    }
    Some(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_normalize_bounds() {
        assert_eq!(normalize_value(255), 1.0);
        assert_eq!(normalize_value(0), -1.0);

        let image = RgbImage::from_fn(4, 4, |x, y| Rgb([(x * 60) as u8, (y * 80) as u8, 255]));
        assert!(normalize(&image).all(|v| (-1.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_image_batch_resizes_to_input_size() {
        let image = RgbImage::from_pixel(50, 30, Rgb([120, 40, 200]));
        let batch = ImageBatch::from_image(&image, (16, 8));
        assert_eq!(batch.count, 1);
        assert_eq!(batch.width, 16);
        assert_eq!(batch.height, 8);
        assert_eq!(batch.data.len(), 16 * 8 * 3);
        assert!(batch.data.iter().all(|v| (-1.0..=1.0).contains(v)));

        let white = RgbImage::from_pixel(16, 8, Rgb([255, 255, 255]));
        let batch = ImageBatch::from_image(&white, (16, 8));
        assert!(batch.image(0).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_augmentation_keeps_size_and_range() {
        let image = RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 128]));
        let mut rng = StdRng::seed_from_u64(7);
        let augmentation = Augmentation::default();

        for _ in 0..5 {
            let out = augmentation.apply(&image, &mut rng);
            assert_eq!(out.dimensions(), image.dimensions());
        }
    }

    #[test]
    fn test_identity_transform_preserves_pixels() {
        let image = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 7]));
        let identity = Augmentation {
            rotation_range: 0.0,
            width_shift_range: (0.0, 0.0),
            height_shift_range: (0.0, 0.0),
            brightness_range: (1.0, 1.0),
            zoom_range: (1.0, 1.0),
            fill_value: 255,
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(identity.apply(&image, &mut rng), image);
    }

    #[test]
    fn test_out_of_bounds_uses_fill_value() {
        let image = RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]));
        let shifted = Augmentation {
            rotation_range: 0.0,
            width_shift_range: (2.0, 2.0),
            height_shift_range: (0.0, 0.0),
            brightness_range: (1.0, 1.0),
            zoom_range: (1.0, 1.0),
            fill_value: 200,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let out = shifted.apply(&image, &mut rng);
        assert!(out.pixels().all(|p| p.0 == [200, 200, 200]));
    }
}
