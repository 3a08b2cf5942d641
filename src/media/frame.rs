//! Raw frame handling: BGR24 buffers out of the decoder, grayscale views for
//! detection, crops and the square padding applied before JPEG submission.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, GrayImage, RgbImage};

use super::MediaError;

/// A decoded frame in BGR24 layout, as produced by the video decoder.
#[derive(Debug, Clone)]
pub struct BgrFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl BgrFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MediaError> {
        let expected = width as usize * height as usize * 3;
        if data.len() < expected {
            return Err(MediaError::BadFrame(format!(
                "short frame: {} < {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn to_rgb(&self) -> RgbImage {
        let mut rgb = Vec::with_capacity(self.data.len());
        for pixel in self.data.chunks_exact(3) {
            rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
        }
        RgbImage::from_raw(self.width, self.height, rgb)
            .expect("dimensions validated in constructor")
    }

    /// Grayscale copy, optionally downscaled to `target_width` for cheaper
    /// detection. Returns the image and the scale applied to it.
    pub fn to_gray_scaled(&self, target_width: Option<u32>) -> (GrayImage, f64) {
        let gray = imageops::grayscale(&self.to_rgb());
        match target_width {
            Some(target) if target < self.width => {
                let scale = f64::from(target) / f64::from(self.width);
                let target_height = ((f64::from(self.height) * scale) as u32).max(1);
                (
                    imageops::resize(&gray, target, target_height, imageops::FilterType::Triangle),
                    scale,
                )
            }
            _ => (gray, 1.0),
        }
    }
}

/// Axis-aligned rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Map a rectangle found on a scaled-down image back to the original.
    pub fn unscale(&self, scale: f64) -> Rect {
        if scale >= 1.0 {
            return *self;
        }
        Rect {
            x: (f64::from(self.x) / scale) as u32,
            y: (f64::from(self.y) / scale) as u32,
            width: (f64::from(self.width) / scale) as u32,
            height: (f64::from(self.height) / scale) as u32,
        }
    }
}

/// Crop a region out of the frame, pad it into a centered square, and encode
/// it as base64 JPEG at the given quality.
pub fn crop_square_jpeg_base64(
    frame: &BgrFrame,
    region: Rect,
    quality: u8,
) -> Result<String, MediaError> {
    let rgb = frame.to_rgb();
    let cropped = imageops::crop_imm(&rgb, region.x, region.y, region.width, region.height)
        .to_image();

    let side = cropped.width().max(cropped.height());
    let mut square = RgbImage::new(side, side);
    let offset_x = (side - cropped.width()) / 2;
    let offset_y = (side - cropped.height()) / 2;
    imageops::overlay(&mut square, &cropped, i64::from(offset_x), i64::from(offset_y));

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode_image(&square)
        .map_err(MediaError::Jpeg)?;
    Ok(BASE64.encode(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, bgr: [u8; 3]) -> BgrFrame {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width * height) {
            data.extend_from_slice(&bgr);
        }
        BgrFrame::new(width, height, data).unwrap()
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(BgrFrame::new(4, 4, vec![0; 47]).is_err());
        assert!(BgrFrame::new(4, 4, vec![0; 48]).is_ok());
    }

    #[test]
    fn bgr_channels_swap_into_rgb() {
        let frame = solid_frame(2, 2, [255, 0, 0]); // pure blue in BGR
        let rgb = frame.to_rgb();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 255]);
    }

    #[test]
    fn detection_scale_halves_width() {
        let frame = solid_frame(640, 480, [10, 20, 30]);
        let (gray, scale) = frame.to_gray_scaled(Some(320));
        assert_eq!(gray.width(), 320);
        assert_eq!(gray.height(), 240);
        assert!((scale - 0.5).abs() < 1e-9);

        let (unscaled, scale) = frame.to_gray_scaled(None);
        assert_eq!(unscaled.width(), 640);
        assert_eq!(scale, 1.0);
    }

    #[test]
    fn rect_unscale_maps_back_to_frame_coordinates() {
        let rect = Rect {
            x: 10,
            y: 20,
            width: 40,
            height: 30,
        };
        assert_eq!(
            rect.unscale(0.5),
            Rect {
                x: 20,
                y: 40,
                width: 80,
                height: 60
            }
        );
        assert_eq!(rect.unscale(1.0), rect);
    }

    #[test]
    fn crop_encodes_square_jpeg() {
        let frame = solid_frame(64, 48, [0, 255, 0]);
        let region = Rect {
            x: 8,
            y: 8,
            width: 30,
            height: 20,
        };
        let encoded = crop_square_jpeg_base64(&frame, region, 90).unwrap();
        let bytes = BASE64.decode(encoded).unwrap();
        // JPEG SOI marker.
        assert_eq!(&bytes[0..2], &[0xff, 0xd8]);
    }
}
