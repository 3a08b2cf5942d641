//! Face detection seam and face-box geometry.
//!
//! Detection itself is an external concern: anything that can turn a
//! grayscale frame into candidate rectangles implements [`FaceDetector`].
//! The geometry that selects and frames the submitted crop lives here and is
//! pure: pick the largest rectangle meeting the minimum size, expand it, and
//! re-center it into a square clipped to the image bounds.

use image::GrayImage;
use thiserror::Error;

use crate::media::frame::Rect;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to load cascade {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Candidate-face provider over grayscale frames.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &GrayImage) -> Vec<Rect>;
}

/// Largest rectangle whose width and height both meet `min_size`.
pub fn largest_valid_face(rects: &[Rect], min_size: u32) -> Option<Rect> {
    rects
        .iter()
        .filter(|rect| rect.width >= min_size && rect.height >= min_size)
        .max_by_key(|rect| rect.area())
        .copied()
}

/// Expand a face box by `ratio` on each side, then grow it into a square
/// centered on the expanded region, shifting and clipping so it stays inside
/// the `frame_width` x `frame_height` image.
pub fn expand_and_center(face: Rect, frame_width: u32, frame_height: u32, ratio: f64) -> Rect {
    let expand_x = (f64::from(face.width) * ratio) as i64;
    let expand_y = (f64::from(face.height) * ratio) as i64;

    let x1 = (i64::from(face.x) - expand_x).max(0);
    let y1 = (i64::from(face.y) - expand_y).max(0);
    let x2 = (i64::from(face.x) + i64::from(face.width) + expand_x).min(i64::from(frame_width));
    let y2 = (i64::from(face.y) + i64::from(face.height) + expand_y).min(i64::from(frame_height));

    let expanded_width = x2 - x1;
    let expanded_height = y2 - y1;
    let side = expanded_width.max(expanded_height);

    let center_x = x1 + expanded_width / 2;
    let center_y = y1 + expanded_height / 2;

    let mut sq_x1 = center_x - side / 2;
    let mut sq_y1 = center_y - side / 2;
    let mut sq_x2 = sq_x1 + side;
    let mut sq_y2 = sq_y1 + side;

    if sq_x1 < 0 {
        sq_x1 = 0;
        sq_x2 = side.min(i64::from(frame_width));
    }
    if sq_y1 < 0 {
        sq_y1 = 0;
        sq_y2 = side.min(i64::from(frame_height));
    }
    if sq_x2 > i64::from(frame_width) {
        sq_x2 = i64::from(frame_width);
        sq_x1 = (sq_x2 - side).max(0);
    }
    if sq_y2 > i64::from(frame_height) {
        sq_y2 = i64::from(frame_height);
        sq_y1 = (sq_y2 - side).max(0);
    }

    Rect {
        x: sq_x1 as u32,
        y: sq_y1 as u32,
        width: (sq_x2 - sq_x1) as u32,
        height: (sq_y2 - sq_y1) as u32,
    }
}

#[cfg(feature = "haar")]
pub mod haar {
    //! Haar-cascade detection through OpenCV, loading the standard
    //! `haarcascade_frontalface_default.xml` model.

    use image::GrayImage;
    use opencv::core::{Mat, Size, Vector};
    use opencv::objdetect::CascadeClassifier;
    use opencv::prelude::*;
    use parking_lot::Mutex;

    use super::{DetectorError, FaceDetector};
    use crate::media::frame::Rect;

    pub struct HaarFaceDetector {
        classifier: Mutex<CascadeClassifier>,
    }

    impl HaarFaceDetector {
        pub fn load(path: &str) -> Result<Self, DetectorError> {
            let classifier = CascadeClassifier::new(path).map_err(|err| DetectorError::Load {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
            if classifier.empty().unwrap_or(true) {
                return Err(DetectorError::Load {
                    path: path.to_string(),
                    reason: "cascade file is empty".into(),
                });
            }
            Ok(Self {
                classifier: Mutex::new(classifier),
            })
        }
    }

    impl FaceDetector for HaarFaceDetector {
        fn detect(&self, image: &GrayImage) -> Vec<Rect> {
            let mat = match Mat::new_rows_cols_with_data(
                image.height() as i32,
                image.width() as i32,
                image.as_raw(),
            ) {
                Ok(mat) => mat,
                Err(_) => return Vec::new(),
            };
            let mut found = Vector::<opencv::core::Rect>::new();
            // Size filtering happens after the rectangles are mapped back to
            // full-frame coordinates, so no minimum is imposed here.
            let result = self.classifier.lock().detect_multi_scale(
                &mat,
                &mut found,
                1.1,
                3,
                0,
                Size::new(0, 0),
                Size::new(0, 0),
            );
            if result.is_err() {
                return Vec::new();
            }
            found
                .iter()
                .filter(|r| r.x >= 0 && r.y >= 0)
                .map(|r| Rect {
                    x: r.x as u32,
                    y: r.y as u32,
                    width: r.width as u32,
                    height: r.height as u32,
                })
                .collect()
        }
    }
}
