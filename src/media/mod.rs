pub mod audio;
pub mod decode;
pub mod frame;
pub mod vp8;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("decoder failure: {0}")]
    Decoder(String),
    #[error("decode deadline exceeded")]
    DecodeTimeout,
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[source] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("media track error: {0}")]
    Track(#[from] webrtc::Error),
}
