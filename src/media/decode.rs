//! Bounded VP8 keyframe decode.
//!
//! The keyframe is wrapped in a one-frame IVF stream and piped through an
//! ffmpeg subprocess that emits raw BGR24. Decode output is capped to the
//! configured bounds to keep CPU in check, and the whole exchange runs under
//! a hard 2-second deadline.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::DimensionConfig;

use super::frame::BgrFrame;
use super::{vp8, MediaError};

const DECODE_DEADLINE: Duration = Duration::from_secs(2);

/// Decode a VP8 keyframe into a BGR24 frame no larger than the configured
/// decode bounds.
pub async fn decode_keyframe(
    frame: &[u8],
    dims: &DimensionConfig,
) -> Result<BgrFrame, MediaError> {
    let (orig_width, orig_height) = vp8::keyframe_dimensions(frame)
        .ok_or_else(|| MediaError::BadFrame("not a decodable VP8 keyframe".into()))?;
    let (width, height) = vp8::bounded_decode_size(
        orig_width,
        orig_height,
        dims.max_decode_width,
        dims.max_decode_height,
    );
    let ivf = vp8::wrap_ivf(frame, orig_width, orig_height);

    let mut args: Vec<String> = vec![
        "-loglevel".into(),
        "error".into(),
        "-nostdin".into(),
        "-f".into(),
        "ivf".into(),
        "-i".into(),
        "pipe:0".into(),
    ];
    if width != orig_width || height != orig_height {
        args.push("-vf".into());
        args.push(format!("scale={width}:{height}:flags=fast_bilinear"));
    }
    args.extend(
        [
            "-frames:v",
            "1",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgr24",
            "-threads",
            "1",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    let result = timeout(DECODE_DEADLINE, run_ffmpeg(&args, ivf)).await;
    let output = match result {
        Ok(inner) => inner?,
        Err(_) => return Err(MediaError::DecodeTimeout),
    };

    debug!(
        orig_width,
        orig_height, width, height, "decoded keyframe"
    );
    BgrFrame::new(width, height, output)
}

async fn run_ffmpeg(args: &[String], input: Vec<u8>) -> Result<Vec<u8>, MediaError> {
    let mut child = Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| MediaError::Decoder(format!("ffmpeg spawn: {err}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| MediaError::Decoder("ffmpeg stdin unavailable".into()))?;
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        // Dropping stdin closes the pipe so ffmpeg sees EOF.
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| MediaError::Decoder(format!("ffmpeg wait: {err}")))?;
    let _ = writer.await;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let short: String = stderr.chars().take(200).collect();
        return Err(MediaError::Decoder(format!(
            "ffmpeg exited with {}: {short}",
            output.status
        )));
    }
    Ok(output.stdout)
}
