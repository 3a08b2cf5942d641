//! VP8 keyframe inspection and IVF wrapping.
//!
//! A VP8 frame starts with a 3-byte little-endian frame tag whose low bit is
//! 0 for keyframes, followed by the start code `9d 01 2a` and 14-bit
//! width/height fields. Keyframes are wrapped in a one-frame IVF container
//! so the decoder can consume them from a pipe.

const START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];

/// True iff the buffer holds a VP8 keyframe: low tag bit clear and the start
/// code in bytes 3..6. Anything shorter than 10 bytes is rejected outright.
pub fn is_keyframe(frame: &[u8]) -> bool {
    if frame.len() < 10 {
        return false;
    }
    let tag = u32::from(frame[0]) | (u32::from(frame[1]) << 8) | (u32::from(frame[2]) << 16);
    if tag & 0x1 != 0 {
        return false;
    }
    frame[3..6] == START_CODE
}

/// Width and height encoded in a keyframe header.
pub fn keyframe_dimensions(frame: &[u8]) -> Option<(u32, u32)> {
    if !is_keyframe(frame) {
        return None;
    }
    let width = (u32::from(frame[6]) | (u32::from(frame[7]) << 8)) & 0x3fff;
    let height = (u32::from(frame[8]) | (u32::from(frame[9]) << 8)) & 0x3fff;
    if width == 0 || height == 0 || width > 3840 || height > 2160 {
        return None;
    }
    Some((width, height))
}

/// Wrap a single VP8 frame in an IVF stream: 32-byte file header (30 fps
/// timebase, frame count 1) plus a 12-byte frame header.
pub fn wrap_ivf(frame: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 12 + frame.len());

    out.extend_from_slice(b"DKIF");
    out.extend_from_slice(&0u16.to_le_bytes()); // version
    out.extend_from_slice(&32u16.to_le_bytes()); // header length
    out.extend_from_slice(b"VP80");
    out.extend_from_slice(&(width as u16).to_le_bytes());
    out.extend_from_slice(&(height as u16).to_le_bytes());
    out.extend_from_slice(&30u32.to_le_bytes()); // timebase denominator
    out.extend_from_slice(&1u32.to_le_bytes()); // timebase numerator
    out.extend_from_slice(&1u32.to_le_bytes()); // frame count
    out.extend_from_slice(&0u32.to_le_bytes()); // unused

    out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // presentation timestamp
    out.extend_from_slice(frame);
    out
}

/// Shrink `(width, height)` to fit inside the decode bounds, preserving
/// aspect ratio and rounding down to even dimensions.
pub fn bounded_decode_size(
    width: u32,
    height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = (f64::from(max_width) / f64::from(width))
        .min(f64::from(max_height) / f64::from(height));
    let new_width = (((f64::from(width) * scale) as u32) / 2 * 2).max(2);
    let new_height = (((f64::from(height) * scale) as u32) / 2 * 2).max(2);
    (new_width, new_height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut frame = vec![0u8; 16];
        frame[0] = 0x10; // low bit clear
        frame[3..6].copy_from_slice(&START_CODE);
        frame[6] = (width & 0xff) as u8;
        frame[7] = ((width >> 8) & 0x3f) as u8;
        frame[8] = (height & 0xff) as u8;
        frame[9] = ((height >> 8) & 0x3f) as u8;
        frame
    }

    #[test]
    fn keyframe_detector_checks_tag_and_magic() {
        assert!(is_keyframe(&keyframe_bytes(640, 480)));

        let mut interframe = keyframe_bytes(640, 480);
        interframe[0] |= 0x1;
        assert!(!is_keyframe(&interframe));

        let mut bad_magic = keyframe_bytes(640, 480);
        bad_magic[4] = 0x00;
        assert!(!is_keyframe(&bad_magic));
    }

    #[test]
    fn keyframe_detector_rejects_short_frames() {
        assert!(!is_keyframe(&[]));
        assert!(!is_keyframe(&keyframe_bytes(640, 480)[..9]));
    }

    #[test]
    fn dimensions_are_parsed_and_bounded() {
        assert_eq!(keyframe_dimensions(&keyframe_bytes(1280, 720)), Some((1280, 720)));
        assert_eq!(keyframe_dimensions(&keyframe_bytes(0, 480)), None);
    }

    #[test]
    fn ivf_layout_matches_contract() {
        let frame = keyframe_bytes(320, 240);
        let ivf = wrap_ivf(&frame, 320, 240);
        assert_eq!(&ivf[0..4], b"DKIF");
        assert_eq!(u16::from_le_bytes([ivf[6], ivf[7]]), 32);
        assert_eq!(&ivf[8..12], b"VP80");
        assert_eq!(u16::from_le_bytes([ivf[12], ivf[13]]), 320);
        assert_eq!(u16::from_le_bytes([ivf[14], ivf[15]]), 240);
        assert_eq!(u32::from_le_bytes([ivf[16], ivf[17], ivf[18], ivf[19]]), 30);
        assert_eq!(u32::from_le_bytes([ivf[24], ivf[25], ivf[26], ivf[27]]), 1);
        assert_eq!(
            u32::from_le_bytes([ivf[32], ivf[33], ivf[34], ivf[35]]) as usize,
            frame.len()
        );
        assert_eq!(&ivf[44..], frame.as_slice());
    }

    #[test]
    fn decode_size_stays_within_bounds_and_even() {
        assert_eq!(bounded_decode_size(640, 480, 640, 480), (640, 480));
        assert_eq!(bounded_decode_size(1280, 720, 640, 480), (640, 360));
        let (w, h) = bounded_decode_size(1919, 1079, 640, 480);
        assert!(w <= 640 && h <= 480);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
    }
}
