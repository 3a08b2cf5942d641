//! SDP post-processing for the answer the bot sends back to callers.
//!
//! The answer produced by the peer connection is patched with bandwidth
//! hints before it goes out: a `b=AS` line after `m=video` and an
//! `a=fmtp` line with the goog bitrate knobs attached to the VP8 payload.
//! The session description applied locally stays untouched.

/// Insert video-quality hints into an SDP answer.
///
/// `as_kbps` becomes a `b=AS:` line directly under each `m=video` section;
/// `min_kbps`/`max_kbps` become an `a=fmtp:` line on the VP8 payload with the
/// start bitrate at their midpoint. Non-video sections and existing fmtp
/// lines for other codecs are left alone.
pub fn patch_for_quality(sdp: &str, as_kbps: u32, min_kbps: u32, max_kbps: u32) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_video = false;
    let mut inserted_fmtp = false;

    for line in sdp.lines() {
        out.push(line.to_string());
        let trimmed = line.trim();

        if trimmed.starts_with("m=video") {
            in_video = true;
            inserted_fmtp = false;
            if as_kbps > 0 {
                out.push(format!("b=AS:{as_kbps}"));
            }
            continue;
        }

        if !in_video {
            continue;
        }

        if trimmed.starts_with("m=") {
            in_video = false;
            continue;
        }

        if !inserted_fmtp && min_kbps > 0 && max_kbps > 0 {
            if let Some(payload) = vp8_payload_type(trimmed) {
                let start = (min_kbps + max_kbps) / 2;
                out.push(format!(
                    "a=fmtp:{payload} x-google-min-bitrate={min_kbps};x-google-max-bitrate={max_kbps};x-google-start-bitrate={start};max-fr=30;max-fs=3600"
                ));
                inserted_fmtp = true;
            }
        }
    }

    out.join("\n")
}

fn vp8_payload_type(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    if !rest.contains("VP8/90000") {
        return None;
    }
    rest.split_whitespace().next()
}

/// One host candidate recovered from the local description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_mline_index: u32,
}

/// Extract every `a=candidate:` line from an SDP, tagged with the mid and
/// m-line index of the section it belongs to. Sections without an `a=mid:`
/// are skipped because the remote side cannot route such candidates.
pub fn extract_candidates(sdp: &str) -> Vec<SdpCandidate> {
    let normalized = sdp.replace("\r\n", "\n");

    // First pass: m-line index -> mid.
    let mut mids = std::collections::HashMap::new();
    let mut mline: i32 = -1;
    for line in normalized.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("m=") {
            mline += 1;
        }
        if let Some(mid) = trimmed.strip_prefix("a=mid:") {
            mids.insert(mline, mid.to_string());
        }
    }

    let mut candidates = Vec::new();
    let mut mline: i32 = -1;
    for line in normalized.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("m=") {
            mline += 1;
        }
        if let Some(body) = trimmed.strip_prefix("a=") {
            if body.starts_with("candidate:") {
                if let Some(mid) = mids.get(&mline) {
                    candidates.push(SdpCandidate {
                        candidate: body.to_string(),
                        sdp_mid: mid.clone(),
                        sdp_mline_index: mline as u32,
                    });
                }
            }
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\n\
o=- 123 2 IN IP4 127.0.0.1\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
a=mid:0\n\
a=rtpmap:111 opus/48000/2\n\
a=fmtp:111 minptime=10;useinbandfec=1\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\n\
a=mid:1\n\
a=rtpmap:96 VP8/90000\n\
a=candidate:1 1 udp 2130706431 192.168.1.2 54321 typ host\n";

    #[test]
    fn patch_inserts_bandwidth_after_video_mline() {
        let patched = patch_for_quality(ANSWER, 2500, 1500, 3000);
        let lines: Vec<&str> = patched.lines().collect();
        let video_idx = lines.iter().position(|l| l.starts_with("m=video")).unwrap();
        assert_eq!(lines[video_idx + 1], "b=AS:2500");
        assert_eq!(patched.matches("b=AS:2500").count(), 1);
    }

    #[test]
    fn patch_attaches_fmtp_to_vp8_payload_once() {
        let patched = patch_for_quality(ANSWER, 2500, 1500, 3000);
        let fmtp = "a=fmtp:96 x-google-min-bitrate=1500;x-google-max-bitrate=3000;x-google-start-bitrate=2250;max-fr=30;max-fs=3600";
        assert_eq!(patched.matches(fmtp).count(), 1);
        // Double patching stays idempotent per m=video block.
        let twice = patch_for_quality(&patched, 0, 0, 0);
        assert_eq!(twice.matches("x-google-min-bitrate").count(), 1);
    }

    #[test]
    fn patch_leaves_audio_fmtp_untouched() {
        let patched = patch_for_quality(ANSWER, 2500, 1500, 3000);
        assert!(patched.contains("a=fmtp:111 minptime=10;useinbandfec=1"));
        assert!(!patched.contains("a=fmtp:111 x-google"));
    }

    #[test]
    fn extract_finds_candidates_with_mid_and_index() {
        let candidates = extract_candidates(ANSWER);
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0],
            SdpCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.168.1.2 54321 typ host".into(),
                sdp_mid: "1".into(),
                sdp_mline_index: 1,
            }
        );
    }

    #[test]
    fn extract_skips_sections_without_mid() {
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96\na=candidate:1 1 udp 1 10.0.0.1 1 typ host\n";
        assert!(extract_candidates(sdp).is_empty());
    }
}
