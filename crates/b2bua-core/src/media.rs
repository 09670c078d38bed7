//! Media relay collaborator and payload-type filtering
//!
//! The relay itself (an RTP proxy) is external. A call creates at most one
//! [`MediaRelaySession`] and pushes every media description crossing the
//! bridge through it, so the relay can substitute its own addresses.
//! Session methods are called with the call lock held and must not block.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::common::{B2buaError, Result};
use crate::sip::MediaBody;

/// Factory for relay sessions
pub trait MediaRelay: Send + Sync {
    fn new_session(&self, call_id: &str) -> Result<Arc<dyn MediaRelaySession>>;
}

/// One call's relay session
pub trait MediaRelaySession: Send + Sync {
    fn set_caller_target(&self, addr: SocketAddr);

    fn set_callee_target(&self, addr: SocketAddr);

    /// The caller's description changed; returns the body to send to the
    /// callee
    fn caller_media_changed(&self, body: &MediaBody) -> Result<MediaBody>;

    /// The callee's description changed; returns the body to send to the
    /// caller
    fn callee_media_changed(&self, body: &MediaBody) -> Result<MediaBody>;

    fn delete(&self);
}

/// Restrict every `m=` line of an SDP body to the allowed payload types.
///
/// `rtpmap`/`fmtp` attributes of removed formats are dropped with them. A
/// non-SDP body is returned unchanged. Fails with [`B2buaError::MediaPolicy`]
/// when no media line keeps at least one format.
pub fn filter_payload_types(body: &MediaBody, allowed: &[u8]) -> Result<MediaBody> {
    if !body.is_sdp() {
        return Ok(body.clone());
    }
    let text = body
        .as_text()
        .ok_or_else(|| B2buaError::MediaPolicy("SDP body is not UTF-8".into()))?;

    let mut out = Vec::new();
    let mut kept_in_section: Vec<String> = Vec::new();
    let mut usable_sections = 0;
    let mut sections = 0;

    for line in text.lines() {
        if let Some(mline) = line.strip_prefix("m=") {
            sections += 1;
            let fields: Vec<&str> = mline.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(B2buaError::MediaPolicy(format!("malformed media line {:?}", line)));
            }
            let (head, formats) = fields.split_at(3);
            kept_in_section = formats
                .iter()
                .filter(|f| f.parse::<u8>().map(|pt| allowed.contains(&pt)).unwrap_or(false))
                .map(|f| f.to_string())
                .collect();
            if kept_in_section.is_empty() {
                // disable the stream: port 0 with the first original format
                let first = formats.first().copied().unwrap_or("0");
                out.push(format!("m={} 0 {} {}", head[0], head[2], first));
            } else {
                usable_sections += 1;
                out.push(format!("m={} {}", head.join(" "), kept_in_section.join(" ")));
            }
            continue;
        }

        let pt_attr = line
            .strip_prefix("a=rtpmap:")
            .or_else(|| line.strip_prefix("a=fmtp:"))
            .and_then(|rest| rest.split_whitespace().next());
        if let Some(pt) = pt_attr {
            if sections > 0 && !kept_in_section.iter().any(|k| k == pt) {
                continue;
            }
        }
        out.push(line.to_string());
    }

    if sections == 0 || usable_sections == 0 {
        return Err(B2buaError::MediaPolicy("no acceptable payload types".into()));
    }

    let mut rendered = out.join("\r\n");
    rendered.push_str("\r\n");
    Ok(MediaBody::sdp(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 192.0.2.1\r\ns=-\r\nc=IN IP4 192.0.2.1\r\nt=0 0\r\n\
        m=audio 4000 RTP/AVP 0 18 101\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:18 G729/8000\r\n\
        a=fmtp:18 annexb=no\r\na=rtpmap:101 telephone-event/8000\r\n";

    #[test]
    fn test_filter_keeps_allowed_formats() {
        let filtered = filter_payload_types(&MediaBody::sdp(OFFER), &[0, 101]).unwrap();
        let text = filtered.as_text().unwrap();
        assert!(text.contains("m=audio 4000 RTP/AVP 0 101\r\n"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000"));
        assert!(!text.contains("G729"));
        assert!(!text.contains("annexb"));
        assert!(text.contains("a=rtpmap:101 telephone-event/8000"));
    }

    #[test]
    fn test_empty_intersection_is_rejected() {
        let err = filter_payload_types(&MediaBody::sdp(OFFER), &[8]).unwrap_err();
        assert!(matches!(err, B2buaError::MediaPolicy(_)));
    }

    #[test]
    fn test_non_sdp_body_passes_through() {
        let body = MediaBody::new("application/isup", "raw");
        assert_eq!(filter_payload_types(&body, &[0]).unwrap(), body);
    }
}
