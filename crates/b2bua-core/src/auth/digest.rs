//! Digest answers for upstream 401/407 challenges
//!
//! An egress route can carry credentials (`auth=user:pass`). When the
//! callee challenges the INVITE, the originating UA answers once with an
//! RFC 2617 MD5 digest.

use crate::sip::SipHeader;

/// The parts of a `Digest` challenge needed to answer it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    /// True for `Proxy-Authenticate`
    pub proxy: bool,
}

fn auth_param(value: &str, name: &str) -> Option<String> {
    let quoted = format!("{}=\"", name);
    if let Some(pos) = find_param(value, &quoted) {
        let start = pos + quoted.len();
        let end = value[start..].find('"')?;
        return Some(value[start..start + end].to_string());
    }
    let bare = format!("{}=", name);
    let pos = find_param(value, &bare)?;
    let start = pos + bare.len();
    let end = value[start..]
        .find(|c: char| c == ',' || c.is_whitespace())
        .unwrap_or(value.len() - start);
    Some(value[start..start + end].to_string())
}

// parameter names must start at a word boundary so "nonce" never matches "cnonce"
fn find_param(value: &str, needle: &str) -> Option<usize> {
    let lower = value.to_ascii_lowercase();
    let mut from = 0;
    while let Some(idx) = lower[from..].find(needle) {
        let pos = from + idx;
        let boundary = pos == 0
            || matches!(lower.as_bytes()[pos - 1], b' ' | b',' | b'\t');
        if boundary {
            return Some(pos);
        }
        from = pos + needle.len();
    }
    None
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` / `Proxy-Authenticate` header
    pub fn from_header(header: &SipHeader) -> Option<Self> {
        let value = header.value.trim();
        let scheme_end = value.find(char::is_whitespace)?;
        if !value[..scheme_end].eq_ignore_ascii_case("digest") {
            return None;
        }
        let params = &value[scheme_end..];
        Some(Self {
            realm: auth_param(params, "realm")?,
            nonce: auth_param(params, "nonce")?,
            opaque: auth_param(params, "opaque"),
            qop: auth_param(params, "qop"),
            algorithm: auth_param(params, "algorithm"),
            proxy: header.is("Proxy-Authenticate"),
        })
    }

    fn supports_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }

    /// Build the `Authorization` / `Proxy-Authorization` header answering
    /// this challenge
    pub fn answer(&self, username: &str, password: &str, method: &str, uri: &str) -> SipHeader {
        let cnonce = format!("{:08x}", rand::random::<u32>());
        self.answer_with_cnonce(username, password, method, uri, &cnonce)
    }

    pub(crate) fn answer_with_cnonce(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> SipHeader {
        let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, self.realm, password)));
        let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            username, self.realm, self.nonce, uri
        );
        if self.supports_qop_auth() {
            let nc = "00000001";
            let response = format!(
                "{:x}",
                md5::compute(format!("{}:{}:{}:{}:auth:{}", ha1, self.nonce, nc, cnonce, ha2))
            );
            value.push_str(&format!(
                ", response=\"{}\", qop=auth, nc={}, cnonce=\"{}\"",
                response, nc, cnonce
            ));
        } else {
            let response = format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, self.nonce, ha2)));
            value.push_str(&format!(", response=\"{}\"", response));
        }
        value.push_str(", algorithm=MD5");
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }

        let name = if self.proxy { "Proxy-Authorization" } else { "Authorization" };
        SipHeader::new(name, value)
    }
}
