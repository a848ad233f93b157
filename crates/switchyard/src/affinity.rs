//! Signed session affinity cookie
//!
//! The cookie names the backend address a client was pinned to, signed with
//! HMAC-SHA256 under the process-wide 32 byte key:
//! `base64url(addr) "." base64url(tag)`.
//! Anything that does not verify reads as "no cookie".

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use ring::hmac;

pub const COOKIE_NAME: &str = "_backend";
pub const KEY_LEN: usize = 32;

pub struct AffinityKey {
    key: hmac::Key,
}

impl AffinityKey {
    pub fn new(secret: &[u8; KEY_LEN]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Cookie value pinning a client to `addr`
    pub fn sign(&self, addr: &str) -> String {
        let tag = hmac::sign(&self.key, addr.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(addr),
            URL_SAFE_NO_PAD.encode(tag.as_ref())
        )
    }

    /// Backend address from a cookie value, if the signature holds
    pub fn verify(&self, value: &str) -> Option<String> {
        let (addr, tag) = value.split_once('.')?;
        let addr = URL_SAFE_NO_PAD.decode(addr).ok()?;
        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        hmac::verify(&self.key, &addr, &tag).ok()?;
        String::from_utf8(addr).ok()
    }

    /// Verified backend address from a request's cookies
    pub fn from_headers(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(name, _)| *name == COOKIE_NAME)
            .find_map(|(_, value)| self.verify(value.trim_matches('"')))
    }

    /// `Set-Cookie` header value for `addr`
    pub fn set_cookie(&self, addr: &str) -> Option<HeaderValue> {
        HeaderValue::from_str(&format!(
            "{}={}; Path=/; HttpOnly",
            COOKIE_NAME,
            self.sign(addr)
        ))
        .ok()
    }
}

impl std::fmt::Debug for AffinityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AffinityKey(..)")
    }
}
