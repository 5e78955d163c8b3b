use http::header::{AUTHORIZATION, HOST, VIA};
use http::HeaderMap;

/// Translate inbound relay headers into headers for the local target.
///
/// `Host` and `Via` describe the relay hop and are always dropped.
/// `Authorization` is dropped only when `strip_authorization` is set.
pub fn translate_headers(headers: &HeaderMap, strip_authorization: bool) -> HeaderMap {
    let mut out = headers.clone();
    out.remove(HOST);
    out.remove(VIA);
    if strip_authorization {
        out.remove(AUTHORIZATION);
    }
    out
}
