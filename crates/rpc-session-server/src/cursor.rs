//! Opaque pagination cursors.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as BASE64};

const PREFIX: &str = "offset:";

/// Encode a list offset as an opaque cursor.
#[must_use]
pub fn encode(offset: usize) -> String {
    BASE64.encode(format!("{PREFIX}{offset}"))
}

/// Decode a cursor produced by [`encode`].
#[must_use]
pub fn decode(cursor: &str) -> Option<usize> {
    let bytes = BASE64.decode(cursor).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    text.strip_prefix(PREFIX)?.parse().ok()
}
