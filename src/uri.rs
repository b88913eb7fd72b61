//! `qrtr://<node-id>` URI helper.

const URI_PREFIX: &str = "qrtr://";

/// Render the URI naming `node_id`, e.g. `qrtr://24`.
pub fn for_node(node_id: u32) -> String {
    format!("{URI_PREFIX}{node_id}")
}

/// Parse a QRTR URI back into its node id.
///
/// The scheme is matched case-insensitively and the node id is read as the
/// leading run of decimal digits after the prefix; anything following the
/// digits is ignored. `None` when the scheme does not match, no digit
/// follows it, or the value overflows a `u32`.
pub fn node_id(uri: &str) -> Option<u32> {
    // `get` also rejects a split inside a multi-byte character.
    let scheme = uri.get(..URI_PREFIX.len())?;
    if !scheme.eq_ignore_ascii_case(URI_PREFIX) {
        return None;
    }
    let rest = &uri[URI_PREFIX.len()..];

    let digits: &str = match rest.find(|c: char| !c.is_ascii_digit()) {
        Some(end) => &rest[..end],
        None => rest,
    };
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
