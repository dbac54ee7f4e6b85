//! On-disk file naming.

/// Replace every character outside `[A-Za-z0-9]` and `А`..=`я` with `_`.
///
/// Replacement is per UTF-16 code unit, so a character outside the Basic
/// Multilingual Plane (most emoji) becomes `__`. Existing projects carry
/// file names in that form.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || ('\u{0410}'..='\u{044F}').contains(&c) {
            out.push(c);
        } else {
            out.extend(std::iter::repeat_n('_', c.len_utf16()));
        }
    }
    out
}

/// Whether a document id is safe to embed in a file name.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// File name for a document: `<sanitized-name>_<id>.json`.
///
/// `id` must pass [`is_valid_id`].
pub fn file_name(name: &str, id: &str) -> String {
    format!("{}_{}.json", sanitize(name), id)
}
