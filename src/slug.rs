/// Key used when a page identifier sanitizes to nothing.
pub const DEFAULT_SLUG: &str = "index";

/// Normalize an arbitrary page identifier into a storage key.
///
/// Every character outside `[A-Za-z0-9_-]` becomes `_` (one per character,
/// not per byte). An empty result maps to [`DEFAULT_SLUG`].
pub fn sanitize(raw: &str) -> String {
    let slug: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        DEFAULT_SLUG.to_string()
    } else {
        slug
    }
}
