//! Membership tests against a single source's entry vector.
//!
//! Entry vectors are sorted ascending and lowercased when installed, so the
//! lookup is a binary search with a case-folded equality check.

/// Returns true when the case-folded `domain` appears in `entries`.
pub fn contains(entries: &[String], domain: &str) -> bool {
    let folded = domain.to_lowercase();
    entries
        .binary_search_by(|entry| entry.as_str().cmp(folded.as_str()))
        .is_ok()
}
