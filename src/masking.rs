//! Applies ordered regex substitutions to a text response body.
//!
//! Mirrors `original_source/.../proxy/masking.py::mask_content`: rules run
//! left-to-right, cumulatively, against compiled patterns (compilation
//! happens once, at config-validation time — see `config::MaskRule`).

use crate::config::MaskRule;

/// Content types eligible for buffering + masking; everything else streams
/// through untouched.
pub const MASKABLE_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "text/html",
    "text/xml",
    "text/plain",
    "application/xml",
];

pub fn is_maskable_content_type(content_type: &str) -> bool {
    MASKABLE_CONTENT_TYPES.contains(&content_type)
}

pub fn mask_content(content: &str, rules: &[MaskRule]) -> String {
    let mut masked = content.to_string();
    for rule in rules {
        masked = rule
            .regex()
            .replace_all(&masked, rule.replacement.as_str())
            .into_owned();
    }
    masked
}
