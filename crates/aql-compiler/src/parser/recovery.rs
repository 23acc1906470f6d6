//! Recovery for archetype ids written as quoted strings.
//!
//! `COMPOSITION c['openEHR-EHR-COMPOSITION.report.v1']` is rejected by the
//! strict grammar because the archetype predicate only admits a bare id.
//! The rewrite drops the quotes so the query can be parsed a second time.

use std::sync::LazyLock;

use regex::Regex;

static QUOTED_ARCHETYPE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\[\s*['"]([A-Za-z][A-Za-z0-9_]*-[A-Za-z0-9_]+-[A-Za-z0-9_]+\.[A-Za-z0-9_.\-]+)['"]\s*\]"#,
    )
    .expect("Invalid archetype id regex")
});

/// Rewrite quoted archetype ids in class predicates.
///
/// Returns `None` when nothing was rewritten, meaning the original failure
/// is not of the recoverable kind.
pub fn recover_archetype_ids(text: &str) -> Option<String> {
    if !QUOTED_ARCHETYPE_ID.is_match(text) {
        return None;
    }
    Some(QUOTED_ARCHETYPE_ID.replace_all(text, "[$1]").into_owned())
}
