//! Remote job naming convention: `{prefix}-{hash}[-array]`.
//!
//! Reunification recovers the hash from names produced here, so the format
//! and [`hash_from_job_name`] must change together.

use crate::constants::naming::ARRAY_JOB_SUFFIX;
use regex::Regex;
use std::sync::OnceLock;

pub fn job_name(prefix: &str, hash: &str, array: bool) -> String {
    if array {
        format!("{}-{}-{}", prefix, hash, ARRAY_JOB_SUFFIX)
    } else {
        format!("{}-{}", prefix, hash)
    }
}

pub fn is_array_job_name(name: &str) -> bool {
    name.ends_with(&format!("-{}", ARRAY_JOB_SUFFIX))
}

fn hash_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^.*-(?P<hash>[^-]+)$").unwrap()
    })
}

/// Returns `None` for names without a `-`, which belong to unrelated jobs
/// that merely share the prefix.
pub fn hash_from_job_name(name: &str) -> Option<&str> {
    let suffix = format!("-{}", ARRAY_JOB_SUFFIX);
    let name = name.strip_suffix(suffix.as_str()).unwrap_or(name);
    hash_pattern()
        .captures(name)
        .and_then(|caps| caps.name("hash"))
        .map(|m| m.as_str())
}
