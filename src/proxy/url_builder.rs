//! Composes the upstream URL from a configurable base and an inbound path,
//! reconciling version-segment (`v1beta`) duplication.
//!
//! Grounded line-for-line on the reference implementation's
//! `build_upstream_url`.

/// Build an absolute upstream URL from `base` and an inbound `path`.
///
/// If `base`'s own path segment already contains `v1beta`, a leading
/// `v1beta/` on `path` is stripped once; otherwise one is prepended. Exactly
/// one `/` joins base and path either way, so the function is idempotent on
/// an already-built URL.
pub fn build_upstream_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/').trim_end_matches('/');

    let base_has_version = base.contains("v1beta");

    let path = if base_has_version {
        path.strip_prefix("v1beta/").unwrap_or(path)
    } else {
        path
    };

    let path = if !base_has_version && !path.starts_with("v1beta/") {
        format!("v1beta/{path}")
    } else {
        path.to_string()
    };

    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepends_version_when_base_lacks_it() {
        let url = build_upstream_url("https://example.com/api", "models/x:generateContent");
        assert_eq!(url, "https://example.com/api/v1beta/models/x:generateContent");
    }

    #[test]
    fn strips_duplicate_version_segment() {
        let url = build_upstream_url(
            "https://generativelanguage.googleapis.com/v1beta",
            "v1beta/models/x:generateContent",
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/x:generateContent"
        );
    }

    #[test]
    fn handles_leading_and_trailing_slashes() {
        let url = build_upstream_url("https://example.com/v1beta/", "/models/x:generateContent/");
        assert_eq!(url, "https://example.com/v1beta/models/x:generateContent");
    }

    #[test]
    fn is_idempotent_on_already_built_urls() {
        let base = "https://generativelanguage.googleapis.com/v1beta";
        let once = build_upstream_url(base, "models/x:generateContent");
        let stripped = once.strip_prefix(base).unwrap();
        let twice = build_upstream_url(base, stripped);
        assert_eq!(once, twice);
    }
}
