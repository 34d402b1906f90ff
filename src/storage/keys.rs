//! Object key and public URL helpers shared by every provider adapter.
//!
//! Key mapping:
//!   Objects:  `{prefix}/{key}` with leading slashes stripped from `key`
//!             and surrounding slashes stripped from `prefix`.
//!   Listing:  `{prefix}/` is stripped back off every returned name, so a
//!             listed key is always a valid input to get/delete.

/// Join the configured prefix and a caller key into a provider object name.
pub fn normalize_key(prefix: Option<&str>, key: &str) -> String {
    let key = key.trim_start_matches('/');
    let prefix = prefix.map(|p| p.trim_matches('/')).unwrap_or("");
    if prefix.is_empty() {
        return key.to_string();
    }
    if key.is_empty() {
        return prefix.to_string();
    }
    format!("{prefix}/{key}")
}

/// Provider-side prefix for listing under the caller's `prefix`.
///
/// An empty caller prefix lists the whole configured directory, so the
/// trailing `/` keeps sibling prefixes (`media2/...`) out of the result.
pub fn list_prefix(prefix: Option<&str>, caller_prefix: Option<&str>) -> String {
    let object_prefix = normalize_key(prefix, caller_prefix.unwrap_or(""));
    let caller_empty = caller_prefix.map_or(true, |p| p.trim_start_matches('/').is_empty());
    if caller_empty && !object_prefix.is_empty() {
        format!("{object_prefix}/")
    } else {
        object_prefix
    }
}

/// Inverse of [`normalize_key`] for names returned by a listing.
///
/// Names outside the prefix are returned with leading slashes stripped.
pub fn strip_prefix(prefix: Option<&str>, name: &str) -> String {
    let name = name.trim_start_matches('/');
    let prefix = prefix.map(|p| p.trim_matches('/')).unwrap_or("");
    if prefix.is_empty() {
        return name.to_string();
    }
    if name == prefix {
        return String::new();
    }
    match name.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) => rest.to_string(),
        None => name.to_string(),
    }
}

/// Drop trailing slashes; empty input means "no public URL".
pub fn normalize_public_base_url(value: Option<&str>) -> Option<String> {
    let value = value?;
    if value.is_empty() {
        return None;
    }
    Some(value.trim_end_matches('/').to_string())
}

/// `{base}/{object_key}`, or `None` when no base URL is configured.
pub fn build_public_url(base_url: Option<&str>, object_key: &str) -> Option<String> {
    let base = normalize_public_base_url(base_url)?;
    Some(format!("{}/{}", base, object_key.trim_start_matches('/')))
}

/// True for `http://` and `https://` URLs (case-insensitive scheme).
pub fn is_url(value: &str) -> bool {
    let lower = value
        .get(..8)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| value.to_ascii_lowercase());
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key(Some("media/"), "/photos/a.jpg"), "media/photos/a.jpg");
        assert_eq!(normalize_key(Some("/media"), "a.jpg"), "media/a.jpg");
        assert_eq!(normalize_key(None, "//a.jpg"), "a.jpg");
        assert_eq!(normalize_key(Some(""), "a.jpg"), "a.jpg");
        assert_eq!(normalize_key(Some("media"), ""), "media");
        assert_eq!(normalize_key(Some("///"), "a"), "a");
    }

    #[test]
    fn test_list_prefix() {
        assert_eq!(list_prefix(Some("media"), None), "media/");
        assert_eq!(list_prefix(Some("media"), Some("/")), "media/");
        assert_eq!(list_prefix(Some("media"), Some("photos/")), "media/photos/");
        assert_eq!(list_prefix(Some("media"), Some("ph")), "media/ph");
        assert_eq!(list_prefix(None, None), "");
        assert_eq!(list_prefix(None, Some("ph")), "ph");
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix(Some("media"), "media/photos/a.jpg"), "photos/a.jpg");
        assert_eq!(strip_prefix(Some("/media/"), "/media/a.jpg"), "a.jpg");
        assert_eq!(strip_prefix(Some("media"), "media"), "");
        assert_eq!(strip_prefix(Some("media"), "mediafile.jpg"), "mediafile.jpg");
        assert_eq!(strip_prefix(Some("media"), "other/a.jpg"), "other/a.jpg");
        assert_eq!(strip_prefix(None, "/a.jpg"), "a.jpg");
    }

    #[test]
    fn test_key_round_trip() {
        let prefixes = [None, Some(""), Some("media"), Some("/media/"), Some("a/b")];
        let keys = ["a.jpg", "/a.jpg", "dir/sub/file.txt", "//lead", "media/nested"];
        for prefix in prefixes {
            for key in keys {
                let object_key = normalize_key(prefix, key);
                assert_eq!(
                    strip_prefix(prefix, &object_key),
                    key.trim_start_matches('/'),
                    "prefix={prefix:?} key={key}"
                );
            }
        }
    }

    #[test]
    fn test_public_urls() {
        assert_eq!(normalize_public_base_url(Some("https://cdn.example.com///")).as_deref(), Some("https://cdn.example.com"));
        assert_eq!(normalize_public_base_url(Some("")), None);
        assert_eq!(normalize_public_base_url(None), None);
        assert_eq!(
            build_public_url(Some("https://cdn.example.com/"), "/media/a.jpg").as_deref(),
            Some("https://cdn.example.com/media/a.jpg")
        );
        assert_eq!(build_public_url(None, "a.jpg"), None);
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://x.public.blob.vercel-storage.com/a.jpg"));
        assert!(is_url("HTTP://example.com"));
        assert!(!is_url("media/a.jpg"));
        assert!(!is_url("http"));
    }
}
