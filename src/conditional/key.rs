//! Resource key normalization.

/// Reduce a URL or path to the key its validators are stored under.
///
/// Strips scheme and host, the query string and fragment, a leading
/// `api` segment and API version (`v1`, `v2`, ...), surrounding slashes,
/// and lowercases the rest. Pagination and filter variants of one list
/// endpoint therefore share a single key.
pub fn normalize_resource_key(url_or_path: &str) -> String {
  let path = match url::Url::parse(url_or_path) {
    Ok(url) if url.has_host() => url.path().to_string(),
    _ => url_or_path.to_string(),
  };

  let path = path
    .split(['?', '#'])
    .next()
    .unwrap_or_default()
    .to_lowercase();

  let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
  if segments.peek() == Some(&"api") {
    segments.next();
  }
  if segments.peek().is_some_and(|s| is_version_segment(s)) {
    segments.next();
  }

  segments.collect::<Vec<_>>().join("/")
}

/// `v` followed by one or more digits.
fn is_version_segment(segment: &str) -> bool {
  segment
    .strip_prefix('v')
    .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_query_and_version_variants_share_a_key() {
    assert_eq!(normalize_resource_key("/api/v1/diseases?page=2"), "diseases");
    assert_eq!(normalize_resource_key("diseases"), "diseases");
    assert_eq!(
      normalize_resource_key("/api/v1/diseases?page=2"),
      normalize_resource_key("diseases")
    );
  }

  #[test]
  fn test_absolute_urls() {
    assert_eq!(
      normalize_resource_key("https://example.org/api/v2/Diseases/42?expand=true#top"),
      "diseases/42"
    );
  }

  #[test]
  fn test_trailing_and_doubled_separators() {
    assert_eq!(normalize_resource_key("/v3/Patients//7/"), "patients/7");
    assert_eq!(normalize_resource_key("api/users/"), "users");
  }

  #[test]
  fn test_version_like_resources_are_kept() {
    assert_eq!(normalize_resource_key("/api/videos"), "videos");
    assert_eq!(normalize_resource_key("/api/v/items"), "v/items");
  }

  #[test]
  fn test_empty_path() {
    assert_eq!(normalize_resource_key(""), "");
    assert_eq!(normalize_resource_key("/?q=1"), "");
  }
}
