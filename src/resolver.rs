//! Maps a request path onto a backend object key.
//!
//! The URL path and the backend key are the same string, so anything that
//! could climb out of the bucket namespace is rejected here, before the
//! cache or the backend ever sees it.

use std::fmt;

use percent_encoding::percent_decode_str;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("object name is required")]
    Empty,
    #[error("path must not contain parent directory segments")]
    Traversal,
    #[error("path is not valid utf-8 after decoding")]
    Encoding,
}

/// Normalized object key. Construct it through [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn resolve(path: &str) -> Result<CacheKey, ResolveError> {
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| ResolveError::Encoding)?;
    let key = decoded.strip_prefix('/').unwrap_or(&*decoded);
    if key.is_empty() {
        return Err(ResolveError::Empty);
    }
    if key.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(ResolveError::Traversal);
    }
    Ok(CacheKey(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_slash() {
        assert_eq!(resolve("/img/logo.png").unwrap().as_str(), "img/logo.png");
        assert_eq!(resolve("/a").unwrap().as_str(), "a");
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(resolve("/"), Err(ResolveError::Empty));
        assert_eq!(resolve(""), Err(ResolveError::Empty));
    }

    #[test]
    fn rejects_traversal() {
        assert_eq!(resolve("/../secret"), Err(ResolveError::Traversal));
        assert_eq!(resolve("/a/../../b"), Err(ResolveError::Traversal));
        assert_eq!(resolve("/a/.."), Err(ResolveError::Traversal));
        assert_eq!(resolve("/a\\..\\b"), Err(ResolveError::Traversal));
    }

    #[test]
    fn rejects_encoded_traversal() {
        assert_eq!(resolve("/%2e%2e/secret"), Err(ResolveError::Traversal));
        assert_eq!(resolve("/a%2F..%2Fb"), Err(ResolveError::Traversal));
    }

    #[test]
    fn keeps_dotted_names() {
        assert_eq!(resolve("/..hidden").unwrap().as_str(), "..hidden");
        assert_eq!(resolve("/v1.2/app.js").unwrap().as_str(), "v1.2/app.js");
    }

    #[test]
    fn decodes_percent_escapes() {
        assert_eq!(resolve("/hello%20world.txt").unwrap().as_str(), "hello world.txt");
        assert_eq!(resolve("/%FF"), Err(ResolveError::Encoding));
    }
}
