//! Upstream post model.

use serde::{Deserialize, Serialize};

/// Content rating attached to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    /// General
    #[default]
    G,
    /// Sensitive
    S,
    /// Questionable
    Q,
    /// Explicit
    E,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::G => "g",
            Rating::S => "s",
            Rating::Q => "q",
            Rating::E => "e",
        }
    }

    /// Parse the single-letter rating used by the upstream API.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "g" => Some(Rating::G),
            "s" => Some(Rating::S),
            "q" => Some(Rating::Q),
            "e" => Some(Rating::E),
            _ => None,
        }
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A post as returned by the upstream provider's `/posts.json` endpoint.
///
/// Only the fields the gateway republishes are modeled; unknown fields are
/// ignored on deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub large_file_url: Option<String>,
    #[serde(default)]
    pub preview_file_url: Option<String>,
    #[serde(default)]
    pub tag_string_general: Option<String>,
    #[serde(default)]
    pub tag_string_artist: Option<String>,
    #[serde(default)]
    pub tag_string_character: Option<String>,
    #[serde(default)]
    pub tag_string_copyright: Option<String>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl Post {
    /// Best available image URL: full file, then resized, then preview.
    pub fn image_url(&self) -> Option<&str> {
        self.file_url
            .as_deref()
            .or(self.large_file_url.as_deref())
            .or(self.preview_file_url.as_deref())
            .filter(|url| !url.is_empty())
    }

    /// Split a space-separated tag string into owned tags.
    pub fn split_tags(raw: Option<&str>) -> Vec<String> {
        raw.unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_parse_and_display() {
        assert_eq!(Rating::parse("s"), Some(Rating::S));
        assert_eq!(Rating::parse("x"), None);
        assert_eq!(Rating::E.to_string(), "e");
    }

    #[test]
    fn image_url_prefers_full_file() {
        let post = Post {
            id: 1,
            file_url: Some("https://example.com/full.jpg".to_string()),
            large_file_url: Some("https://example.com/large.jpg".to_string()),
            ..Default::default()
        };
        assert_eq!(post.image_url(), Some("https://example.com/full.jpg"));
    }

    #[test]
    fn image_url_skips_empty_strings() {
        let post = Post {
            id: 1,
            file_url: Some(String::new()),
            preview_file_url: Some("https://example.com/preview.jpg".to_string()),
            ..Default::default()
        };
        assert_eq!(post.image_url(), Some("https://example.com/preview.jpg"));
    }

    #[test]
    fn split_tags_handles_none() {
        assert!(Post::split_tags(None).is_empty());
        assert_eq!(
            Post::split_tags(Some("1girl  long_hair")),
            vec!["1girl".to_string(), "long_hair".to_string()]
        );
    }
}
