//! Response sanitization.
//!
//! Upstream string fields are republished to clients verbatim, so markup and
//! control characters are stripped before anything leaves this crate.

use std::sync::LazyLock;

use regex::Regex;

use booru_models::Post;

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Strip HTML tags and control characters from a user-visible string.
pub fn sanitize_text(input: &str) -> String {
    let without_tags = HTML_TAG.replace_all(input, "");
    without_tags
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn sanitize_field(field: &mut Option<String>) {
    if let Some(value) = field {
        let clean = sanitize_text(value);
        if clean.is_empty() {
            *field = None;
        } else {
            *value = clean;
        }
    }
}

/// Sanitize every string field of an upstream post in place.
pub fn sanitize_post(post: &mut Post) {
    sanitize_field(&mut post.file_url);
    sanitize_field(&mut post.large_file_url);
    sanitize_field(&mut post.preview_file_url);
    sanitize_field(&mut post.tag_string_general);
    sanitize_field(&mut post.tag_string_artist);
    sanitize_field(&mut post.tag_string_character);
    sanitize_field(&mut post.tag_string_copyright);
    sanitize_field(&mut post.rating);
    sanitize_field(&mut post.source);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_tags() {
        assert_eq!(
            sanitize_text("artist<script>alert(1)</script>_name"),
            "artistalert(1)_name"
        );
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(sanitize_text("tag\u{0000}one\ntag_two"), "tagonetag_two");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(sanitize_text("hatsune_miku 1girl"), "hatsune_miku 1girl");
    }

    #[test]
    fn sanitize_post_clears_emptied_fields() {
        let mut post = Post {
            id: 1,
            tag_string_artist: Some("<b></b>".to_string()),
            source: Some("https://example.com/<i>page</i>".to_string()),
            ..Default::default()
        };
        sanitize_post(&mut post);
        assert_eq!(post.tag_string_artist, None);
        assert_eq!(post.source.as_deref(), Some("https://example.com/page"));
    }
}
