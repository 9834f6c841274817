use log::info;
use url::Url;

use crate::errors::Result;

/// Generates a unique ID for downloads
pub fn generate_download_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sanitizes a filename by removing invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Display name for a source URL: its last non-empty path segment,
/// sanitized for filesystem use. Falls back to "download" for URLs
/// without a usable path.
pub fn display_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .map(sanitize_filename)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_uses_last_path_segment() {
        let url = Url::parse("https://example.test/apps/app.ipa").unwrap();
        assert_eq!(display_name_for(&url), "app.ipa");
    }

    #[test]
    fn display_name_skips_trailing_slash() {
        let url = Url::parse("https://example.test/apps/").unwrap();
        assert_eq!(display_name_for(&url), "apps");
    }

    #[test]
    fn display_name_falls_back_for_bare_host() {
        let url = Url::parse("https://example.test/").unwrap();
        assert_eq!(display_name_for(&url), "download");
    }

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_filename("a/b:c?d.ipa"), "a_b_c_d.ipa");
        assert_eq!(sanitize_filename("plain.zip"), "plain.zip");
    }
}
