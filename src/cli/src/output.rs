//! Table and value formatting for CLI output.

use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table};
use kiln_engine::{Digest, ImageReference};

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a timestamp as a relative "ago" string.
pub fn format_ago(dt: &DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }

    let months = days / 30;
    if months < 12 {
        return format!("{months} months ago");
    }

    format!("{} years ago", days / 365)
}

/// Cut `s` to `max_len` characters, marking the cut with `...`.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Image id column: 12 hex digits, or the full digest with `no_trunc`.
pub fn image_id(id: &Digest, no_trunc: bool) -> String {
    if no_trunc {
        id.to_string()
    } else {
        id.short().to_string()
    }
}

/// Split a stored image name into its REPOSITORY and TAG columns.
pub fn repository_and_tag(name: &str) -> (String, String) {
    if name.starts_with("oci:") || name.starts_with("oci-archive:") {
        return (name.to_string(), "<none>".to_string());
    }
    match ImageReference::parse(name) {
        Ok(reference) => {
            let bare = ImageReference {
                tag: None,
                digest: None,
                ..reference.clone()
            };
            let tag = reference.tag.unwrap_or_else(|| "<none>".to_string());
            (bare.familiar(), tag)
        }
        Err(_) => (name.to_string(), "<none>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_zero() {
        assert_eq!(format_bytes(0), "0 B");
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["REPOSITORY", "TAG"]);
        table.add_row(["app", "1"]);
        let rendered = table.to_string();
        assert!(rendered.contains("REPOSITORY"));
        assert!(rendered.contains("app"));
    }

    #[test]
    fn test_format_ago() {
        let now = Utc::now();
        assert!(format_ago(&(now - chrono::Duration::seconds(5))).contains("seconds ago"));
        assert_eq!(format_ago(&(now - chrono::Duration::minutes(3))), "3 minutes ago");
        assert_eq!(format_ago(&(now - chrono::Duration::hours(2))), "2 hours ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(4))), "4 days ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(65))), "2 months ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(800))), "2 years ago");
        assert_eq!(format_ago(&(now + chrono::Duration::hours(1))), "just now");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 5), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("hello world", 3), "...");
    }

    #[test]
    fn test_repository_and_tag() {
        let (repo, tag) = repository_and_tag("docker.io/library/alpine:3.19");
        assert_eq!(repo, "alpine");
        assert_eq!(tag, "3.19");

        let (repo, tag) = repository_and_tag("ghcr.io/org/app:v1");
        assert_eq!(repo, "ghcr.io/org/app");
        assert_eq!(tag, "v1");
    }
}
