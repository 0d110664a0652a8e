//! Small shared helpers.

use std::time::Duration;

/// Host portion of a URL, lowercased. Returns `None` for unparseable input.
pub fn domain_of(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

/// True when `host` equals `suffix` or is a subdomain of it.
pub fn host_matches(host: &str, suffix: &str) -> bool {
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

/// Add up to `fraction` (0.0..1.0) of random jitter on top of a duration.
pub fn with_jitter(base: Duration, fraction: f64) -> Duration {
    let jitter = base.as_secs_f64() * fraction * fastrand::f64();
    base + Duration::from_secs_f64(jitter)
}

/// Human-readable size for display labels.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Parse sizes like "1.4GB" / "700 MB" out of provider labels.
pub fn parse_size(label: &str) -> Option<u64> {
    let lower = label.to_lowercase();
    let re = regex::Regex::new(r"([\d.]+)\s*(tb|gb|mb|kb)").ok()?;
    let caps = re.captures(&lower)?;
    let value: f64 = caps[1].parse().ok()?;
    let multiplier: u64 = match &caps[2] {
        "tb" => 1 << 40,
        "gb" => 1 << 30,
        "mb" => 1 << 20,
        _ => 1 << 10,
    };
    Some((value * multiplier as f64) as u64)
}

/// Truncate a body snippet for parse-failure logs.
pub fn snippet(body: &str, max: usize) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= max {
        trimmed.to_string()
    } else {
        let mut cut = max;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &trimmed[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains() {
        assert_eq!(
            domain_of("https://New.GDFLIX.dad/file/1").as_deref(),
            Some("new.gdflix.dad")
        );
        assert_eq!(domain_of("not a url"), None);
        assert!(host_matches("cdn.workers.dev", "workers.dev"));
        assert!(host_matches("workers.dev", "workers.dev"));
        assert!(!host_matches("evil-workers.dev", "workers.dev"));
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("Download [1080p] 1.4GB"), Some((1.4 * (1u64 << 30) as f64) as u64));
        assert_eq!(parse_size("700 MB x265"), Some(700 * (1 << 20)));
        assert_eq!(parse_size("no size here"), None);
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.50 KB");
    }

    #[test]
    fn snippets() {
        assert_eq!(snippet("  short  ", 64), "short");
        let long = "x".repeat(100);
        let cut = snippet(&long, 10);
        assert!(cut.starts_with("xxxxxxxxxx"));
        assert!(cut.ends_with('…'));
    }
}
