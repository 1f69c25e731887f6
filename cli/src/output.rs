//! Table and value formatting for CLI output.

use comfy_table::{ContentArrangement, Table};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Human-readable byte count ("1.5 MB").
pub fn format_bytes(bytes: u64) -> String {
    let units = [(GB, "GB"), (MB, "MB"), (KB, "KB")];
    for (size, unit) in units {
        if bytes >= size {
            return format!("{:.1} {}", bytes as f64 / size as f64, unit);
        }
    }
    format!("{} B", bytes)
}

/// `sha256:` plus the first 12 hex characters.
pub fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    format!("sha256:{}", &hex[..hex.len().min(12)])
}

/// Relative age of a timestamp ("3 hours ago").
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let elapsed = chrono::Utc::now().signed_duration_since(*dt);
    let secs = elapsed.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    let days = elapsed.num_days();
    let (value, unit) = if secs < 60 {
        (secs, "seconds")
    } else if secs < 3600 {
        (elapsed.num_minutes(), "minutes")
    } else if days < 1 {
        (elapsed.num_hours(), "hours")
    } else if days < 30 {
        (days, "days")
    } else if days < 365 {
        (days / 30, "months")
    } else {
        (days / 365, "years")
    };
    format!("{value} {unit} ago")
}

/// Parse a size like "500m" or "2GB" into bytes.
///
/// Suffixes are case-insensitive: `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`,
/// `t`/`tb`. No suffix means bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, suffix) = s.split_at(digits_end);
    let multiplier = match suffix {
        "" | "b" => 1,
        "k" | "kb" => KB,
        "m" | "mb" => MB,
        "g" | "gb" => GB,
        "t" | "tb" => TB,
        _ => return Err(format!("invalid size value: {s}")),
    };
    let num: u64 = num.parse().map_err(|_| format!("invalid size value: {s}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size value too large: {s}"))
}
