//! Line parsing for list sources.
//!
//! Sources are plain text, one entry per line. `#` comments and blank lines
//! are skipped. Each remaining line keeps only its **last** whitespace field,
//! which handles both plain domain lists and hosts-file format
//! (`0.0.0.0 adserver.net`). IPs are normalized to their canonical string
//! form, everything else is lowercased.

use std::net::IpAddr;

/// Parses a whole source body into a sorted, deduplicated entry vector.
pub fn parse_list(text: &str) -> Vec<String> {
    let mut entries: Vec<String> = text.lines().filter_map(parse_line).collect();
    entries.sort();
    entries.dedup();
    entries
}

fn parse_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let token = line.split_whitespace().next_back()?;

    match token.parse::<IpAddr>() {
        Ok(ip) => Some(ip.to_string()),
        Err(_) => Some(token.to_lowercase()),
    }
}
