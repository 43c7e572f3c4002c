//! Terminal formatting utilities for star-crawler
//!
//! Provides hyperlinks, star counts and wait durations.

use std::time::Duration;

/// Format repo name as clickable hyperlink (only if stderr is a TTY)
pub fn format_repo_link(name: &str, url: &str) -> String {
    use std::io::IsTerminal;
    if std::io::stderr().is_terminal() {
        // OSC 8 hyperlink: \x1b]8;;URL\x1b\\TEXT\x1b]8;;\x1b\\
        format!("\x1b]8;;{}\x1b\\\x1b[1m{}\x1b[0m\x1b]8;;\x1b\\", url, name)
    } else {
        name.to_string()
    }
}

/// Format star count (e.g., 1.2k, 15k)
pub fn format_stars(stars: u64) -> String {
    if stars >= 1_000_000 {
        format!("{:.1}M", stars as f64 / 1_000_000.0)
    } else if stars >= 1000 {
        format!("{}k", stars / 1000)
    } else {
        format!("{}", stars)
    }
}

/// Format a wait as `XmYs` (or `Ys` under a minute)
pub fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    let (mins, rem) = (secs / 60, secs % 60);
    if mins > 0 {
        format!("{}m{}s", mins, rem)
    } else {
        format!("{}s", rem)
    }
}
