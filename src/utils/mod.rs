//! Shared utility functions for sentiment-forge.

pub mod rate_limit;

use std::time::Duration;

pub use rate_limit::WindowRateLimiter;

/// Human-readable duration: `1.5s`, `2m 3.0s`, `1h 2m 3.0s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0).floor() as u64;
    let minutes = ((total % 3600.0) / 60.0).floor() as u64;
    let seconds = total % 60.0;

    if hours > 0 {
        format!("{}h {}m {:.1}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:.1}s", minutes, seconds)
    } else {
        format!("{:.1}s", seconds)
    }
}

/// Bytes to megabytes (1 MB = 1024 * 1024 bytes).
pub fn bytes_to_mb(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
