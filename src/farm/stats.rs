use std::time::Duration;

const MAX_DISPLAY_FRACTION_DIGITS: usize = 4;

/// Renders an on-chain base-unit amount as a token figure, e.g. `1_050_000_000` with 8
/// decimals becomes `10.5`.
pub fn format_tokens(base_units: u64, decimals: u32) -> String {
    if decimals == 0 {
        return base_units.to_string();
    }
    let scale = 10u128.pow(decimals.min(38));
    let value = u128::from(base_units);
    let whole = value / scale;
    let fraction = value % scale;
    if fraction == 0 {
        return whole.to_string();
    }

    let mut digits = format!("{fraction:0width$}", width = decimals as usize);
    digits.truncate(MAX_DISPLAY_FRACTION_DIGITS.min(digits.len()));
    let trimmed = digits.trim_end_matches('0');
    if trimmed.is_empty() {
        return format!("{whole}");
    }
    format!("{whole}.{trimmed}")
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        return format!("{hours}h {minutes:02}m");
    }
    if minutes > 0 {
        return format!("{minutes}m {seconds:02}s");
    }
    format!("{seconds}s")
}
