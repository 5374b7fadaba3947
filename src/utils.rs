use std::time::Duration;

/// Formats a duration as an ISO 8601 duration string, e.g. "PT1M30.25S".
///
/// Hours and minutes are only emitted when non-zero; seconds are always
/// present so that `Duration::ZERO` renders as "PT0S".
pub fn format_iso8601_duration(d: Duration) -> String {
    // Integer millisecond arithmetic keeps rounding from ever producing a
    // "60S" component.
    let total_ms = d.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    if millis > 0 {
        // Trim trailing zeros so 1.500s renders as "PT1.5S".
        let frac = format!("{:03}", millis);
        let frac = frac.trim_end_matches('0');
        out.push_str(&format!("{}.{}S", seconds, frac));
    } else if seconds > 0 || (hours == 0 && minutes == 0) {
        out.push_str(&format!("{}S", seconds));
    }
    out
}

/// Parses an ISO 8601 duration string such as "PT9.853S" or "PT2H5M1S".
///
/// Only time components (H/M/S) are supported; date components are not
/// meaningful for a benchmark run.
pub fn parse_iso8601_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let rest = s
        .strip_prefix("PT")
        .or_else(|| s.strip_prefix("pt"))
        .ok_or_else(|| format!("invalid ISO 8601 duration '{}': missing PT prefix", s))?;

    if rest.is_empty() {
        return Err(format!("invalid ISO 8601 duration '{}': no components", s));
    }

    let mut total = 0.0f64;
    let mut num = String::new();
    for ch in rest.chars() {
        match ch {
            '0'..='9' | '.' => num.push(ch),
            'H' | 'h' | 'M' | 'm' | 'S' | 's' => {
                let value: f64 = num
                    .parse()
                    .map_err(|_| format!("invalid numeric value '{}' in duration '{}'", num, s))?;
                num.clear();
                total += match ch.to_ascii_uppercase() {
                    'H' => value * 3600.0,
                    'M' => value * 60.0,
                    _ => value,
                };
            }
            _ => return Err(format!("unexpected character '{}' in duration '{}'", ch, s)),
        }
    }
    if !num.is_empty() {
        return Err(format!("dangling number '{}' in duration '{}'", num, s));
    }

    Ok(Duration::from_secs_f64(total))
}
