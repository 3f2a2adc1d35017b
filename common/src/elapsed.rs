use chrono::DateTime;
use chrono::Utc;

/// Format the time elapsed since `start_time` for the `LETTA_DEBUG_TIMINGS`
/// turn-duration log line.
pub fn format_elapsed(start_time: DateTime<Utc>) -> String {
    let millis = Utc::now().signed_duration_since(start_time).num_milliseconds();
    format_elapsed_millis(millis)
}

pub fn format_duration(duration: std::time::Duration) -> String {
    format_elapsed_millis(duration.as_millis() as i64)
}

fn format_elapsed_millis(millis: i64) -> String {
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.2}s", millis as f64 / 1000.0)
    } else {
        let minutes = millis / 60_000;
        let seconds = (millis % 60_000) / 1000;
        format!("{minutes}m{seconds:02}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_subsecond_millis() {
        assert_eq!(format_elapsed_millis(250), "250ms");
    }

    #[test]
    fn formats_seconds_with_two_decimals() {
        assert_eq!(format_elapsed_millis(1500), "1.50s");
        assert_eq!(format_elapsed_millis(59_999), "60.00s");
    }

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_elapsed_millis(60_000), "1m00s");
        assert_eq!(format_elapsed_millis(125_000), "2m05s");
    }
}
