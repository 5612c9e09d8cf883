use std::time::Duration;

use super::loss_percent;

/// Formats bits per second as `Nbps`, `N.NNkbps` or `N.NNmbps`. The unit is
/// picked after rounding, so no value prints as `1000` of a smaller unit.
pub fn format_bitrate(bps: f64) -> String {
    if bps < 999.5 {
        format!("{bps:.0}bps")
    } else if bps < 999_995.0 {
        format!("{:.2}kbps", bps / 1000.0)
    } else {
        format!("{:.2}mbps", bps / 1_000_000.0)
    }
}

/// Formats a percentage with up to two decimals and no trailing zeros.
pub fn format_percent(percent: f64) -> String {
    let s = format!("{percent:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    format!("{s}%")
}

/// Formats loss as `count (P%)`.
pub fn format_loss(dropped: u64, packets: u64) -> String {
    format!(
        "{} ({})",
        dropped,
        format_percent(loss_percent(dropped, packets))
    )
}

/// Formats a mean latency rounded to microseconds, `-` without samples.
pub fn format_latency(latency: Option<Duration>) -> String {
    match latency {
        Some(latency) => format!("{:?}", Duration::from_micros(latency.as_micros() as u64)),
        None => "-".to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(0.0), "0bps");
        assert_eq!(format_bitrate(999.4), "999bps");
        assert_eq!(format_bitrate(999.7), "1.00kbps");
        assert_eq!(format_bitrate(999_994.0), "999.99kbps");
        assert_eq!(format_bitrate(999_996.0), "1.00mbps");
        assert_eq!(format_bitrate(24_000.0), "24.00kbps");
        assert_eq!(format_bitrate(1_534_000.0), "1.53mbps");
    }

    #[test]
    fn test_format_loss() {
        assert_eq!(format_loss(0, 100), "0 (0%)");
        assert_eq!(format_loss(1, 199), "1 (0.5%)");
        assert_eq!(format_loss(1, 2), "1 (33.33%)");
        assert_eq!(format_loss(10, 0), "10 (100%)");
        assert_eq!(format_loss(0, 0), "0 (0%)");
    }

    #[test]
    fn test_format_latency() {
        assert_eq!(format_latency(None), "-");
        assert_eq!(
            format_latency(Some(Duration::from_nanos(23_456_789))),
            "23.456ms"
        );
    }
}
