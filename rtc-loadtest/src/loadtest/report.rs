use std::io::{self, Write};

use crate::stats::format::{format_bitrate, format_latency, format_loss};
use crate::stats::table::Table;
use crate::stats::{TestSummary, TesterStats, TesterSummary};

/// Writes one block per tester with a row per received track, ordered by
/// track name.
pub fn write_tester_stats<W: Write + ?Sized>(w: &mut W, stats: &TesterStats) -> io::Result<()> {
    writeln!(w, "\n{}:", stats.name)?;
    let mut table = Table::new(&["Track", "Pkts", "Bitrate", "Latency", "Dropped"]);
    for track in stats.tracks_by_name() {
        table.add_row(vec![
            format!("{} ({})", track.name, track.kind),
            track.packets.to_string(),
            format_bitrate(track.bitrate),
            format_latency(track.mean_latency()),
            format_loss(track.dropped, track.packets),
        ]);
    }
    table.render(w)
}

fn summary_row(name: &str, tester: &TesterSummary) -> Vec<String> {
    vec![
        name.to_owned(),
        format!("{}/{}", tester.tracks, tester.expected_tracks),
        format!(
            "{} ({} avg)",
            format_bitrate(tester.bitrate),
            format_bitrate(tester.track_bitrate())
        ),
        format_latency(tester.mean_latency()),
        format_loss(tester.dropped, tester.packets),
    ]
}

/// Writes the summary table, one row per tester and a `Total` row.
pub fn write_summary<W: Write + ?Sized>(
    w: &mut W,
    testers: &[TesterSummary],
    total: &TestSummary,
) -> io::Result<()> {
    writeln!(w, "\nSummary:")?;
    let mut table = Table::new(&["Tester", "Tracks", "Bitrate", "Latency", "Dropped"]);
    for tester in testers {
        table.add_row(summary_row(&tester.name, tester));
    }

    let average = if total.tracks == 0 {
        0.0
    } else {
        total.bitrate / total.tracks as f64
    };
    table.set_footer(vec![
        "Total".to_owned(),
        format!("{}/{}", total.tracks, total.expected_tracks),
        format!(
            "{} ({} avg)",
            format_bitrate(total.bitrate),
            format_bitrate(average)
        ),
        format_latency(total.mean_latency()),
        format_loss(total.dropped, total.packets),
    ]);
    table.render(w)?;

    if !total.errors.is_empty() {
        writeln!(w, "\nErrors:")?;
        for (tester, error) in &total.errors {
            writeln!(w, "  {tester}: {error}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::client::TrackKind;
    use crate::stats::TrackSummary;

    fn track(id: &str, name: &str, packets: u64, dropped: u64) -> TrackSummary {
        TrackSummary {
            track_id: id.to_owned(),
            name: name.to_owned(),
            kind: TrackKind::Audio,
            packets,
            bytes: packets * 100,
            dropped,
            out_of_order: 0,
            dropped_samples: 0,
            latency_sum: Duration::from_millis(packets * 2),
            latency_count: packets,
            elapsed: Duration::from_secs(10),
            bitrate: packets as f64 * 80.0,
        }
    }

    fn tester(name: &str, tracks: &[TrackSummary]) -> TesterStats {
        TesterStats {
            name: name.to_owned(),
            expected_tracks: 2,
            tracks: tracks
                .iter()
                .map(|t| (t.track_id.clone(), t.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_tester_block_orders_tracks_by_name() {
        // track ids sort the other way round
        let stats = tester(
            "Sub 0",
            &[
                track("TR_a", "zzz_1-audio", 500, 0),
                track("TR_b", "aaa_0-audio", 500, 5),
            ],
        );
        let mut out = vec![];
        write_tester_stats(&mut out, &stats).unwrap();
        let out = String::from_utf8(out).unwrap();

        let first = out.find("aaa_0-audio").unwrap();
        let second = out.find("zzz_1-audio").unwrap();
        assert!(first < second);
        assert!(out.contains("Sub 0:"));
        assert!(out.contains("5 (0.99%)"));
        assert!(out.contains("2ms"));
    }

    #[test]
    fn test_summary_has_total_row() {
        let testers = [
            tester("Sub 0", &[track("TR_a", "a", 100, 0), track("TR_b", "b", 100, 0)]),
            tester("Sub 1", &[track("TR_a", "a", 100, 0)]),
            tester("Sub 2", &[]),
        ];
        let summaries: Vec<TesterSummary> = testers.iter().map(|t| t.summary()).collect();
        let total = TestSummary::from_testers(&summaries);
        assert_eq!(total.packets, 300);

        let mut out = vec![];
        write_summary(&mut out, &summaries, &total).unwrap();
        let out = String::from_utf8(out).unwrap();

        let rows: Vec<&str> = out.lines().filter(|l| l.starts_with("| ")).collect();
        // header, three testers and the total
        assert_eq!(rows.len(), 5);
        assert!(rows[4].starts_with("| Total"));
        assert!(rows[4].contains("3/6"));
        assert!(rows[3].contains("0/2"));
        assert!(rows[3].contains("0bps"));
        assert!(rows[3].contains(" - "));
    }
}
