use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::scheduler::{Invocation, InvocationGroup, ResultLine};

/// Width of the CPU / Instructions / CacheMisses / BranchMisses cells.
pub const CELL_WIDTH: usize = 23;
/// Width of the IPC cell; the identity column trailing it is not padded.
pub const IPC_WIDTH: usize = 16;
/// Width of the whole value region a `Running (Ns)` marker spans.
pub const VALUE_WIDTH: usize = 4 * CELL_WIDTH + IPC_WIDTH;

const ERASE_LINE: &str = "\x1b[K";

/// Format the fixed-width value region of one finalized row.
pub fn value_region(cells: &[String; 4], ipc: &str) -> String {
    format!(
        "{:<cell$}{:<cell$}{:<cell$}{:<cell$}{:<ipc$}",
        cells[0],
        cells[1],
        cells[2],
        cells[3],
        ipc,
        cell = CELL_WIDTH,
        ipc = IPC_WIDTH
    )
}

fn column_header() -> String {
    format!(
        "{:<cell$}{:<cell$}{:<cell$}{:<cell$}{:<ipc$}{}",
        "CPU",
        "Instructions",
        "CacheMisses",
        "BranchMisses",
        "IPC",
        "Benchmark",
        cell = CELL_WIDTH,
        ipc = IPC_WIDTH
    )
}

fn region_for(invocation: &Invocation, line: &ResultLine, now: DateTime<Utc>) -> String {
    if let Some(value) = &line.value {
        return value.clone();
    }
    match invocation.started_at {
        Some(started) if invocation.finished_at.is_none() => {
            let seconds = (now - started).num_seconds().max(0);
            format!("{:<width$}", format!("Running ({seconds}s)"), width = VALUE_WIDTH)
        }
        _ => " ".repeat(VALUE_WIDTH),
    }
}

/// Repaint the whole table in place. Moves the cursor up over the previous
/// frame (`scrollback` lines), erases each line before rewriting it, and
/// returns the number of lines printed so the next frame knows how far to
/// move back up. Groups and rows always render in matrix order.
pub fn repaint(
    out: &mut impl Write,
    groups: &[InvocationGroup],
    invocations: &[Invocation],
    scrollback: usize,
    now: DateTime<Utc>,
) -> Result<usize> {
    if scrollback > 0 {
        write!(out, "\x1b[{scrollback}A")?;
    }
    let mut printed = 0;
    for group in groups {
        writeln!(
            out,
            "{ERASE_LINE}=== {} ({}) ===",
            group.target.label, group.feature.name
        )?;
        writeln!(out, "{ERASE_LINE}{}", column_header())?;
        printed += 2;
        for &index in &group.members {
            let invocation = &invocations[index];
            for line in &invocation.lines {
                writeln!(
                    out,
                    "{ERASE_LINE}{}{}",
                    region_for(invocation, line, now),
                    line.header
                )?;
                printed += 1;
            }
        }
    }
    out.flush()?;
    Ok(printed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, InvocationParams};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn fixture() -> (Vec<InvocationGroup>, Vec<Invocation>) {
        let catalog = Catalog::builtin();
        let target = catalog.targets[1].clone(); // single-benchmark target
        let feature = catalog.features[0].clone();
        let cpu = catalog.cpus[0].clone();
        let params = InvocationParams {
            reference: "srcfs".into(),
            target: target.clone(),
            cpu: cpu.clone(),
            feature: feature.clone(),
        };
        let lines = target
            .benchmarks
            .iter()
            .map(|benchmark| ResultLine {
                benchmark: benchmark.clone(),
                header: format!("{} ({})", benchmark.short_name, cpu.name),
                value: None,
            })
            .collect();
        let invocation = Invocation {
            params,
            device: cpu.device.clone(),
            serial: Some("SERIAL".into()),
            output_path: PathBuf::from("/tmp/out.txt"),
            scratch_dir: PathBuf::from("/tmp/scratch"),
            started_at: None,
            finished_at: None,
            raw_output: None,
            lines,
        };
        let group = InvocationGroup {
            target,
            feature,
            members: vec![0],
        };
        (vec![group], vec![invocation])
    }

    #[test]
    fn first_frame_has_no_cursor_movement() {
        let (groups, invocations) = fixture();
        let mut out = Vec::new();
        let printed = repaint(&mut out, &groups, &invocations, 0, Utc::now()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let has_cursor_up = text
            .match_indices("\x1b[")
            .any(|(at, _)| text[at + 2..].chars().next().is_some_and(|c| c.is_ascii_digit()));
        assert!(!has_cursor_up, "unexpected cursor-up: {text:?}");
        assert_eq!(printed, 3); // banner + header + one row
        assert!(text.contains("=== //benchmarks:serialize_descriptor (default) ==="));
    }

    #[test]
    fn later_frames_move_up_by_the_previous_count() {
        let (groups, invocations) = fixture();
        let mut out = Vec::new();
        let printed = repaint(&mut out, &groups, &invocations, 0, Utc::now()).unwrap();
        out.clear();
        repaint(&mut out, &groups, &invocations, printed, Utc::now()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("\x1b[3A"));
        assert!(text.contains("\x1b[K"));
    }

    #[test]
    fn running_rows_show_elapsed_seconds() {
        let (groups, mut invocations) = fixture();
        let started = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 12).unwrap();
        invocations[0].started_at = Some(started);
        let mut out = Vec::new();
        repaint(&mut out, &groups, &invocations, 0, now).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Running (12s)"));
        assert!(text.contains("Serialize (P9a_big)"));
    }

    #[test]
    fn finalized_rows_use_the_stored_value_region() {
        let (groups, mut invocations) = fixture();
        let cells = [
            "10.0µs ± 2% -5.66%".to_string(),
            "112M ± 0% -0.88%".to_string(),
            "1.1M ± 4% +2.00%".to_string(),
            "801k ± 1% ~".to_string(),
        ];
        let region = value_region(&cells, "3.46 (-1.20%)");
        invocations[0].started_at = Some(Utc::now());
        invocations[0].finished_at = Some(Utc::now());
        invocations[0].lines[0].value = Some(region.clone());
        let mut out = Vec::new();
        repaint(&mut out, &groups, &invocations, 0, Utc::now()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("{region}Serialize (P9a_big)")));
    }

    #[test]
    fn value_region_pads_every_cell() {
        let cells = [
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "d".to_string(),
        ];
        let region = value_region(&cells, "e");
        assert_eq!(region.chars().count(), VALUE_WIDTH);
        assert_eq!(&region[0..1], "a");
        assert_eq!(region.chars().nth(CELL_WIDTH).unwrap(), 'b');
        assert_eq!(region.chars().nth(4 * CELL_WIDTH).unwrap(), 'e');
    }
}
