use std::collections::HashMap;

use anyhow::{Context, Result, bail};

/// Rendered stand-in for a value that could not be derived.
pub const UNDEFINED: &str = "—";

/// One comparison cell, preserved verbatim as the tool printed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricCell {
    pub new: String,
    pub old: String,
    pub delta: String,
}

impl MetricCell {
    /// Compact "new Δ" form used in the rendered table.
    pub fn summary(&self) -> String {
        format!("{} {}", self.new, self.delta)
    }
}

/// Instructions-per-cycle derived from two parsed metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ipc {
    pub value: f64,
    pub delta_pct: Option<f64>,
}

impl Ipc {
    pub fn render(ipc: Option<Ipc>) -> String {
        match ipc {
            None => UNDEFINED.to_string(),
            Some(Ipc {
                value,
                delta_pct: None,
            }) => format!("{value:.2}"),
            Some(Ipc {
                value,
                delta_pct: Some(delta),
            }) => format!("{value:.2} ({delta:+.2}%)"),
        }
    }
}

/// Nested metric-name → benchmark-name → cell table parsed from the
/// benchmark tool's comparison output.
#[derive(Debug, Default)]
pub struct MetricTable {
    metrics: HashMap<String, HashMap<String, MetricCell>>,
}

impl MetricTable {
    /// Parse the tool's output. The comparison table arrives in sections,
    /// one per metric, each opened by a `name  old <metric>  new <metric>
    /// delta` header and closed by a blank line; columns are separated by
    /// two or more spaces. Anything outside a section (build chatter on
    /// stdout/stderr) is ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = MetricTable::default();
        let mut current: Option<String> = None;

        for line in text.lines() {
            if line.trim().is_empty() {
                current = None;
                continue;
            }
            if let Some(metric) = parse_section_header(line)? {
                current = Some(metric);
                continue;
            }
            let Some(metric) = current.as_deref() else {
                continue;
            };
            let columns = split_columns(line);
            if columns.len() != 4 {
                bail!("malformed metric row for {metric}: {line:?}");
            }
            table.metrics.entry(metric.to_string()).or_default().insert(
                columns[0].to_string(),
                MetricCell {
                    old: columns[1].to_string(),
                    new: columns[2].to_string(),
                    delta: columns[3].to_string(),
                },
            );
        }

        if table.metrics.is_empty() {
            bail!("benchmark output contained no comparison table");
        }
        Ok(table)
    }

    pub fn cell(&self, metric: &str, benchmark: &str) -> Option<&MetricCell> {
        self.metrics.get(metric)?.get(benchmark)
    }

    /// instructions_new / cycles_new, with the delta formed by the same
    /// ratio over the old values. Division by zero or an undefined operand
    /// leaves the IPC undefined.
    pub fn ipc(&self, benchmark: &str) -> Result<Option<Ipc>> {
        let instructions = self
            .cell("Instructions", benchmark)
            .with_context(|| format!("no Instructions cell for {benchmark}"))?;
        let cycles = self
            .cell("Cycles", benchmark)
            .with_context(|| format!("no Cycles cell for {benchmark}"))?;

        let value = match (parse_value(&instructions.new)?, parse_value(&cycles.new)?) {
            (Some(instructions), Some(cycles)) if cycles != 0.0 => instructions / cycles,
            _ => return Ok(None),
        };
        let delta_pct = match (parse_value(&instructions.old)?, parse_value(&cycles.old)?) {
            (Some(instructions), Some(cycles)) if cycles != 0.0 => {
                let old = instructions / cycles;
                (old != 0.0).then(|| (value / old - 1.0) * 100.0)
            }
            _ => None,
        };
        Ok(Some(Ipc { value, delta_pct }))
    }
}

fn parse_section_header(line: &str) -> Result<Option<String>> {
    let columns = split_columns(line);
    if columns.len() != 4 || columns[0] != "name" || columns[3] != "delta" {
        return Ok(None);
    }
    let (Some(old_metric), Some(new_metric)) = (
        columns[1].strip_prefix("old "),
        columns[2].strip_prefix("new "),
    ) else {
        return Ok(None);
    };
    if old_metric != new_metric {
        bail!("mismatched section header: {line:?}");
    }
    Ok(Some(old_metric.to_string()))
}

/// Columns are runs of text separated by two or more spaces; cells keep
/// their internal single spaces (`10.6µs ± 3%`).
fn split_columns(line: &str) -> Vec<&str> {
    line.split("  ")
        .map(str::trim)
        .filter(|column| !column.is_empty())
        .collect()
}

/// Parse one comparison cell into a plain count or seconds. Empty and
/// `nan` cells are undefined rather than errors.
pub fn parse_value(cell: &str) -> Result<Option<f64>> {
    let trimmed = cell.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let magnitude = match trimmed.split_once('±') {
        Some((value, _noise)) => value.trim(),
        None => trimmed,
    };

    let unit_start = magnitude
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .map(|(index, _)| index)
        .unwrap_or(magnitude.len());
    let (number, unit) = magnitude.split_at(unit_start);
    let number: f64 = number
        .parse()
        .ok()
        .filter(|value: &f64| value.is_finite())
        .with_context(|| format!("malformed metric cell {cell:?}"))?;

    let scale = match unit {
        "" => 1.0,
        "ns" => 1e-9,
        "µs" | "us" => 1e-6,
        "ms" => 1e-3,
        "s" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        other => bail!("unknown unit {other:?} in metric cell {cell:?}"),
    };
    Ok(Some(number * scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
INFO: invoking benchmark build for //benchmarks:parse_descriptor
Target up to date; running 2 benchmarks on device

name                                old CPU        new CPU        delta
BM_Parse_FileDesc_WithArena         10.6µs ± 3%    10.0µs ± 2%    -5.66%
BM_Parse_FileDesc_WithInitialBlock  9.81µs ± 1%    9.80µs ± 1%    ~

name                                old Instructions  new Instructions  delta
BM_Parse_FileDesc_WithArena         113M ± 0%         112M ± 0%         -0.88%
BM_Parse_FileDesc_WithInitialBlock  101M ± 0%         101M ± 0%         ~

name                                old Cycles     new Cycles     delta
BM_Parse_FileDesc_WithArena         33.1M ± 2%     32.4M ± 1%     -2.11%
BM_Parse_FileDesc_WithInitialBlock  30.0M ± 1%     30.1M ± 1%     ~
";

    #[test]
    fn cells_are_preserved_verbatim() {
        let table = MetricTable::parse(OUTPUT).unwrap();
        let cell = table.cell("CPU", "BM_Parse_FileDesc_WithArena").unwrap();
        assert_eq!(cell.new, "10.0µs ± 2%");
        assert_eq!(cell.old, "10.6µs ± 3%");
        assert_eq!(cell.delta, "-5.66%");
        assert_eq!(cell.summary(), "10.0µs ± 2% -5.66%");
    }

    #[test]
    fn build_chatter_outside_sections_is_ignored() {
        let table = MetricTable::parse(OUTPUT).unwrap();
        assert!(table.cell("CPU", "INFO:").is_none());
        assert!(
            table
                .cell("Instructions", "BM_Parse_FileDesc_WithInitialBlock")
                .is_some()
        );
    }

    #[test]
    fn malformed_row_inside_a_section_is_fatal() {
        let text = "name  old CPU  new CPU  delta\nBM_Foo  10ns ± 1%\n";
        let err = MetricTable::parse(text).unwrap_err();
        assert!(err.to_string().contains("malformed metric row"));
    }

    #[test]
    fn output_without_a_table_is_fatal() {
        let err = MetricTable::parse("build failed\nerror: no such target\n").unwrap_err();
        assert!(err.to_string().contains("no comparison table"));
    }

    #[test]
    fn time_suffixes_scale_to_seconds() {
        assert_eq!(parse_value("10.0µs ± 2%").unwrap(), Some(10.0e-6));
        assert_eq!(parse_value("10.0us ± 2%").unwrap(), Some(10.0e-6));
        assert_eq!(parse_value("250ns").unwrap(), Some(250.0e-9));
        assert_eq!(parse_value("1.5ms").unwrap(), Some(1.5e-3));
        assert_eq!(parse_value("2s").unwrap(), Some(2.0));
    }

    #[test]
    fn si_suffixes_scale_counts() {
        assert_eq!(parse_value("113M ± 0%").unwrap(), Some(113.0e6));
        assert_eq!(parse_value("4.2k").unwrap(), Some(4200.0));
        assert_eq!(parse_value("1G").unwrap(), Some(1.0e9));
        assert_eq!(parse_value("42").unwrap(), Some(42.0));
    }

    #[test]
    fn empty_and_nan_are_undefined() {
        assert_eq!(parse_value("").unwrap(), None);
        assert_eq!(parse_value("   ").unwrap(), None);
        assert_eq!(parse_value("NaN").unwrap(), None);
    }

    #[test]
    fn bad_cells_are_errors() {
        assert!(parse_value("µs ± 2%").is_err());
        assert!(
            parse_value("10.0parsecs")
                .unwrap_err()
                .to_string()
                .contains("unknown unit")
        );
    }

    #[test]
    fn ipc_is_the_instruction_cycle_ratio() {
        let table = MetricTable::parse(OUTPUT).unwrap();
        let ipc = table.ipc("BM_Parse_FileDesc_WithArena").unwrap().unwrap();
        assert!((ipc.value - 112.0e6 / 32.4e6).abs() < 1e-9);
        let expected_delta = ((112.0 / 32.4) / (113.0 / 33.1) - 1.0) * 100.0;
        assert!((ipc.delta_pct.unwrap() - expected_delta).abs() < 1e-9);
    }

    #[test]
    fn zero_cycles_leaves_ipc_undefined() {
        let text = "\
name    old Instructions  new Instructions  delta
BM_Foo  113M ± 0%         112M ± 0%         -0.88%

name    old Cycles  new Cycles  delta
BM_Foo  33.1M ± 2%  0 ± 0%      ~
";
        let table = MetricTable::parse(text).unwrap();
        assert_eq!(table.ipc("BM_Foo").unwrap(), None);
        assert_eq!(Ipc::render(None), UNDEFINED);
    }

    #[test]
    fn ipc_rendering() {
        assert_eq!(
            Ipc::render(Some(Ipc {
                value: 3.456,
                delta_pct: Some(-1.2),
            })),
            "3.46 (-1.20%)"
        );
        assert_eq!(
            Ipc::render(Some(Ipc {
                value: 2.0,
                delta_pct: None,
            })),
            "2.00"
        );
    }
}
