//! Per-host operation outcomes and status tables.
//!
//! Bulk operations never abort siblings on a single host failure; instead
//! every host's outcome is collected here and rendered as a table. An
//! operation succeeded as a whole only when every host succeeded.

use colored::Colorize;

/// Outcome of one host inside a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// Nothing to do on this host (e.g. no cluster directory to back up).
    Skipped(String),
    Failed(String),
}

/// One `(host, outcome)` row.
#[derive(Debug, Clone)]
pub struct HostOutcome {
    pub host: String,
    pub outcome: Outcome,
}

/// Ordered collection of per-host outcomes for one bulk operation.
#[derive(Debug, Clone, Default)]
pub struct OperationReport {
    rows: Vec<HostOutcome>,
}

impl OperationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, host: impl Into<String>, outcome: Outcome) {
        self.rows.push(HostOutcome {
            host: host.into(),
            outcome,
        });
    }

    pub fn push_ok(&mut self, host: impl Into<String>) {
        self.push(host, Outcome::Ok);
    }

    pub fn push_failed(&mut self, host: impl Into<String>, cause: impl Into<String>) {
        self.push(host, Outcome::Failed(cause.into()));
    }

    pub fn rows(&self) -> &[HostOutcome] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when no host failed (skips count as success).
    pub fn all_ok(&self) -> bool {
        !self
            .rows
            .iter()
            .any(|r| matches!(r.outcome, Outcome::Failed(_)))
    }

    /// Hosts whose outcome was `Ok`.
    pub fn ok_hosts(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|r| r.outcome == Outcome::Ok)
            .map(|r| r.host.clone())
            .collect()
    }

    /// Renders a HOST/STATUS table.
    pub fn render(&self) -> String {
        let mut table = Table::new(&["HOST", "STATUS"]);
        for row in &self.rows {
            let cell = match &row.outcome {
                Outcome::Ok => Cell::green("OK"),
                Outcome::Skipped(reason) => Cell::yellow(format!("SKIP ({reason})")),
                Outcome::Failed(cause) => Cell::red(format!("FAIL ({cause})")),
            };
            table.row(vec![Cell::plain(row.host.as_str()), cell]);
        }
        table.render()
    }
}

/// Color applied to a table cell at render time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellColor {
    None,
    Green,
    Red,
    Yellow,
}

/// One table cell. Width is computed from the uncolored text so ANSI codes
/// never skew the column layout.
#[derive(Debug, Clone)]
pub struct Cell {
    text: String,
    color: CellColor,
}

impl Cell {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: CellColor::None,
        }
    }

    pub fn green(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: CellColor::Green,
        }
    }

    pub fn red(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: CellColor::Red,
        }
    }

    pub fn yellow(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: CellColor::Yellow,
        }
    }

    fn painted(&self, width: usize) -> String {
        let padded = format!("{:<width$}", self.text);
        match self.color {
            CellColor::None => padded,
            CellColor::Green => padded.green().to_string(),
            CellColor::Red => padded.red().to_string(),
            CellColor::Yellow => padded.yellow().to_string(),
        }
    }
}

/// Minimal ascii table with `+-+` borders.
#[derive(Debug, Clone)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(&mut self, cells: Vec<Cell>) {
        debug_assert_eq!(cells.len(), self.headers.len());
        self.rows.push(cells);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(String::len).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.text.len());
            }
        }

        let border = {
            let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(w + 2)).collect();
            format!("+{}+", dashes.join("+"))
        };

        let mut lines = Vec::with_capacity(self.rows.len() + 4);
        lines.push(border.clone());
        let header_cells: Vec<String> = self
            .headers
            .iter()
            .zip(&widths)
            .map(|(h, w)| format!(" {:<width$} ", h, width = *w))
            .collect();
        lines.push(format!("|{}|", header_cells.join("|")));
        lines.push(border.clone());
        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!(" {} ", c.painted(*w)))
                .collect();
            lines.push(format!("|{}|", cells.join("|")));
        }
        lines.push(border);
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_color() {
        colored::control::set_override(false);
    }

    #[test]
    fn all_ok_reflects_failures() {
        let mut report = OperationReport::new();
        report.push_ok("node1");
        report.push_ok("node2");
        assert!(report.all_ok());
        report.push_failed("node3", "host unreachable");
        assert!(!report.all_ok());
        assert_eq!(report.len(), 3);
    }

    #[test]
    fn skips_do_not_fail_the_operation() {
        let mut report = OperationReport::new();
        report.push("node1", Outcome::Skipped("no cluster dir".into()));
        assert!(report.all_ok());
    }

    #[test]
    fn ok_hosts_excludes_failures_and_skips() {
        let mut report = OperationReport::new();
        report.push_ok("node1");
        report.push_failed("node2", "x");
        report.push("node3", Outcome::Skipped("y".into()));
        assert_eq!(report.ok_hosts(), vec!["node1"]);
    }

    #[test]
    fn render_lists_every_host_in_order() {
        no_color();
        let mut report = OperationReport::new();
        report.push_ok("node1");
        report.push_failed("node2", "host unreachable");
        report.push_ok("node3");
        let out = report.render();
        let node1 = out.find("node1").unwrap();
        let node2 = out.find("node2").unwrap();
        let node3 = out.find("node3").unwrap();
        assert!(node1 < node2 && node2 < node3);
        assert!(out.contains("FAIL (host unreachable)"));
    }

    #[test]
    fn table_pads_columns_to_widest_cell() {
        no_color();
        let mut table = Table::new(&["HOST", "STATUS"]);
        table.row(vec![Cell::plain("a-very-long-hostname"), Cell::green("OK")]);
        table.row(vec![Cell::plain("b"), Cell::red("FAIL")]);
        let out = table.render();
        let lines: Vec<&str> = out.lines().collect();
        // border, header, border, two rows, border
        assert_eq!(lines.len(), 6);
        let width = lines[0].len();
        assert!(lines.iter().all(|l| l.len() == width));
    }
}
