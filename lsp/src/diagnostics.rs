//! Per-line diagnostics index for cursor queries.

use std::collections::BTreeMap;

use crate::types::{Diagnostic, DiagnosticSeverity};

/// A read-only projection of one document's diagnostics, keyed by
/// 1-based line.
///
/// Rebuilt wholesale whenever the document's diagnostics are replaced.
/// Compare two indexes with `==` to detect that nothing changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsIndex {
    lines: BTreeMap<u32, Vec<Diagnostic>>,
}

impl DiagnosticsIndex {
    /// Group `diagnostics` by line, keeping wire order within a line.
    #[must_use]
    pub fn index_by_line(diagnostics: &[Diagnostic]) -> Self {
        let mut lines: BTreeMap<u32, Vec<Diagnostic>> = BTreeMap::new();
        for diag in diagnostics {
            lines
                .entry(diag.display_line())
                .or_default()
                .push(diag.clone());
        }
        Self { lines }
    }

    /// Diagnostics on 1-based `line`, in wire order.
    #[must_use]
    pub fn line(&self, line: u32) -> &[Diagnostic] {
        self.lines.get(&line).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lines that carry at least one diagnostic, ascending.
    pub fn lines(&self) -> impl Iterator<Item = (u32, &[Diagnostic])> {
        self.lines.iter().map(|(line, items)| (*line, items.as_slice()))
    }

    /// The diagnostic on `line` closest to `column`.
    ///
    /// Distance is `|column - d.column()|`; on a tie the entry that came
    /// first on the wire wins.
    #[must_use]
    pub fn nearest(&self, line: u32, column: u32) -> Option<&Diagnostic> {
        let items = self.lines.get(&line)?;
        if let [only] = items.as_slice() {
            return Some(only);
        }
        items.iter().fold(None, |best: Option<&Diagnostic>, diag| match best {
            Some(b) if b.column().abs_diff(column) <= diag.column().abs_diff(column) => Some(b),
            _ => Some(diag),
        })
    }

    /// Severity of [`Self::nearest`], the source of a status-line label.
    #[must_use]
    pub fn severity_at(&self, line: u32, column: u32) -> Option<DiagnosticSeverity> {
        self.nearest(line, column).map(Diagnostic::severity)
    }

    /// Every diagnostic on `line` as `L<line>:C<col> <message>`, one per
    /// row.
    #[must_use]
    pub fn line_detail(&self, line: u32) -> Option<String> {
        let items = self.lines.get(&line)?;
        let rows: Vec<String> = items
            .iter()
            .map(|d| format!("L{}:C{} {}", line, d.column(), d.message()))
            .collect();
        Some(rows.join("\n"))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn count_where(&self, pred: impl Fn(DiagnosticSeverity) -> bool) -> usize {
        self.lines
            .values()
            .flatten()
            .filter(|d| pred(d.severity()))
            .count()
    }

    /// Number of error-or-worse diagnostics.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_where(DiagnosticSeverity::is_error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_where(|s| s == DiagnosticSeverity::Warning)
    }

    /// Format a compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
