use std::collections::VecDeque;

use super::{ParseError, RawRow, RowCursor, Workbook};

#[derive(Debug, Clone)]
enum MemoryRow {
    Cells(Vec<String>),
    Malformed(String),
}

/// In-memory workbook for programmatic sources.
///
/// ```ignore
/// let workbook = MemoryWorkbook::new()
///     .sheet("Parts", [["Part Number", "Qty"], ["AB-1", "3"]]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkbook {
    sheets: Vec<(String, Vec<MemoryRow>)>,
}

impl MemoryWorkbook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sheet. The first non-empty row is its header.
    pub fn sheet<R, C>(mut self, name: impl Into<String>, rows: R) -> Self
    where
        R: IntoIterator,
        R::Item: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let rows = rows
            .into_iter()
            .map(|row| MemoryRow::Cells(row.into_iter().map(Into::into).collect()))
            .collect();
        self.sheets.push((name.into(), rows));
        self
    }

    /// Append a row that fails to decode to the most recently added sheet.
    pub fn malformed_row(mut self, reason: impl Into<String>) -> Self {
        if let Some((_, rows)) = self.sheets.last_mut() {
            rows.push(MemoryRow::Malformed(reason.into()));
        }
        self
    }
}

impl Workbook for MemoryWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|(name, _)| name.clone()).collect()
    }

    fn open_sheet(&mut self, name: &str) -> Result<Box<dyn RowCursor>, ParseError> {
        let rows = self
            .sheets
            .iter()
            .find(|(sheet, _)| sheet == name)
            .map(|(_, rows)| rows.iter().cloned().collect::<VecDeque<_>>())
            .ok_or_else(|| ParseError::Sheet {
                sheet: name.to_string(),
                reason: "no such sheet".to_string(),
            })?;
        Ok(Box::new(MemoryCursor { rows, number: 0 }))
    }
}

struct MemoryCursor {
    rows: VecDeque<MemoryRow>,
    number: u64,
}

impl RowCursor for MemoryCursor {
    fn next_row(&mut self) -> Result<Option<RawRow>, ParseError> {
        let Some(row) = self.rows.pop_front() else {
            return Ok(None);
        };
        self.number += 1;
        Ok(Some(match row {
            MemoryRow::Cells(cells) => RawRow::Cells {
                number: self.number,
                cells,
            },
            MemoryRow::Malformed(reason) => RawRow::Malformed {
                number: self.number,
                reason,
            },
        }))
    }
}
