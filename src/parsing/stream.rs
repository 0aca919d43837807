use std::collections::VecDeque;
use std::path::Path;

use indexmap::IndexMap;

use super::part_number;
use super::{
    ParseError, ParseEvent, ParseOptions, ParsedRecord, ProgressFn, RawRow, RowCursor,
    RowWarning, Workbook, open_workbook,
};
use crate::types::FileId;
use crate::{debug_event, warn_event};

/// Counters for one pass over a workbook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub sheets: u32,
    pub records: u64,
    pub rows_skipped: u64,
}

struct SheetState {
    name: String,
    cursor: Box<dyn RowCursor>,
    header: Option<Vec<String>>,
    part_column: Option<usize>,
    description_column: Option<usize>,
    records: u64,
}

/// Lazy sequence of records over every sheet of a workbook.
///
/// Sheets are visited in workbook order and rows in sheet order, so the same
/// file always yields the same sequence. There is no cap on rows or sheets.
/// The stream cannot be rewound: after a [`ParseError`] it is finished.
pub struct RecordStream {
    workbook: Box<dyn Workbook>,
    file_id: FileId,
    options: ParseOptions,
    pending_sheets: VecDeque<String>,
    current: Option<SheetState>,
    stats: ParseStats,
    progress: Option<ProgressFn>,
    unreported: u64,
    finished: bool,
}

impl RecordStream {
    /// Open the spreadsheet at `path`.
    pub fn open(path: &Path, file_id: FileId, options: ParseOptions) -> Result<Self, ParseError> {
        let workbook = open_workbook(path)?;
        Ok(Self::from_workbook(workbook, file_id, options))
    }

    pub fn from_workbook(workbook: Box<dyn Workbook>, file_id: FileId, options: ParseOptions) -> Self {
        let pending_sheets = workbook.sheet_names().into();
        Self {
            workbook,
            file_id,
            options,
            pending_sheets,
            current: None,
            stats: ParseStats::default(),
            progress: None,
            unreported: 0,
            finished: false,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Up to `max` records, or `None` once the workbook is exhausted.
    pub fn next_batch(&mut self, max: usize) -> Result<Option<Vec<ParsedRecord>>, ParseError> {
        let max = max.max(1);
        let mut batch = Vec::with_capacity(max.min(4096));
        while batch.len() < max {
            match self.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }

    /// Next record, or `None` once the workbook is exhausted.
    pub fn next_record(&mut self) -> Result<Option<ParsedRecord>, ParseError> {
        if self.finished {
            return Ok(None);
        }
        let result = self.advance();
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }

    fn advance(&mut self) -> Result<Option<ParsedRecord>, ParseError> {
        loop {
            if self.current.is_none() {
                let Some(name) = self.pending_sheets.pop_front() else {
                    return Ok(None);
                };
                let cursor = self.workbook.open_sheet(&name)?;
                self.stats.sheets += 1;
                debug_event!("parse", "sheet", "{name}");
                self.current = Some(SheetState {
                    name,
                    cursor,
                    header: None,
                    part_column: None,
                    description_column: None,
                    records: 0,
                });
            }

            let Some(sheet) = self.current.as_mut() else {
                continue;
            };

            let row = match sheet.cursor.next_row()? {
                Some(row) => row,
                None => {
                    self.finish_sheet();
                    continue;
                }
            };

            let (number, cells) = match row {
                RawRow::Cells { number, cells } => (number, cells),
                RawRow::Malformed { number, reason } => {
                    let warning = RowWarning {
                        sheet: sheet.name.clone(),
                        row: number,
                        reason,
                    };
                    self.skip(warning);
                    continue;
                }
            };

            if cells.iter().all(|c| c.trim().is_empty()) {
                continue;
            }

            let Some(header) = sheet.header.as_ref() else {
                let header = build_header(&cells);
                sheet.part_column = header.iter().position(|h| part_number::is_part_number_header(h));
                sheet.description_column =
                    header.iter().position(|h| part_number::is_description_header(h));
                sheet.header = Some(header);
                continue;
            };

            if let Some(col) = cells
                .iter()
                .position(|c| c.chars().count() > self.options.max_cell_chars)
            {
                let warning = RowWarning {
                    sheet: sheet.name.clone(),
                    row: number,
                    reason: format!(
                        "column {} exceeds {} characters",
                        col + 1,
                        self.options.max_cell_chars
                    ),
                };
                self.skip(warning);
                continue;
            }

            let mut fields = IndexMap::with_capacity(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                let value = cell.trim();
                if value.is_empty() {
                    continue;
                }
                let column = header
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("Column_{}", i + 1));
                fields.insert(column, value.to_string());
            }

            let part_number = sheet
                .part_column
                .and_then(|i| cells.get(i))
                .map(|c| part_number::normalize(c, part_number::NormalizeLevel::Whitespace))
                .filter(|p| !p.is_empty())
                .or_else(|| {
                    sheet
                        .description_column
                        .and_then(|i| cells.get(i))
                        .and_then(|c| part_number::derive_from_description(c))
                });

            let record = ParsedRecord {
                file_id: self.file_id,
                sheet: sheet.name.clone(),
                row_index: number,
                fields,
                part_number,
            };

            sheet.records += 1;
            self.stats.records += 1;
            self.unreported += 1;
            if self.unreported >= self.options.progress_interval {
                self.report_rows();
            }
            return Ok(Some(record));
        }
    }

    fn skip(&mut self, warning: RowWarning) {
        self.stats.rows_skipped += 1;
        debug_event!(
            "parse",
            "row skipped",
            "{} row {}: {}",
            warning.sheet,
            warning.row,
            warning.reason
        );
    }

    fn finish_sheet(&mut self) {
        let Some(sheet) = self.current.take() else {
            return;
        };
        self.report_rows();
        if sheet.header.is_none() {
            debug_event!("parse", "empty sheet", "{}", sheet.name);
        }
        if let Some(progress) = &self.progress {
            progress(&ParseEvent::SheetDone {
                name: sheet.name,
                rows: sheet.records,
            });
        }
    }

    fn report_rows(&mut self) {
        if self.unreported == 0 {
            return;
        }
        let delta = std::mem::take(&mut self.unreported);
        if let Some(progress) = &self.progress {
            progress(&ParseEvent::Rows {
                delta,
                total: self.stats.records,
            });
        }
    }
}

impl Iterator for RecordStream {
    type Item = Result<ParsedRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        if self.stats.rows_skipped > 0 {
            warn_event!(
                "parse",
                "malformed rows skipped",
                "file {} skipped {} rows",
                self.file_id,
                self.stats.rows_skipped
            );
        }
    }
}

/// Header names for a sheet: trimmed, blank cells named by position.
fn build_header(cells: &[String]) -> Vec<String> {
    cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let name = cell.trim().trim_start_matches('\u{feff}').trim();
            if name.is_empty() {
                format!("Column_{}", i + 1)
            } else {
                name.to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::MemoryWorkbook;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn file_id() -> FileId {
        FileId::new(1).unwrap()
    }

    fn options(progress_interval: u64) -> ParseOptions {
        ParseOptions {
            progress_interval,
            max_cell_chars: 20,
        }
    }

    #[test]
    fn test_visits_every_sheet_in_order() {
        let workbook = MemoryWorkbook::new()
            .sheet("A", [["Part Number", "Qty"], ["P-1", "1"], ["P-2", "2"]])
            .sheet("B", [["pn", "Qty"], ["Q-1", "5"]]);
        let stream = RecordStream::from_workbook(Box::new(workbook), file_id(), options(100));

        let records: Vec<_> = stream.map(Result::unwrap).collect();
        let keys: Vec<_> = records
            .iter()
            .map(|r| (r.sheet.as_str(), r.row_index, r.part_number.as_deref()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("A", 2, Some("P-1")),
                ("A", 3, Some("P-2")),
                ("B", 2, Some("Q-1")),
            ]
        );
    }

    #[test]
    fn test_blank_rows_and_header_cells() {
        let workbook = MemoryWorkbook::new().sheet(
            "Parts",
            vec![
                vec!["", ""],
                vec!["Part Number", ""],
                vec!["", "  "],
                vec!["AB-1", "left bin"],
                vec!["CD-2", "", "extra"],
            ],
        );
        let mut stream = RecordStream::from_workbook(Box::new(workbook), file_id(), options(100));
        let batch = stream.next_batch(10).unwrap().unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].row_index, 4);
        assert_eq!(batch[0].fields["Column_2"], "left bin");
        assert_eq!(batch[1].fields.get("Column_2"), None);
        assert_eq!(batch[1].fields["Column_3"], "extra");
        assert_eq!(stream.next_batch(10).unwrap(), None);
    }

    #[test]
    fn test_malformed_rows_are_skipped_and_counted() {
        let workbook = MemoryWorkbook::new()
            .sheet("Parts", [["Part Number", "Note"], ["AB-1", "ok"]])
            .malformed_row("cell error")
            .sheet(
                "More",
                vec![
                    vec!["Part Number".to_string(), "Note".to_string()],
                    vec!["CD-2".to_string(), "x".repeat(21)],
                    vec!["EF-3".to_string(), "fine".to_string()],
                ],
            );
        let mut stream = RecordStream::from_workbook(Box::new(workbook), file_id(), options(100));

        let records: Vec<_> = stream.by_ref().map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(
            stream.stats(),
            &ParseStats {
                sheets: 2,
                records: 2,
                rows_skipped: 2,
            }
        );
    }

    #[test]
    fn test_part_number_falls_back_to_description() {
        let workbook = MemoryWorkbook::new().sheet(
            "Parts",
            [["Item_Description", "Qty"], ["Hex bolt M8X40 zinc", "10"]],
        );
        let mut stream = RecordStream::from_workbook(Box::new(workbook), file_id(), options(100));
        let record = stream.next_record().unwrap().unwrap();
        assert_eq!(record.part_number.as_deref(), Some("M8X40"));
    }

    #[test]
    fn test_batches_are_bounded() {
        let mut rows = vec![vec!["Part Number".to_string()]];
        rows.extend((0..25).map(|i| vec![format!("P-{i}")]));
        let workbook = MemoryWorkbook::new().sheet("Parts", rows);
        let mut stream = RecordStream::from_workbook(Box::new(workbook), file_id(), options(100));

        let mut sizes = Vec::new();
        while let Some(batch) = stream.next_batch(10).unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_progress_reports_sum_to_total() {
        let mut rows = vec![vec!["Part Number".to_string()]];
        rows.extend((0..25).map(|i| vec![format!("P-{i}")]));
        let workbook = MemoryWorkbook::new()
            .sheet("A", rows.clone())
            .sheet("B", rows);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let stream = RecordStream::from_workbook(Box::new(workbook), file_id(), options(10))
            .with_progress(Arc::new(move |event: &ParseEvent| {
                sink.lock().push(event.clone())
            }));

        assert_eq!(stream.count(), 50);

        let events = events.lock();
        let reported: u64 = events
            .iter()
            .map(|e| match e {
                ParseEvent::Rows { delta, .. } => *delta,
                ParseEvent::SheetDone { .. } => 0,
            })
            .sum();
        assert_eq!(reported, 50);
        assert!(events.contains(&ParseEvent::SheetDone {
            name: "A".to_string(),
            rows: 25,
        }));
        assert_eq!(
            events.last(),
            Some(&ParseEvent::SheetDone {
                name: "B".to_string(),
                rows: 25,
            })
        );
    }

    #[test]
    fn test_missing_sheet_is_structural_error() {
        struct Lying;
        impl Workbook for Lying {
            fn sheet_names(&self) -> Vec<String> {
                vec!["Ghost".to_string()]
            }
            fn open_sheet(&mut self, name: &str) -> Result<Box<dyn RowCursor>, ParseError> {
                Err(ParseError::Sheet {
                    sheet: name.to_string(),
                    reason: "corrupt".to_string(),
                })
            }
        }

        let mut stream = RecordStream::from_workbook(Box::new(Lying), file_id(), options(10));
        assert!(matches!(
            stream.next_batch(10),
            Err(ParseError::Sheet { .. })
        ));
        assert!(stream.is_finished());
        assert_eq!(stream.next_batch(10).unwrap(), None);
    }
}
