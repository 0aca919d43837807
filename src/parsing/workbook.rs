use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread;

use calamine::{Cell, Data, DataRef, Range, Reader, Sheets, open_workbook_auto};
use chrono::NaiveTime;
use crossbeam_channel::{Receiver, Sender, bounded};

use super::ParseError;

/// A row as read from a sheet, before header mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRow {
    Cells { number: u64, cells: Vec<String> },
    Malformed { number: u64, reason: String },
}

/// Forward-only reader over the rows of one sheet.
pub trait RowCursor: Send {
    /// Next row, or `None` at the end of the sheet.
    fn next_row(&mut self) -> Result<Option<RawRow>, ParseError>;
}

/// A spreadsheet source with one or more named sheets.
pub trait Workbook: Send {
    /// Sheet names in file order.
    fn sheet_names(&self) -> Vec<String>;

    fn open_sheet(&mut self, name: &str) -> Result<Box<dyn RowCursor>, ParseError>;
}

/// Open a workbook, choosing the reader from the file extension.
pub fn open_workbook(path: &Path) -> Result<Box<dyn Workbook>, ParseError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "csv" => Ok(Box::new(CsvWorkbook::open(path, b',')?)),
        "tsv" => Ok(Box::new(CsvWorkbook::open(path, b'\t')?)),
        "xlsx" | "xlsm" | "xlsb" | "xls" | "xla" | "ods" => {
            Ok(Box::new(CalamineWorkbook::open(path)?))
        }
        _ => Err(ParseError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

/// Rows buffered between the sheet reader thread and its cursor.
const ROW_BUFFER: usize = 256;

enum SheetMessage {
    Row(RawRow),
    Failed(ParseError),
    Done,
}

struct SheetRequest {
    name: String,
    rows: Sender<SheetMessage>,
}

enum Backend {
    /// A reader thread owns the workbook and streams cells.
    Streaming(Sender<SheetRequest>),
    /// Whole-sheet ranges.
    Ranged(Sheets<BufReader<File>>),
}

/// Excel and OpenDocument workbooks.
///
/// `.xlsx`, `.xlsm` and `.xlsb` are streamed: a reader thread owns the
/// workbook and walks the sheet cell by cell, sending finished rows through a
/// bounded channel, so a sheet is never held in memory whole. calamine has no
/// cell-level reader for `.xls` and `.ods`; those decode one sheet range at a
/// time, released before the next sheet is opened.
pub struct CalamineWorkbook {
    names: Vec<String>,
    backend: Backend,
}

impl CalamineWorkbook {
    pub fn open(path: &Path) -> Result<Self, ParseError> {
        let sheets = open_workbook_auto(path).map_err(|e| ParseError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let names = sheets.sheet_names();
        let backend = match sheets {
            Sheets::Xlsx(_) | Sheets::Xlsb(_) => Backend::Streaming(spawn_sheet_reader(sheets)?),
            ranged => Backend::Ranged(ranged),
        };
        Ok(Self { names, backend })
    }

    fn streamed_sheet(requests: &Sender<SheetRequest>, name: &str) -> Result<StreamedSheet, ParseError> {
        let (rows, received) = bounded(ROW_BUFFER);
        requests
            .send(SheetRequest {
                name: name.to_string(),
                rows,
            })
            .map_err(|_| ParseError::Sheet {
                sheet: name.to_string(),
                reason: "sheet reader stopped".to_string(),
            })?;
        Ok(StreamedSheet {
            sheet: name.to_string(),
            rows: received,
            done: false,
        })
    }
}

impl Workbook for CalamineWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn open_sheet(&mut self, name: &str) -> Result<Box<dyn RowCursor>, ParseError> {
        match &mut self.backend {
            Backend::Streaming(requests) => Ok(Box::new(Self::streamed_sheet(requests, name)?)),
            Backend::Ranged(sheets) => {
                let range = sheets.worksheet_range(name).map_err(|e| ParseError::Sheet {
                    sheet: name.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Box::new(RangeCursor::new(range)))
            }
        }
    }
}

/// Serve sheet requests until the workbook is dropped.
fn spawn_sheet_reader(mut sheets: Sheets<BufReader<File>>) -> Result<Sender<SheetRequest>, ParseError> {
    let (requests, incoming) = bounded::<SheetRequest>(1);
    thread::Builder::new()
        .name("sheetdex-sheet-reader".to_string())
        .spawn(move || {
            for request in incoming {
                stream_sheet(&mut sheets, &request.name, &request.rows);
            }
        })?;
    Ok(requests)
}

fn stream_sheet(sheets: &mut Sheets<BufReader<File>>, name: &str, rows: &Sender<SheetMessage>) {
    let result = match sheets {
        Sheets::Xlsx(xlsx) => match xlsx.worksheet_cells_reader(name) {
            Ok(mut reader) => pump_cells(|| reader.next_cell(), rows),
            Err(e) => Err(e.to_string()),
        },
        Sheets::Xlsb(xlsb) => match xlsb.worksheet_cells_reader(name) {
            Ok(mut reader) => pump_cells(|| reader.next_cell(), rows),
            Err(e) => Err(e.to_string()),
        },
        Sheets::Xls(_) | Sheets::Ods(_) => Err("format has no cell reader".to_string()),
    };

    let last = match result {
        Ok(()) => SheetMessage::Done,
        Err(reason) => SheetMessage::Failed(ParseError::Sheet {
            sheet: name.to_string(),
            reason,
        }),
    };
    // The cursor may already be gone.
    let _ = rows.send(last);
}

/// Group cells into rows and send each row once the next one starts.
///
/// Returns early, without error, when the receiving cursor is dropped.
fn pump_cells<'a, E, F>(mut next_cell: F, rows: &Sender<SheetMessage>) -> Result<(), String>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<Option<Cell<DataRef<'a>>>, E>,
{
    let mut row = RowBuilder::default();
    while let Some(cell) = next_cell().map_err(|e| e.to_string())? {
        let (index, column) = cell.get_position();
        if row.index != Some(index) {
            if let Some(done) = row.finish() {
                if rows.send(SheetMessage::Row(done)).is_err() {
                    return Ok(());
                }
            }
            row.index = Some(index);
        }
        row.push(column, &Data::from(cell.get_value().clone()));
    }
    if let Some(done) = row.finish() {
        if rows.send(SheetMessage::Row(done)).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

#[derive(Default)]
struct RowBuilder {
    /// Zero-based sheet row being assembled.
    index: Option<u32>,
    cells: Vec<String>,
    error: Option<String>,
}

impl RowBuilder {
    fn push(&mut self, column: u32, value: &Data) {
        match cell_text(value) {
            Ok(None) => {}
            Ok(Some(text)) => {
                let column = column as usize;
                if self.cells.len() <= column {
                    self.cells.resize(column + 1, String::new());
                }
                self.cells[column] = text;
            }
            Err(reason) => {
                if self.error.is_none() {
                    self.error = Some(format!("{reason} in column {}", column + 1));
                }
            }
        }
    }

    fn finish(&mut self) -> Option<RawRow> {
        let number = u64::from(self.index.take()?) + 1;
        let cells = std::mem::take(&mut self.cells);
        Some(match self.error.take() {
            Some(reason) => RawRow::Malformed { number, reason },
            None => RawRow::Cells { number, cells },
        })
    }
}

/// Rows of one streamed sheet.
struct StreamedSheet {
    sheet: String,
    rows: Receiver<SheetMessage>,
    done: bool,
}

impl RowCursor for StreamedSheet {
    fn next_row(&mut self) -> Result<Option<RawRow>, ParseError> {
        if self.done {
            return Ok(None);
        }
        match self.rows.recv() {
            Ok(SheetMessage::Row(row)) => Ok(Some(row)),
            Ok(SheetMessage::Done) => {
                self.done = true;
                Ok(None)
            }
            Ok(SheetMessage::Failed(e)) => {
                self.done = true;
                Err(e)
            }
            Err(_) => {
                self.done = true;
                Err(ParseError::Sheet {
                    sheet: self.sheet.clone(),
                    reason: "sheet reader stopped before the end of the sheet".to_string(),
                })
            }
        }
    }
}

/// Text of one cell: `None` when empty, `Err` for an error value.
///
/// Date cells become ISO 8601 dates, or date-times when they carry a time.
fn cell_text(value: &Data) -> Result<Option<String>, String> {
    let text = match value {
        Data::Empty => return Ok(None),
        Data::Error(err) => return Err(format!("cell error {err:?}")),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::DateTime(dt) if dt.is_datetime() => match dt.as_datetime() {
            Some(at) if at.time() == NaiveTime::MIN => at.format("%Y-%m-%d").to_string(),
            Some(at) => at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    };
    Ok(Some(text))
}

struct RangeCursor {
    range: Range<Data>,
    /// Absolute (zero-based) row of the range's first row.
    first_row: u64,
    height: usize,
    width: usize,
    next: usize,
}

impl RangeCursor {
    fn new(range: Range<Data>) -> Self {
        let (height, width) = range.get_size();
        let first_row = range.start().map(|(row, _)| u64::from(row)).unwrap_or(0);
        Self {
            range,
            first_row,
            height,
            width,
            next: 0,
        }
    }
}

impl RowCursor for RangeCursor {
    fn next_row(&mut self) -> Result<Option<RawRow>, ParseError> {
        if self.next >= self.height {
            return Ok(None);
        }
        let row = self.next;
        self.next += 1;
        let number = self.first_row + row as u64 + 1;

        let mut cells = Vec::with_capacity(self.width);
        for col in 0..self.width {
            match self.range.get((row, col)).map(cell_text) {
                None | Some(Ok(None)) => cells.push(String::new()),
                Some(Ok(Some(text))) => cells.push(text),
                Some(Err(reason)) => {
                    return Ok(Some(RawRow::Malformed {
                        number,
                        reason: format!("{reason} in column {}", col + 1),
                    }));
                }
            }
        }
        Ok(Some(RawRow::Cells { number, cells }))
    }
}

/// Delimited text. The whole file is one sheet named after the file stem.
pub struct CsvWorkbook {
    path: PathBuf,
    sheet: String,
    reader: Option<csv::Reader<File>>,
}

impl CsvWorkbook {
    pub fn open(path: &Path, delimiter: u8) -> Result<Self, ParseError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_path(path)
            .map_err(|e| ParseError::Open {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let sheet = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("Sheet1")
            .to_string();

        Ok(Self {
            path: path.to_path_buf(),
            sheet,
            reader: Some(reader),
        })
    }
}

impl Workbook for CsvWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        vec![self.sheet.clone()]
    }

    fn open_sheet(&mut self, name: &str) -> Result<Box<dyn RowCursor>, ParseError> {
        if name != self.sheet {
            return Err(ParseError::Sheet {
                sheet: name.to_string(),
                reason: format!("{} has a single sheet '{}'", self.path.display(), self.sheet),
            });
        }
        let reader = self.reader.take().ok_or_else(|| ParseError::Sheet {
            sheet: name.to_string(),
            reason: "sheet already read".to_string(),
        })?;
        Ok(Box::new(CsvCursor {
            records: reader.into_records(),
            number: 0,
        }))
    }
}

struct CsvCursor {
    records: csv::StringRecordsIntoIter<File>,
    number: u64,
}

impl RowCursor for CsvCursor {
    fn next_row(&mut self) -> Result<Option<RawRow>, ParseError> {
        let Some(result) = self.records.next() else {
            return Ok(None);
        };
        self.number += 1;

        match result {
            Ok(record) => Ok(Some(RawRow::Cells {
                number: self.number,
                cells: record.iter().map(str::to_string).collect(),
            })),
            Err(e) if e.is_io_error() => Err(ParseError::Io(std::io::Error::other(e.to_string()))),
            Err(e) => Ok(Some(RawRow::Malformed {
                number: self.number,
                reason: e.to_string(),
            })),
        }
    }
}
