use crate::{
    error::{ServiceError, ServiceResult},
    staging::StagedUpload,
    store::{self, Ident, Store},
};
use csv::{ByteRecord, Reader, ReaderBuilder};
use duckdb::{params, Connection};
use serde::Serialize;
use std::{io::Read, path::Path};
use tracing::{info, trace};

/// Rows at the top of every upload that are never read as data: the header
/// row plus one boilerplate row.
pub const SKIPPED_LEADING_ROWS: usize = 2;

// Zero-based CSV positions. Column 6 is unused.
pub const DATE_COL: usize = 2;
pub const MEMO_COL: usize = 3;
pub const NUM_COL: usize = 4;
pub const SOURCE_NAME_COL: usize = 5;
pub const QTY_COL: usize = 7;

/// The five fields ingestion pulls out of one CSV record.
///
/// Text fields are `None` when the record is too short to have that column
/// and `Some("")` when the column is present but empty. Bytes that are not
/// valid UTF-8 decode to U+FFFD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub date: Option<String>,
    pub memo: Option<String>,
    pub num: Option<String>,
    pub source_name: Option<String>,
    /// `None` is the not-a-number marker.
    pub qty: Option<i64>,
}

impl LedgerEntry {
    pub fn from_record(record: &ByteRecord) -> Self {
        let field = |idx: usize| {
            record
                .get(idx)
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
        };
        LedgerEntry {
            date: field(DATE_COL),
            memo: field(MEMO_COL),
            num: field(NUM_COL),
            source_name: field(SOURCE_NAME_COL),
            qty: field(QTY_COL).as_deref().and_then(parse_leading_int),
        }
    }

    /// True only when every text field is empty or absent *and* qty is zero
    /// or unparsed. A row with nothing but a quantity is kept.
    pub fn is_blank(&self) -> bool {
        let empty = |f: &Option<String>| f.as_deref().map_or(true, str::is_empty);
        empty(&self.date)
            && empty(&self.memo)
            && empty(&self.num)
            && empty(&self.source_name)
            && self.qty_or_zero() == 0
    }

    pub fn qty_or_zero(&self) -> i64 {
        self.qty.unwrap_or(0)
    }
}

/// Integer prefix of `raw`: leading whitespace, an optional sign, then as many
/// ASCII digits as follow. `"7.5"` gives 7, `"12 units"` gives 12, and text
/// without leading digits gives `None`.
pub fn parse_leading_int(raw: &str) -> Option<i64> {
    let s = raw.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit);
    let mut seen = false;
    let mut value: i64 = 0;
    for d in digits {
        seen = true;
        value = value.saturating_mul(10).saturating_add(i64::from(d - b'0'));
    }
    if !seen {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Outcome of one successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub table: String,
    pub inserted: usize,
    pub skipped: usize,
}

impl IngestReport {
    pub fn message(&self) -> String {
        format!("Inserted {} rows into '{}'.", self.inserted, self.table)
    }
}

/// Load a staged CSV upload into `table`.
///
/// - Fails with a validation error when either input is missing.
/// - Creates the table with the fixed ledger shape if it does not exist.
/// - Skips the first [`SKIPPED_LEADING_ROWS`] records, then inserts every
///   record that is not blank (see [`LedgerEntry::is_blank`]).
///
/// Inserts are not wrapped in a transaction: rows written before a parse or
/// insert error stay in the table. The staged file is removed on every path.
#[tracing::instrument(level = "info", skip_all, fields(table = table.unwrap_or("")))]
pub fn ingest(
    store: &Store,
    table: Option<&str>,
    upload: Option<StagedUpload>,
) -> ServiceResult<IngestReport> {
    let (table, upload) = match (table.filter(|t| !t.is_empty()), upload) {
        (Some(t), Some(u)) => (t, u),
        _ => {
            return Err(ServiceError::Validation(
                "table name and CSV file are required".into(),
            ))
        }
    };
    let result = ingest_staged(store, table, &upload);
    upload.remove();
    result
}

fn ingest_staged(
    store: &Store,
    table: &str,
    upload: &StagedUpload,
) -> ServiceResult<IngestReport> {
    let table = Ident::new(table)?;
    let conn = store.connection()?;
    store::ensure_table(&conn, &table)?;

    let report = insert_rows(&conn, &table, upload.path())?;
    info!(
        table = %report.table,
        inserted = report.inserted,
        skipped = report.skipped,
        bytes = upload.len(),
        "ingested CSV upload"
    );
    Ok(report)
}

/// Headerless, ragged-row CSV reading.
fn csv_reader_builder() -> ReaderBuilder {
    let mut builder = ReaderBuilder::new();
    builder.has_headers(false).flexible(true);
    builder
}

fn insert_rows(conn: &Connection, table: &Ident, path: &Path) -> ServiceResult<IngestReport> {
    let rdr = csv_reader_builder().from_path(path)?;
    insert_records(conn, table, rdr)
}

fn insert_records<R: Read>(
    conn: &Connection,
    table: &Ident,
    mut rdr: Reader<R>,
) -> ServiceResult<IngestReport> {
    let mut stmt = conn.prepare(&store::insert_entry_sql(table))?;

    let mut inserted = 0;
    let mut skipped = 0;
    for (idx, result) in rdr.byte_records().enumerate() {
        let row_number = idx + 1;
        let record = result?;
        if row_number <= SKIPPED_LEADING_ROWS {
            continue;
        }

        let entry = LedgerEntry::from_record(&record);
        if entry.is_blank() {
            trace!(row = row_number, "skipping blank row");
            skipped += 1;
            continue;
        }

        stmt.execute(params![
            entry.date,
            entry.memo,
            entry.num,
            entry.source_name,
            entry.qty_or_zero()
        ])
        .map_err(|source| ServiceError::Insert {
            table: table.to_string(),
            row: row_number,
            source,
        })?;
        inserted += 1;
    }

    Ok(IngestReport {
        table: table.to_string(),
        inserted,
        skipped,
    })
}
