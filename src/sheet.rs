//! Row-per-rate CSV sheets for bulk export and import.
//!
//! Columns: `id,unit_id,stay_from,stay_to,nights,value,book_from,book_to`.
//! Dates are ISO `YYYY-MM-DD`; an empty `book_to` marks an active rate.

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_IMPORT_ROWS;
use crate::model::{NewRate, Rate};

pub const HEADER: [&str; 8] = [
    "id", "unit_id", "stay_from", "stay_to", "nights", "value", "book_from", "book_to",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetRow {
    /// Written on export, ignored on import.
    pub id: Option<Ulid>,
    pub unit_id: Ulid,
    pub stay_from: NaiveDate,
    pub stay_to: NaiveDate,
    pub nights: u32,
    pub value: f64,
    pub book_from: Option<NaiveDate>,
    pub book_to: Option<NaiveDate>,
}

impl From<&Rate> for SheetRow {
    fn from(rate: &Rate) -> Self {
        Self {
            id: Some(rate.id),
            unit_id: rate.unit_id,
            stay_from: rate.stay.from,
            stay_to: rate.stay.to,
            nights: rate.nights,
            value: rate.value,
            book_from: Some(rate.booking.opens()),
            book_to: rate.booking.closes(),
        }
    }
}

impl From<SheetRow> for NewRate {
    fn from(row: SheetRow) -> Self {
        NewRate {
            unit_id: row.unit_id,
            stay_from: row.stay_from,
            stay_to: row.stay_to,
            nights: row.nights,
            value: row.value,
            book_from: row.book_from,
            book_to: row.book_to,
        }
    }
}

#[derive(Debug)]
pub enum SheetError {
    Io(io::Error),
    /// Unreadable file or a row that does not parse. Nothing was imported.
    Csv(csv::Error),
    /// The engine refused a row. `row` is 1-based, header excluded; earlier
    /// rows stay committed.
    Rejected { row: usize, error: EngineError },
    LimitExceeded(&'static str),
    /// A sheet path that is absolute or climbs out of the sheet directory.
    OutsideSheetDir(PathBuf),
}

impl std::fmt::Display for SheetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SheetError::Io(e) => write!(f, "sheet I/O error: {e}"),
            SheetError::Csv(e) => write!(f, "malformed sheet: {e}"),
            SheetError::Rejected { row, error } => write!(f, "row {row} rejected: {error}"),
            SheetError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            SheetError::OutsideSheetDir(path) => {
                write!(f, "sheet path {} must be a relative name inside the data directory", path.display())
            }
        }
    }
}

impl std::error::Error for SheetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SheetError::Io(e) => Some(e),
            SheetError::Csv(e) => Some(e),
            SheetError::Rejected { error, .. } => Some(error),
            SheetError::LimitExceeded(_) | SheetError::OutsideSheetDir(_) => None,
        }
    }
}

impl From<io::Error> for SheetError {
    fn from(e: io::Error) -> Self {
        SheetError::Io(e)
    }
}

impl From<csv::Error> for SheetError {
    fn from(e: csv::Error) -> Self {
        SheetError::Csv(e)
    }
}

/// Write every record (active and closed) as one row. Returns the row count.
pub async fn export_csv<W: io::Write>(engine: &Engine, writer: W) -> Result<usize, SheetError> {
    let rates = engine.list_rates().await;
    // Header written by hand so an empty sheet still carries it.
    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    wtr.write_record(HEADER)?;
    for rate in &rates {
        wtr.serialize(SheetRow::from(rate))?;
    }
    wtr.flush()?;
    Ok(rates.len())
}

/// Parse a whole sheet up front so a malformed file changes nothing.
pub fn read_rows<R: io::Read>(reader: R) -> Result<Vec<SheetRow>, SheetError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for rec in rdr.deserialize::<SheetRow>() {
        if rows.len() >= MAX_IMPORT_ROWS {
            return Err(SheetError::LimitExceeded("too many rows in sheet"));
        }
        rows.push(rec?);
    }
    Ok(rows)
}

/// Create one rate per row through the normal creation path, in file order.
/// Stops at the first rejected row. Returns the number of rows imported.
pub async fn import_csv<R: io::Read>(engine: &Engine, reader: R) -> Result<usize, SheetError> {
    let rows = read_rows(reader)?;
    let total = rows.len();
    for (i, row) in rows.into_iter().enumerate() {
        engine
            .create_rate(row.into())
            .await
            .map_err(|error| SheetError::Rejected { row: i + 1, error })?;
    }
    Ok(total)
}

/// Resolve a client-supplied sheet name under `dir`. Only plain relative
/// names are accepted: no root, drive prefix or `..`.
pub fn resolve_in(dir: &Path, name: &Path) -> Result<PathBuf, SheetError> {
    let mut resolved = dir.to_path_buf();
    let mut named = false;
    for component in name.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                named = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SheetError::OutsideSheetDir(name.to_path_buf()));
            }
        }
    }
    if !named {
        return Err(SheetError::OutsideSheetDir(name.to_path_buf()));
    }
    Ok(resolved)
}

pub async fn export_file(engine: &Engine, path: &Path) -> Result<usize, SheetError> {
    let count = export_csv(engine, File::create(path)?).await?;
    info!("exported {count} rates to {}", path.display());
    Ok(count)
}

pub async fn import_file(engine: &Engine, path: &Path) -> Result<usize, SheetError> {
    let count = import_csv(engine, File::open(path)?).await?;
    info!("imported {count} rates from {}", path.display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Rejection;
    use crate::model::day;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("ratebook_test_sheet");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn new_rate(unit_id: Ulid, from: NaiveDate, to: NaiveDate, value: f64) -> NewRate {
        NewRate {
            unit_id,
            stay_from: from,
            stay_to: to,
            nights: 1,
            value,
            book_from: Some(day(2025, 1, 1)),
            book_to: None,
        }
    }

    #[tokio::test]
    async fn export_writes_header_and_rows() {
        let engine = Engine::new(test_wal_path("export.wal")).unwrap();
        let uid = Ulid::new();
        engine
            .create_rate(new_rate(uid, day(2025, 3, 1), day(2025, 3, 31), 3000.0))
            .await
            .unwrap();

        let mut out = Vec::new();
        assert_eq!(export_csv(&engine, &mut out).await.unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("id,unit_id,stay_from,stay_to,nights,value,book_from,book_to"));
        let row = lines.next().unwrap();
        assert!(row.contains(",2025-03-01,2025-03-31,1,3000"), "{row}");
        assert!(row.ends_with(",2025-01-01,"), "{row}");
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn empty_export_still_has_header() {
        let engine = Engine::new(test_wal_path("export_empty.wal")).unwrap();
        let mut out = Vec::new();
        assert_eq!(export_csv(&engine, &mut out).await.unwrap(), 0);
        assert_eq!(String::from_utf8(out).unwrap().trim_end(), HEADER.join(","));
    }

    #[tokio::test]
    async fn import_routes_rows_through_create() {
        let engine = Engine::new(test_wal_path("import.wal")).unwrap();
        let uid = Ulid::new();
        // second row splits the first; ids in the file are ignored
        let sheet = format!(
            "id,unit_id,stay_from,stay_to,nights,value,book_from,book_to\n\
             {},{uid},2025-03-01,2025-03-31,1,3000,2025-01-01,\n\
             ,{uid},2025-03-10,2025-03-20,2,7000,2025-02-01,\n",
            Ulid::new()
        );

        assert_eq!(import_csv(&engine, sheet.as_bytes()).await.unwrap(), 2);

        let active = engine.active_rates(uid).await;
        let values: Vec<f64> = active.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![3000.0, 3500.0, 3000.0]);
        assert_eq!(engine.list_unit_rates(uid).await.len(), 4);
    }

    #[tokio::test]
    async fn import_stops_at_first_rejected_row() {
        let engine = Engine::new(test_wal_path("import_rejected.wal")).unwrap();
        let uid = Ulid::new();
        let sheet = format!(
            "id,unit_id,stay_from,stay_to,nights,value,book_from,book_to\n\
             ,{uid},2025-03-01,2025-03-31,1,3000,2025-01-01,\n\
             ,{uid},2025-04-30,2025-04-01,1,3000,2025-01-01,\n\
             ,{uid},2025-05-01,2025-05-31,1,3000,2025-01-01,\n"
        );

        match import_csv(&engine, sheet.as_bytes()).await {
            Err(SheetError::Rejected { row, error }) => {
                assert_eq!(row, 2);
                assert!(matches!(error, EngineError::InvalidInput(Rejection::StayRangeInverted)));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(engine.list_unit_rates(uid).await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_sheet_imports_nothing() {
        let engine = Engine::new(test_wal_path("import_malformed.wal")).unwrap();
        let uid = Ulid::new();
        let sheet = format!(
            "id,unit_id,stay_from,stay_to,nights,value,book_from,book_to\n\
             ,{uid},2025-03-01,2025-03-31,1,3000,2025-01-01,\n\
             ,{uid},not-a-date,2025-04-30,1,3000,2025-01-01,\n"
        );

        assert!(matches!(import_csv(&engine, sheet.as_bytes()).await, Err(SheetError::Csv(_))));
        assert!(engine.list_rates().await.is_empty());
    }

    #[test]
    fn sheet_names_resolve_inside_the_directory() {
        let dir = Path::new("/srv/ratebook");
        assert_eq!(
            resolve_in(dir, Path::new("rates.csv")).unwrap(),
            PathBuf::from("/srv/ratebook/rates.csv")
        );
        assert_eq!(
            resolve_in(dir, Path::new("./exports/march.csv")).unwrap(),
            PathBuf::from("/srv/ratebook/exports/march.csv")
        );
        for name in ["/etc/passwd", "../rates.csv", "exports/../../rates.csv", ".", ""] {
            assert!(
                matches!(resolve_in(dir, Path::new(name)), Err(SheetError::OutsideSheetDir(_))),
                "{name} should be refused"
            );
        }
    }

    #[tokio::test]
    async fn file_roundtrip_into_fresh_engine() {
        let source = Engine::new(test_wal_path("roundtrip_src.wal")).unwrap();
        let uid = Ulid::new();
        source
            .create_rate(new_rate(uid, day(2025, 3, 1), day(2025, 3, 31), 3000.0))
            .await
            .unwrap();
        source
            .create_rate(new_rate(uid, day(2025, 5, 1), day(2025, 5, 31), 4000.0))
            .await
            .unwrap();

        let path = std::env::temp_dir().join("ratebook_test_sheet").join("roundtrip.csv");
        assert_eq!(export_file(&source, &path).await.unwrap(), 2);

        let target = Engine::new(test_wal_path("roundtrip_dst.wal")).unwrap();
        assert_eq!(import_file(&target, &path).await.unwrap(), 2);
        let quote = target
            .quote(uid, day(2025, 3, 30), day(2025, 3, 31), day(2025, 2, 1))
            .await
            .unwrap();
        assert_eq!(quote, 3000.0);
        assert_eq!(target.active_rates(uid).await.len(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
