//! SQLite catalog.
//!
//! One connection behind a mutex. Writes that must be atomic run in
//! `BEGIN IMMEDIATE` transactions so concurrent invocations sharing the
//! database file serialize on the write lock (bounded by the busy timeout).

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Params, Row, TransactionBehavior,
};

use dbflow_model::{
    CodeId, FileId, FormatError, InstrumentId, ProcessId, ProductId, Timebase, Version,
    VersionPart,
};

use super::{
    Catalog, CatalogError, CatalogResult, CodeRecord, FileFilter, FileRecord, InspectorRecord,
    InstrumentRecord, LeaseRecord, MissionRecord, NewFile, ProcessInput, ProcessRecord,
    ProductRecord, QueueEntry, StageFn,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS mission (
    mission_id INTEGER PRIMARY KEY CHECK (mission_id = 1),
    mission_name TEXT NOT NULL,
    rootdir TEXT NOT NULL,
    incoming_dir TEXT,
    error_dir TEXT
);
CREATE TABLE IF NOT EXISTS instrument (
    instrument_id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_name TEXT NOT NULL,
    satellite_name TEXT NOT NULL,
    UNIQUE (instrument_name, satellite_name)
);
CREATE TABLE IF NOT EXISTS product (
    product_id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_name TEXT NOT NULL UNIQUE,
    instrument_id INTEGER NOT NULL REFERENCES instrument(instrument_id),
    level REAL NOT NULL,
    format TEXT NOT NULL,
    relative_path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS process (
    process_id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_name TEXT NOT NULL UNIQUE,
    output_product INTEGER NOT NULL REFERENCES product(product_id),
    output_timebase TEXT NOT NULL,
    extra_params TEXT
);
CREATE TABLE IF NOT EXISTS process_input (
    process_id INTEGER NOT NULL REFERENCES process(process_id),
    product_id INTEGER NOT NULL REFERENCES product(product_id),
    optional INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (process_id, product_id)
);
CREATE TABLE IF NOT EXISTS related_process (
    process_id INTEGER NOT NULL REFERENCES process(process_id),
    related_id INTEGER NOT NULL REFERENCES process(process_id),
    PRIMARY KEY (process_id, related_id)
);
CREATE TABLE IF NOT EXISTS code (
    code_id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL REFERENCES process(process_id),
    filename TEXT NOT NULL UNIQUE,
    relative_path TEXT NOT NULL,
    code_start_date TEXT NOT NULL,
    code_stop_date TEXT NOT NULL,
    code_version TEXT NOT NULL,
    output_version TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS inspector (
    inspector_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    product_id INTEGER NOT NULL REFERENCES product(product_id),
    arguments TEXT,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS file (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    product_id INTEGER NOT NULL REFERENCES product(product_id),
    utc_file_date TEXT NOT NULL,
    utc_start_time TEXT NOT NULL,
    utc_stop_time TEXT NOT NULL,
    version TEXT NOT NULL,
    newest_version INTEGER NOT NULL DEFAULT 1,
    process_keyword TEXT,
    data_level REAL NOT NULL,
    shasum TEXT NOT NULL,
    file_create_date TEXT NOT NULL,
    exists_on_disk INTEGER NOT NULL DEFAULT 1,
    quality_comment TEXT,
    caveats TEXT,
    release_number INTEGER,
    verbose_provenance TEXT
);
CREATE INDEX IF NOT EXISTS idx_file_product_date
    ON file(product_id, utc_file_date, newest_version);
CREATE TABLE IF NOT EXISTS file_link (
    source_file INTEGER NOT NULL REFERENCES file(file_id),
    resulting_file INTEGER NOT NULL REFERENCES file(file_id),
    PRIMARY KEY (source_file, resulting_file)
);
CREATE TABLE IF NOT EXISTS file_code_link (
    resulting_file INTEGER PRIMARY KEY REFERENCES file(file_id),
    code_id INTEGER NOT NULL REFERENCES code(code_id)
);
CREATE TABLE IF NOT EXISTS processqueue (
    pos INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL UNIQUE,
    version_bump INTEGER
);
CREATE TABLE IF NOT EXISTS lease (
    scope INTEGER PRIMARY KEY,
    owner_id TEXT NOT NULL,
    pid INTEGER NOT NULL,
    hostname TEXT NOT NULL,
    started_at TEXT NOT NULL
);
";

const FILE_COLUMNS: &str = "f.file_id, f.filename, f.product_id, f.utc_file_date, \
    f.utc_start_time, f.utc_stop_time, f.version, f.newest_version, f.process_keyword, \
    f.data_level, f.shasum, f.file_create_date, f.exists_on_disk, f.quality_comment, \
    f.caveats, f.release_number, f.verbose_provenance";

const PRODUCT_COLUMNS: &str =
    "product_id, product_name, instrument_id, level, format, relative_path";

const PROCESS_COLUMNS: &str =
    "p.process_id, p.process_name, p.output_product, p.output_timebase, p.extra_params";

const CODE_COLUMNS: &str = "code_id, process_id, filename, relative_path, code_start_date, \
    code_stop_date, code_version, output_version, active";

/// Product definition for [`SqliteCatalog::add_product`].
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub instrument_id: InstrumentId,
    pub level: f64,
    pub format: String,
    pub relative_path: String,
}

/// Process definition for [`SqliteCatalog::add_process`].
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub name: String,
    pub output_product: ProductId,
    pub timebase: Timebase,
    pub extra_params: Option<String>,
    pub inputs: Vec<ProcessInput>,
}

/// Code definition for [`SqliteCatalog::add_code`].
#[derive(Debug, Clone)]
pub struct NewCode {
    pub process_id: ProcessId,
    pub filename: String,
    pub relative_path: String,
    pub start: NaiveDate,
    pub stop: NaiveDate,
    pub code_version: Version,
    pub output_version: Version,
    pub active: bool,
}

/// SQLite-backed catalog.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open (creating if needed) the catalog at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> CatalogResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    /// An in-memory catalog (for testing)
    pub fn in_memory() -> CatalogResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CatalogResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> CatalogResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CatalogError::Poisoned)
    }

    // --- reference data administration ---

    pub fn set_mission(&self, mission: &MissionRecord) -> CatalogResult<()> {
        self.conn()?.execute(
            "INSERT INTO mission (mission_id, mission_name, rootdir, incoming_dir, error_dir)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(mission_id) DO UPDATE SET
                mission_name = excluded.mission_name,
                rootdir = excluded.rootdir,
                incoming_dir = excluded.incoming_dir,
                error_dir = excluded.error_dir",
            params![
                mission.mission_name,
                mission.rootdir,
                mission.incoming_dir,
                mission.error_dir
            ],
        )?;
        Ok(())
    }

    pub fn add_instrument(&self, name: &str, satellite: &str) -> CatalogResult<InstrumentId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO instrument (instrument_name, satellite_name) VALUES (?1, ?2)",
            params![name, satellite],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_product(&self, product: &NewProduct) -> CatalogResult<ProductId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO product (product_name, instrument_id, level, format, relative_path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                product.name,
                product.instrument_id,
                product.level,
                product.format,
                product.relative_path
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_process(&self, process: &NewProcess) -> CatalogResult<ProcessId> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO process (process_name, output_product, output_timebase, extra_params)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                process.name,
                process.output_product,
                process.timebase.as_str(),
                process.extra_params
            ],
        )?;
        let process_id = tx.last_insert_rowid();
        for input in &process.inputs {
            tx.execute(
                "INSERT INTO process_input (process_id, product_id, optional) VALUES (?1, ?2, ?3)",
                params![process_id, input.product_id, input.optional],
            )?;
        }
        tx.commit()?;
        Ok(process_id)
    }

    /// Declare two processes mutually exclusive.
    pub fn add_related_process(&self, a: ProcessId, b: ProcessId) -> CatalogResult<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO related_process (process_id, related_id) VALUES (?1, ?2)",
            params![a, b],
        )?;
        Ok(())
    }

    pub fn add_code(&self, code: &NewCode) -> CatalogResult<CodeId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO code (process_id, filename, relative_path, code_start_date,
                code_stop_date, code_version, output_version, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                code.process_id,
                code.filename,
                code.relative_path,
                code.start,
                code.stop,
                code.code_version.to_string(),
                code.output_version.to_string(),
                code.active
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_code_active(&self, code: CodeId, active: bool) -> CatalogResult<()> {
        let changed = self.conn()?.execute(
            "UPDATE code SET active = ?1 WHERE code_id = ?2",
            params![active, code],
        )?;
        if changed == 0 {
            return Err(CatalogError::not_found("code", code));
        }
        Ok(())
    }

    pub fn add_inspector(
        &self,
        name: &str,
        product: ProductId,
        arguments: Option<&str>,
    ) -> CatalogResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO inspector (name, product_id, arguments, active) VALUES (?1, ?2, ?3, 1)",
            params![name, product, arguments],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // --- helpers ---

    fn query_files<P: Params>(
        conn: &Connection,
        tail: &str,
        params: P,
    ) -> CatalogResult<Vec<FileRecord>> {
        let sql = format!("SELECT {} FROM file f {}", FILE_COLUMNS, tail);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn query_processes<P: Params>(
        conn: &Connection,
        tail: &str,
        params: P,
    ) -> CatalogResult<Vec<ProcessRecord>> {
        let sql = format!("SELECT {} FROM process p {}", PROCESS_COLUMNS, tail);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, process_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Set `newest_version` on the highest version(s) of one product, date
    /// and keyword series and clear it on the rest.
    fn recompute_newest(
        conn: &Connection,
        product: ProductId,
        date: NaiveDate,
        keyword: Option<&str>,
    ) -> CatalogResult<()> {
        let mut stmt = conn.prepare(
            "SELECT file_id, version FROM file
             WHERE product_id = ?1 AND utc_file_date = ?2 AND process_keyword IS ?3",
        )?;
        let rows: Vec<(FileId, Version)> = stmt
            .query_map(params![product, date, keyword], |row| {
                Ok((row.get(0)?, parse_col(row, 1)?))
            })?
            .collect::<Result<_, _>>()?;

        let max = rows.iter().map(|(_, v)| *v).max();
        for (file_id, version) in &rows {
            conn.execute(
                "UPDATE file SET newest_version = ?1 WHERE file_id = ?2",
                params![Some(*version) == max, file_id],
            )?;
        }
        Ok(())
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = FormatError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        filename: row.get(1)?,
        product_id: row.get(2)?,
        utc_file_date: row.get(3)?,
        utc_start_time: row.get(4)?,
        utc_stop_time: row.get(5)?,
        version: parse_col(row, 6)?,
        newest_version: row.get(7)?,
        process_keyword: row.get(8)?,
        data_level: row.get(9)?,
        shasum: row.get(10)?,
        file_create_date: row.get(11)?,
        exists_on_disk: row.get(12)?,
        quality_comment: row.get(13)?,
        caveats: row.get(14)?,
        release_number: row.get(15)?,
        verbose_provenance: row.get(16)?,
    })
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<ProductRecord> {
    Ok(ProductRecord {
        product_id: row.get(0)?,
        product_name: row.get(1)?,
        instrument_id: row.get(2)?,
        level: row.get(3)?,
        format: row.get(4)?,
        relative_path: row.get(5)?,
    })
}

fn process_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessRecord> {
    Ok(ProcessRecord {
        process_id: row.get(0)?,
        process_name: row.get(1)?,
        output_product: row.get(2)?,
        output_timebase: parse_col(row, 3)?,
        extra_params: row.get(4)?,
    })
}

fn code_from_row(row: &Row<'_>) -> rusqlite::Result<CodeRecord> {
    Ok(CodeRecord {
        code_id: row.get(0)?,
        process_id: row.get(1)?,
        filename: row.get(2)?,
        relative_path: row.get(3)?,
        code_start_date: row.get(4)?,
        code_stop_date: row.get(5)?,
        code_version: parse_col(row, 6)?,
        output_version: parse_col(row, 7)?,
        active: row.get(8)?,
    })
}

fn lease_from_row(row: &Row<'_>) -> rusqlite::Result<LeaseRecord> {
    Ok(LeaseRecord {
        scope: row.get(0)?,
        owner_id: row.get(1)?,
        pid: row.get(2)?,
        hostname: row.get(3)?,
        started_at: row.get(4)?,
    })
}

fn queue_entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let bump: Option<i64> = row.get(1)?;
    let version_bump = bump
        .map(VersionPart::try_from)
        .transpose()
        .map_err(|e| conversion_error(1, e))?;
    Ok(QueueEntry {
        file_id: row.get(0)?,
        version_bump,
    })
}

impl Catalog for SqliteCatalog {
    fn mission(&self) -> CatalogResult<MissionRecord> {
        self.conn()?
            .query_row(
                "SELECT mission_name, rootdir, incoming_dir, error_dir FROM mission
                 WHERE mission_id = 1",
                [],
                |row| {
                    Ok(MissionRecord {
                        mission_name: row.get(0)?,
                        rootdir: row.get(1)?,
                        incoming_dir: row.get(2)?,
                        error_dir: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| CatalogError::not_found("mission", "catalog has no mission row"))
    }

    fn instrument(&self, id: InstrumentId) -> CatalogResult<Option<InstrumentRecord>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT instrument_id, instrument_name, satellite_name FROM instrument
                 WHERE instrument_id = ?1",
                params![id],
                |row| {
                    Ok(InstrumentRecord {
                        instrument_id: row.get(0)?,
                        instrument_name: row.get(1)?,
                        satellite_name: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn instrument_by_name(&self, name: &str) -> CatalogResult<Option<InstrumentRecord>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT instrument_id, instrument_name, satellite_name FROM instrument
                 WHERE instrument_name = ?1 ORDER BY instrument_id LIMIT 1",
                params![name],
                |row| {
                    Ok(InstrumentRecord {
                        instrument_id: row.get(0)?,
                        instrument_name: row.get(1)?,
                        satellite_name: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn product(&self, id: ProductId) -> CatalogResult<Option<ProductRecord>> {
        let sql = format!("SELECT {} FROM product WHERE product_id = ?1", PRODUCT_COLUMNS);
        Ok(self
            .conn()?
            .query_row(&sql, params![id], product_from_row)
            .optional()?)
    }

    fn product_by_name(&self, name: &str) -> CatalogResult<Option<ProductRecord>> {
        let sql = format!("SELECT {} FROM product WHERE product_name = ?1", PRODUCT_COLUMNS);
        Ok(self
            .conn()?
            .query_row(&sql, params![name], product_from_row)
            .optional()?)
    }

    fn instrument_products(
        &self,
        id: InstrumentId,
        level: Option<f64>,
    ) -> CatalogResult<Vec<ProductRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM product WHERE instrument_id = ?1 AND (?2 IS NULL OR level = ?2)
             ORDER BY product_id",
            PRODUCT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![id, level], product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn process(&self, id: ProcessId) -> CatalogResult<Option<ProcessRecord>> {
        let conn = self.conn()?;
        Ok(Self::query_processes(&conn, "WHERE p.process_id = ?1", params![id])?
            .into_iter()
            .next())
    }

    fn process_by_name(&self, name: &str) -> CatalogResult<Option<ProcessRecord>> {
        let conn = self.conn()?;
        Ok(
            Self::query_processes(&conn, "WHERE p.process_name = ?1", params![name])?
                .into_iter()
                .next(),
        )
    }

    fn process_inputs(&self, id: ProcessId) -> CatalogResult<Vec<ProcessInput>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT product_id, optional FROM process_input WHERE process_id = ?1
             ORDER BY product_id",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(ProcessInput {
                    product_id: row.get(0)?,
                    optional: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn child_processes(&self, product: ProductId) -> CatalogResult<Vec<ProcessRecord>> {
        let conn = self.conn()?;
        Self::query_processes(
            &conn,
            "JOIN process_input i ON i.process_id = p.process_id
             WHERE i.product_id = ?1 ORDER BY p.process_id",
            params![product],
        )
    }

    fn processes_by_timebase(&self, timebase: Timebase) -> CatalogResult<Vec<ProcessRecord>> {
        let conn = self.conn()?;
        Self::query_processes(
            &conn,
            "WHERE p.output_timebase = ?1 ORDER BY p.process_id",
            params![timebase.as_str()],
        )
    }

    fn related_processes(&self, id: ProcessId) -> CatalogResult<Vec<ProcessId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT related_id FROM related_process WHERE process_id = ?1
             UNION
             SELECT process_id FROM related_process WHERE related_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<Vec<ProcessId>, _>>()?;
        Ok(rows.into_iter().filter(|r| *r != id).collect())
    }

    fn code(&self, id: CodeId) -> CatalogResult<Option<CodeRecord>> {
        let sql = format!("SELECT {} FROM code WHERE code_id = ?1", CODE_COLUMNS);
        Ok(self
            .conn()?
            .query_row(&sql, params![id], code_from_row)
            .optional()?)
    }

    fn code_by_name(&self, name: &str) -> CatalogResult<Option<CodeRecord>> {
        let sql = format!("SELECT {} FROM code WHERE filename = ?1", CODE_COLUMNS);
        Ok(self
            .conn()?
            .query_row(&sql, params![name], code_from_row)
            .optional()?)
    }

    fn active_code(
        &self,
        process: ProcessId,
        date: NaiveDate,
    ) -> CatalogResult<Option<CodeRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM code WHERE process_id = ?1 AND active = 1
             AND code_start_date <= ?2 AND code_stop_date >= ?2",
            CODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let codes = stmt
            .query_map(params![process, date], code_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        // highest code version wins, newest registration breaks ties
        Ok(codes
            .into_iter()
            .max_by_key(|c| (c.code_version, c.code_id)))
    }

    fn active_inspectors(&self) -> CatalogResult<Vec<InspectorRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT inspector_id, name, product_id, arguments, active FROM inspector
             WHERE active = 1 ORDER BY inspector_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(InspectorRecord {
                    inspector_id: row.get(0)?,
                    name: row.get(1)?,
                    product_id: row.get(2)?,
                    arguments: row.get(3)?,
                    active: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn file(&self, id: FileId) -> CatalogResult<Option<FileRecord>> {
        let conn = self.conn()?;
        Ok(Self::query_files(&conn, "WHERE f.file_id = ?1", params![id])?
            .into_iter()
            .next())
    }

    fn file_by_name(&self, name: &str) -> CatalogResult<Option<FileRecord>> {
        let conn = self.conn()?;
        Ok(Self::query_files(&conn, "WHERE f.filename = ?1", params![name])?
            .into_iter()
            .next())
    }

    fn newest_files_on(
        &self,
        product: ProductId,
        date: NaiveDate,
    ) -> CatalogResult<Vec<FileRecord>> {
        let conn = self.conn()?;
        Self::query_files(
            &conn,
            "WHERE f.product_id = ?1 AND f.utc_file_date = ?2 AND f.newest_version = 1
             ORDER BY f.file_id",
            params![product, date],
        )
    }

    fn newest_files_covering(
        &self,
        product: ProductId,
        date: NaiveDate,
    ) -> CatalogResult<Vec<FileRecord>> {
        let conn = self.conn()?;
        Self::query_files(
            &conn,
            "WHERE f.product_id = ?1 AND f.newest_version = 1
             AND min(date(f.utc_start_time), f.utc_file_date) <= ?2
             AND max(date(f.utc_stop_time), f.utc_file_date) >= ?2
             ORDER BY f.utc_start_time, f.file_id",
            params![product, date],
        )
    }

    fn select_files(&self, filter: &FileFilter) -> CatalogResult<Vec<FileRecord>> {
        let mut joins = String::new();
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if filter.instrument.is_some() || filter.level.is_some() {
            joins.push_str(" JOIN product p ON p.product_id = f.product_id");
        }
        if filter.code.is_some() {
            joins.push_str(" JOIN file_code_link c ON c.resulting_file = f.file_id");
        }

        if let Some(product) = filter.product {
            values.push(Value::Integer(product));
            clauses.push(format!("f.product_id = ?{}", values.len()));
        }
        if let Some(code) = filter.code {
            values.push(Value::Integer(code));
            clauses.push(format!("c.code_id = ?{}", values.len()));
        }
        if let Some(instrument) = filter.instrument {
            values.push(Value::Integer(instrument));
            clauses.push(format!("p.instrument_id = ?{}", values.len()));
        }
        if let Some(level) = filter.level {
            values.push(Value::Real(level));
            clauses.push(format!("p.level = ?{}", values.len()));
        }
        if let Some(start) = filter.range.start {
            values.push(Value::Text(start.format("%Y-%m-%d").to_string()));
            clauses.push(format!("f.utc_file_date >= ?{}", values.len()));
        }
        if let Some(end) = filter.range.end {
            values.push(Value::Text(end.format("%Y-%m-%d").to_string()));
            clauses.push(format!("f.utc_file_date <= ?{}", values.len()));
        }
        if filter.newest_only {
            clauses.push("f.newest_version = 1".to_string());
        }

        let mut tail = joins;
        if !clauses.is_empty() {
            tail.push_str(" WHERE ");
            tail.push_str(&clauses.join(" AND "));
        }
        tail.push_str(" ORDER BY f.utc_file_date, f.file_id");

        let conn = self.conn()?;
        Self::query_files(&conn, &tail, params_from_iter(values.iter()))
    }

    fn file_parents(&self, id: FileId) -> CatalogResult<Vec<FileId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_file FROM file_link WHERE resulting_file = ?1 ORDER BY source_file",
        )?;
        let rows = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<Vec<FileId>, _>>()?;
        Ok(rows)
    }

    fn file_code(&self, id: FileId) -> CatalogResult<Option<CodeId>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT code_id FROM file_code_link WHERE resulting_file = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn insert_file(&self, new: &NewFile, stage: &mut StageFn<'_>) -> CatalogResult<FileRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let d = &new.description;

        tx.execute(
            "INSERT INTO file (filename, product_id, utc_file_date, utc_start_time,
                utc_stop_time, version, newest_version, process_keyword, data_level, shasum,
                file_create_date, exists_on_disk, quality_comment, caveats, release_number,
                verbose_provenance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                d.filename,
                d.product_id,
                d.utc_file_date,
                d.utc_start_time,
                d.utc_stop_time,
                d.version.to_string(),
                d.process_keyword,
                d.data_level,
                d.shasum,
                d.file_create_date,
                d.exists_on_disk,
                d.quality_comment,
                d.caveats,
                d.release_number,
                d.verbose_provenance
            ],
        )?;
        let file_id = tx.last_insert_rowid();

        for parent in &new.parents {
            tx.execute(
                "INSERT OR IGNORE INTO file_link (source_file, resulting_file) VALUES (?1, ?2)",
                params![parent, file_id],
            )?;
        }
        if let Some(code) = new.code {
            tx.execute(
                "INSERT INTO file_code_link (resulting_file, code_id) VALUES (?1, ?2)",
                params![file_id, code],
            )?;
        }

        Self::recompute_newest(
            &tx,
            d.product_id,
            d.utc_file_date,
            d.process_keyword.as_deref(),
        )?;

        let record = Self::query_files(&tx, "WHERE f.file_id = ?1", params![file_id])?
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::not_found("file", file_id))?;

        // dropping the transaction on error rolls it back
        stage(&record)?;
        tx.commit()?;
        Ok(record)
    }

    fn queue_entries(&self) -> CatalogResult<Vec<QueueEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT file_id, version_bump FROM processqueue ORDER BY pos")?;
        let rows = stmt
            .query_map([], queue_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn queue_append(&self, entries: &[QueueEntry]) -> CatalogResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut added = 0;
        for entry in entries {
            added += tx.execute(
                "INSERT OR IGNORE INTO processqueue (file_id, version_bump) VALUES (?1, ?2)",
                params![entry.file_id, entry.version_bump.map(|p| p.index())],
            )?;
        }
        tx.commit()?;
        Ok(added)
    }

    fn queue_delete(&self, ids: &[FileId]) -> CatalogResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM processqueue WHERE file_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn queue_clear(&self) -> CatalogResult<usize> {
        Ok(self.conn()?.execute("DELETE FROM processqueue", [])?)
    }

    fn lease(&self, scope: ProcessId) -> CatalogResult<Option<LeaseRecord>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT scope, owner_id, pid, hostname, started_at FROM lease WHERE scope = ?1",
                params![scope],
                lease_from_row,
            )
            .optional()?)
    }

    fn leases(&self) -> CatalogResult<Vec<LeaseRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT scope, owner_id, pid, hostname, started_at FROM lease ORDER BY scope")?;
        let rows = stmt
            .query_map([], lease_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn lease_swap(
        &self,
        scope: ProcessId,
        expected_owner: Option<&str>,
        lease: &LeaseRecord,
    ) -> CatalogResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT owner_id FROM lease WHERE scope = ?1",
                params![scope],
                |row| row.get(0),
            )
            .optional()?;

        let free = match (current.as_deref(), expected_owner) {
            (None, _) => true,
            (Some(held), Some(expected)) => held == expected,
            (Some(_), None) => false,
        };
        if !free {
            return Ok(false);
        }

        tx.execute(
            "INSERT OR REPLACE INTO lease (scope, owner_id, pid, hostname, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![scope, lease.owner_id, lease.pid, lease.hostname, lease.started_at],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn lease_release(&self, scope: ProcessId, owner: Option<&str>) -> CatalogResult<bool> {
        let changed = self.conn()?.execute(
            "DELETE FROM lease WHERE scope = ?1 AND (?2 IS NULL OR owner_id = ?2)",
            params![scope, owner],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, Utc};
    use dbflow_inspector::{FileDescription, Inspection};
    use dbflow_model::DateRange;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seeded() -> (SqliteCatalog, ProductId, ProductId, ProcessId) {
        let catalog = SqliteCatalog::in_memory().unwrap();
        catalog
            .set_mission(&MissionRecord {
                mission_name: "testmission".into(),
                rootdir: "/data/testmission".into(),
                incoming_dir: None,
                error_dir: None,
            })
            .unwrap();
        let inst = catalog.add_instrument("mag", "sat1").unwrap();
        let raw = catalog
            .add_product(&NewProduct {
                name: "mag_l0".into(),
                instrument_id: inst,
                level: 0.0,
                format: "mag_l0_{Y}{m}{d}_v{VERSION}.dat".into(),
                relative_path: "mag/l0/{Y}".into(),
            })
            .unwrap();
        let l1 = catalog
            .add_product(&NewProduct {
                name: "mag_l1".into(),
                instrument_id: inst,
                level: 1.0,
                format: "mag_l1_{Y}{m}{d}_v{VERSION}.cdf".into(),
                relative_path: "mag/l1/{Y}".into(),
            })
            .unwrap();
        let process = catalog
            .add_process(&NewProcess {
                name: "mag_l0_to_l1".into(),
                output_product: l1,
                timebase: Timebase::File,
                extra_params: None,
                inputs: vec![ProcessInput {
                    product_id: raw,
                    optional: false,
                }],
            })
            .unwrap();
        (catalog, raw, l1, process)
    }

    fn describe(product: ProductId, name: &str, day: NaiveDate, version: Version) -> NewFile {
        let inspection = Inspection::for_day(day, version);
        FileDescription {
            filename: name.into(),
            product_id: product,
            data_level: 0.0,
            mission: "testmission".into(),
            utc_file_date: day,
            utc_start_time: inspection.utc_start_time,
            utc_stop_time: inspection.utc_stop_time,
            version,
            process_keyword: None,
            shasum: "0".repeat(64),
            file_create_date: NaiveDateTime::default(),
            exists_on_disk: true,
            quality_comment: None,
            caveats: None,
            release_number: None,
            verbose_provenance: None,
            inspector: "test".into(),
        }
        .into()
    }

    fn insert(catalog: &SqliteCatalog, new: &NewFile) -> CatalogResult<FileRecord> {
        catalog.insert_file(new, &mut |_| Ok(()))
    }

    #[test]
    fn test_insert_and_lookup() {
        let (catalog, raw, _, _) = seeded();
        let day = date(2013, 9, 4);
        let record = insert(&catalog, &describe(raw, "a_v1.dat", day, Version::new(1, 0, 0))).unwrap();

        assert!(record.newest_version);
        assert_eq!(catalog.file(record.file_id).unwrap().unwrap(), record);
        assert_eq!(catalog.file_by_name("a_v1.dat").unwrap().unwrap().file_id, record.file_id);
        assert!(catalog.file(9999).unwrap().is_none());
    }

    #[test]
    fn test_newer_version_supersedes() {
        let (catalog, raw, _, _) = seeded();
        let day = date(2013, 9, 4);
        let v1 = insert(&catalog, &describe(raw, "a_v1.dat", day, Version::new(1, 0, 0))).unwrap();
        let v2 = insert(&catalog, &describe(raw, "a_v2.dat", day, Version::new(1, 1, 0))).unwrap();

        assert!(!catalog.file(v1.file_id).unwrap().unwrap().newest_version);
        assert!(catalog.file(v2.file_id).unwrap().unwrap().newest_version);

        let newest = catalog.newest_files_on(raw, day).unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].file_id, v2.file_id);

        // an older version arriving late does not take over
        let late = insert(&catalog, &describe(raw, "a_v0.dat", day, Version::new(0, 9, 0))).unwrap();
        assert!(!catalog.file(late.file_id).unwrap().unwrap().newest_version);
    }

    #[test]
    fn test_duplicate_filename_is_integrity_error() {
        let (catalog, raw, _, _) = seeded();
        let new = describe(raw, "dup.dat", date(2013, 9, 4), Version::default());
        insert(&catalog, &new).unwrap();
        let err = insert(&catalog, &new).unwrap_err();
        assert!(err.is_integrity(), "{:?}", err);
    }

    #[test]
    fn test_stage_failure_rolls_back() {
        let (catalog, raw, _, _) = seeded();
        let new = describe(raw, "staged.dat", date(2013, 9, 4), Version::default());
        let err = catalog
            .insert_file(&new, &mut |_| Err(CatalogError::Staging("disk full".into())))
            .unwrap_err();
        assert!(matches!(err, CatalogError::Staging(_)));
        assert!(catalog.file_by_name("staged.dat").unwrap().is_none());
    }

    #[test]
    fn test_links_recorded() {
        let (catalog, raw, l1, process) = seeded();
        let day = date(2013, 9, 4);
        let parent = insert(&catalog, &describe(raw, "p.dat", day, Version::default())).unwrap();
        let code = catalog
            .add_code(&NewCode {
                process_id: process,
                filename: "l1.sh".into(),
                relative_path: "codes".into(),
                start: date(2000, 1, 1),
                stop: date(2100, 1, 1),
                code_version: Version::new(1, 0, 0),
                output_version: Version::new(1, 0, 0),
                active: true,
            })
            .unwrap();

        let mut child = describe(l1, "c.cdf", day, Version::default());
        child.parents = vec![parent.file_id];
        child.code = Some(code);
        let child = insert(&catalog, &child).unwrap();

        assert_eq!(catalog.file_parents(child.file_id).unwrap(), vec![parent.file_id]);
        assert_eq!(catalog.file_code(child.file_id).unwrap(), Some(code));

        let by_code = catalog
            .select_files(&FileFilter {
                code: Some(code),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_code.len(), 1);
        assert_eq!(by_code[0].file_id, child.file_id);
    }

    #[test]
    fn test_active_code_respects_dates_and_flag() {
        let (catalog, _, _, process) = seeded();
        let base = NewCode {
            process_id: process,
            filename: "old.sh".into(),
            relative_path: "codes".into(),
            start: date(2010, 1, 1),
            stop: date(2012, 12, 31),
            code_version: Version::new(1, 0, 0),
            output_version: Version::new(1, 0, 0),
            active: true,
        };
        let old = catalog.add_code(&base).unwrap();
        let new = catalog
            .add_code(&NewCode {
                filename: "new.sh".into(),
                start: date(2013, 1, 1),
                stop: date(2099, 12, 31),
                code_version: Version::new(2, 0, 0),
                ..base.clone()
            })
            .unwrap();

        assert_eq!(
            catalog.active_code(process, date(2011, 6, 1)).unwrap().unwrap().code_id,
            old
        );
        assert_eq!(
            catalog.active_code(process, date(2013, 6, 1)).unwrap().unwrap().code_id,
            new
        );
        catalog.set_code_active(new, false).unwrap();
        assert!(catalog.active_code(process, date(2013, 6, 1)).unwrap().is_none());
    }

    #[test]
    fn test_queue_table_dedups() {
        let (catalog, _, _, _) = seeded();
        let added = catalog
            .queue_append(&[
                QueueEntry::new(5, None),
                QueueEntry::new(6, Some(VersionPart::Quality)),
                QueueEntry::new(5, None),
            ])
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(
            catalog.queue_entries().unwrap(),
            vec![
                QueueEntry::new(5, None),
                QueueEntry::new(6, Some(VersionPart::Quality))
            ]
        );
        assert_eq!(catalog.queue_delete(&[5, 42]).unwrap(), 1);
        assert_eq!(catalog.queue_clear().unwrap(), 1);
        assert!(catalog.queue_entries().unwrap().is_empty());
    }

    #[test]
    fn test_lease_swap_semantics() {
        let (catalog, _, _, process) = seeded();
        let lease = |owner: &str| LeaseRecord {
            scope: process,
            owner_id: owner.into(),
            pid: 1,
            hostname: "host".into(),
            started_at: Utc::now(),
        };

        assert!(catalog.lease_swap(process, None, &lease("a")).unwrap());
        assert!(!catalog.lease_swap(process, None, &lease("b")).unwrap());
        assert!(!catalog.lease_swap(process, Some("x"), &lease("b")).unwrap());
        assert!(catalog.lease_swap(process, Some("a"), &lease("b")).unwrap());
        assert_eq!(catalog.lease(process).unwrap().unwrap().owner_id, "b");

        assert!(!catalog.lease_release(process, Some("a")).unwrap());
        assert!(catalog.lease_release(process, Some("b")).unwrap());
        assert!(catalog.leases().unwrap().is_empty());
    }

    #[test]
    fn test_select_files_by_range_and_level() {
        let (catalog, raw, l1, _) = seeded();
        for day in 1..=5 {
            insert(
                &catalog,
                &describe(raw, &format!("r{}.dat", day), date(2013, 1, day), Version::default()),
            )
            .unwrap();
        }
        insert(&catalog, &describe(l1, "l1.cdf", date(2013, 1, 3), Version::default())).unwrap();

        let range = DateRange::new(Some(date(2013, 1, 2)), Some(date(2013, 1, 4))).unwrap();
        let picked = catalog
            .select_files(&FileFilter {
                level: Some(0.0),
                range,
                newest_only: true,
                ..Default::default()
            })
            .unwrap();
        let names: Vec<_> = picked.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["r2.dat", "r3.dat", "r4.dat"]);
    }

    #[test]
    fn test_related_processes_symmetric() {
        let (catalog, raw, l1, process) = seeded();
        let other = catalog
            .add_process(&NewProcess {
                name: "other".into(),
                output_product: l1,
                timebase: Timebase::Daily,
                extra_params: None,
                inputs: vec![ProcessInput {
                    product_id: raw,
                    optional: true,
                }],
            })
            .unwrap();
        catalog.add_related_process(process, other).unwrap();
        assert_eq!(catalog.related_processes(process).unwrap(), vec![other]);
        assert_eq!(catalog.related_processes(other).unwrap(), vec![process]);
        assert_eq!(catalog.child_processes(raw).unwrap().len(), 2);
        assert_eq!(
            catalog.processes_by_timebase(Timebase::Daily).unwrap()[0].process_id,
            other
        );
    }

    #[test]
    fn test_missing_mission_is_not_found() {
        let catalog = SqliteCatalog::in_memory().unwrap();
        assert!(matches!(
            catalog.mission(),
            Err(CatalogError::NotFound { kind: "mission", .. })
        ));
    }
}
