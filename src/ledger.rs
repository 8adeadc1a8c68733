// ENCLAVE-BENCH RESULTS LEDGER
// COLUMN NAME -> ORDERED VALUE LIST. APPEND-ONLY. PERSISTED AS A JSON OBJECT
// BETWEEN INVOCATIONS SO COMPLETED SYSTEMS CAN BE SKIPPED ON RESTART.
//
// INVARIANT: EVERY COLUMN HOLDS EXACTLY `rows` CELLS AFTER EVERY APPEND.
// A COLUMN FIRST SEEN MID-RUN IS BACKFILLED WITH EMPTY CELLS; A COLUMN
// MISSING FROM A ROW GETS AN EMPTY CELL.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const SYSTEM_COLUMN: &str = "system";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Int(i64),
    Float(f64),
    Label(String),
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for Cell {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Self::Label(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Self::Label(v)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Label(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger {path} is not a column map: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger {path}: column '{column}' has {found} entries, expected {expected}")]
    Ragged {
        path: PathBuf,
        column: String,
        found: usize,
        expected: usize,
    },

    #[error("row sets column '{0}' twice")]
    DuplicateColumn(String),
}

// ONE ROW, COLUMNS IN THE ORDER THEY WERE SET
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultRow {
    cells: Vec<(String, Cell)>,
}

impl ResultRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, cell: impl Into<Cell>) {
        self.cells.push((column.into(), cell.into()));
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.cells.iter().map(|(c, v)| (c.as_str(), v))
    }
}

struct Column {
    name: String,
    values: Vec<Option<Cell>>,
}

#[derive(Default)]
pub struct ResultLedger {
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    rows: usize,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // A MISSING FILE IS A FRESH LEDGER
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let parse_err = |source| LedgerError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let map: Map<String, Value> = serde_json::from_str(&raw).map_err(parse_err)?;

        let mut ledger = Self::new();
        let mut expected: Option<usize> = None;
        for (name, values) in map {
            let values: Vec<Option<Cell>> = serde_json::from_value(values).map_err(parse_err)?;
            let expect = *expected.get_or_insert(values.len());
            if values.len() != expect {
                return Err(LedgerError::Ragged {
                    path: path.to_path_buf(),
                    column: name,
                    found: values.len(),
                    expected: expect,
                });
            }
            ledger.index.insert(name.clone(), ledger.columns.len());
            ledger.columns.push(Column { name, values });
        }
        ledger.rows = expected.unwrap_or(0);
        Ok(ledger)
    }

    // WRITE TO A SIBLING TEMP FILE, THEN RENAME OVER THE TARGET
    pub fn persist(&self, path: &Path) -> Result<(), LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut map = Map::new();
        for col in &self.columns {
            let values = serde_json::to_value(&col.values).map_err(|source| LedgerError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            map.insert(col.name.clone(), values);
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(map)).map_err(|source| {
            LedgerError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("ledger");
        let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn append_row(&mut self, row: ResultRow) -> Result<(), LedgerError> {
        let mut seen = BTreeSet::new();
        for (name, _) in row.iter() {
            if !seen.insert(name) {
                return Err(LedgerError::DuplicateColumn(name.to_string()));
            }
        }

        let mut slots: Vec<Option<Cell>> = vec![None; self.columns.len()];
        for (name, cell) in row.cells {
            let idx = match self.index.get(&name) {
                Some(&idx) => idx,
                None => {
                    // NEW COLUMN DISCOVERED: BACKFILL EARLIER ROWS
                    let idx = self.columns.len();
                    self.columns.push(Column {
                        name: name.clone(),
                        values: vec![None; self.rows],
                    });
                    self.index.insert(name, idx);
                    slots.push(None);
                    idx
                }
            };
            slots[idx] = Some(cell);
        }

        for (col, slot) in self.columns.iter_mut().zip(slots) {
            col.values.push(slot);
        }
        self.rows += 1;
        debug_assert!(self.columns.iter().all(|c| c.values.len() == self.rows));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&[Option<Cell>]> {
        self.index.get(name).map(|&i| self.columns[i].values.as_slice())
    }

    // CELLS OF ROW `i` IN COLUMN ORDER
    pub fn row(&self, i: usize) -> Option<Vec<Option<&Cell>>> {
        if i >= self.rows {
            return None;
        }
        Some(self.columns.iter().map(|c| c.values[i].as_ref()).collect())
    }

    // SYSTEMS ALREADY RECORDED. A RESTARTED SWEEP SKIPS THESE.
    pub fn systems(&self) -> BTreeSet<String> {
        self.column(SYSTEM_COLUMN)
            .into_iter()
            .flatten()
            .flatten()
            .map(|c| c.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Cell)]) -> ResultRow {
        let mut r = ResultRow::new();
        for (k, v) in pairs {
            r.push(*k, v.clone());
        }
        r
    }

    fn assert_rectangular(ledger: &ResultLedger) {
        for name in ledger.column_names() {
            assert_eq!(ledger.column(name).unwrap().len(), ledger.len(), "column {name}");
        }
    }

    #[test]
    fn append_keeps_columns_even() {
        let mut ledger = ResultLedger::new();
        ledger
            .append_row(row(&[("system", "native".into()), ("read-iops", Cell::Int(10))]))
            .unwrap();
        ledger
            .append_row(row(&[("system", "sgx-io".into()), ("read-iops", Cell::Int(20))]))
            .unwrap();
        assert_eq!(ledger.len(), 2);
        assert_rectangular(&ledger);
        assert_eq!(
            ledger.column("read-iops").unwrap(),
            &[Some(Cell::Int(10)), Some(Cell::Int(20))]
        );
    }

    #[test]
    fn new_column_mid_run_is_backfilled() {
        let mut ledger = ResultLedger::new();
        ledger.append_row(row(&[("system", "native".into())])).unwrap();
        ledger
            .append_row(row(&[("system", "scone".into()), ("write-bw", Cell::Float(1.5))]))
            .unwrap();
        assert_rectangular(&ledger);
        assert_eq!(
            ledger.column("write-bw").unwrap(),
            &[None, Some(Cell::Float(1.5))]
        );
    }

    #[test]
    fn column_missing_from_row_gets_empty_cell() {
        let mut ledger = ResultLedger::new();
        ledger
            .append_row(row(&[("system", "native".into()), ("trim-iops", Cell::Int(3))]))
            .unwrap();
        ledger.append_row(row(&[("system", "sgx-lkl".into())])).unwrap();
        assert_rectangular(&ledger);
        assert_eq!(ledger.column("trim-iops").unwrap()[1], None);
    }

    #[test]
    fn duplicate_column_rejected_without_mutation() {
        let mut ledger = ResultLedger::new();
        let err = ledger
            .append_row(row(&[("a", Cell::Int(1)), ("a", Cell::Int(2))]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateColumn(c) if c == "a"));
        assert!(ledger.is_empty());
        assert_eq!(ledger.column_names().count(), 0);
    }

    #[test]
    fn persist_and_reload_preserves_order_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fio.json");

        let mut ledger = ResultLedger::new();
        ledger
            .append_row(row(&[("system", "native".into()), ("job", Cell::Int(0))]))
            .unwrap();
        ledger
            .append_row(row(&[
                ("system", "sgx-io".into()),
                ("job", Cell::Int(0)),
                ("read-lat-mean", Cell::Float(2.25)),
            ]))
            .unwrap();
        ledger.persist(&path).unwrap();

        let back = ResultLedger::load(&path).unwrap();
        assert_eq!(back.len(), 2);
        let names: Vec<&str> = back.column_names().collect();
        assert_eq!(names, vec!["system", "job", "read-lat-mean"]);
        assert_eq!(back.column("read-lat-mean").unwrap()[0], None);
        assert_eq!(back.column("read-lat-mean").unwrap()[1], Some(Cell::Float(2.25)));
        let systems: Vec<String> = back.systems().into_iter().collect();
        assert_eq!(systems, vec!["native".to_string(), "sgx-io".to_string()]);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ResultLedger::load(&dir.path().join("absent.json")).unwrap();
        assert!(ledger.is_empty());
        assert!(ledger.systems().is_empty());
    }

    #[test]
    fn ragged_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"system": ["a", "b"], "job": [0]}"#).unwrap();
        assert!(matches!(
            ResultLedger::load(&path),
            Err(LedgerError::Ragged { found: 1, expected: 2, .. })
        ));
    }

    #[test]
    fn row_accessor_follows_column_order() {
        let mut ledger = ResultLedger::new();
        ledger
            .append_row(row(&[("system", "native".into()), ("job", Cell::Int(1))]))
            .unwrap();
        let r = ledger.row(0).unwrap();
        assert_eq!(r, vec![Some(&Cell::from("native")), Some(&Cell::Int(1))]);
        assert!(ledger.row(1).is_none());
    }
}
