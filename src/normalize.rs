// ENCLAVE-BENCH RESULT NORMALIZER
// FLATTENS EXTRACTED RESULT DOCUMENTS INTO LEDGER ROWS.
//
// STORAGE DOCUMENTS: ONE ROW PER SUB-JOB. PER-OPERATION METRIC GROUPS ARE
// FLATTENED EXACTLY ONE LEVEL:
//   read.iops            -> "read-iops"
//   read.lat_ns.mean     -> "read-lat_ns-mean"
// ANYTHING DEEPER IS A DATA-SHAPE VIOLATION.
//
// ALL ROWS OF A DOCUMENT ARE BUILT BEFORE ANY IS APPENDED, SO A BAD
// DOCUMENT NEVER LEAVES A PARTIAL RESULT IN THE LEDGER.

use serde_json::Value;
use thiserror::Error;

use crate::ledger::{Cell, LedgerError, ResultLedger, ResultRow, SYSTEM_COLUMN};

pub const OPERATIONS: [&str; 3] = ["read", "write", "trim"];
pub const JOB_COLUMN: &str = "job";
pub const DIRECTION_COLUMN: &str = "direction";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("document has no '{0}' list")]
    MissingList(&'static str),

    #[error("job {job} has no '{op}' group")]
    MissingOperation { job: usize, op: &'static str },

    #[error("'{path}' is not an object")]
    NotAGroup { path: String },

    #[error("metric '{path}' is nested more than one level deep")]
    TooDeep { path: String },

    #[error("metric '{path}' is not a scalar")]
    NotScalar { path: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn scalar(value: &Value, path: &str) -> Result<Cell, NormalizeError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Cell::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Cell::Float(f))
            } else {
                Err(NormalizeError::NotScalar { path: path.to_string() })
            }
        }
        Value::String(s) => Ok(Cell::Label(s.clone())),
        Value::Bool(b) => Ok(Cell::Label(b.to_string())),
        Value::Null | Value::Array(_) | Value::Object(_) => {
            Err(NormalizeError::NotScalar { path: path.to_string() })
        }
    }
}

fn flatten_operation(row: &mut ResultRow, op: &str, group: &Value) -> Result<(), NormalizeError> {
    let metrics = group
        .as_object()
        .ok_or_else(|| NormalizeError::NotAGroup { path: op.to_string() })?;

    for (metric_name, metric) in metrics {
        let column = format!("{op}-{metric_name}");
        match metric {
            Value::Object(sub) => {
                for (name, submetric) in sub {
                    let column = format!("{column}-{name}");
                    if submetric.is_object() || submetric.is_array() {
                        return Err(NormalizeError::TooDeep { path: column });
                    }
                    let cell = scalar(submetric, &column)?;
                    row.push(column, cell);
                }
            }
            other => {
                let cell = scalar(other, &column)?;
                row.push(column, cell);
            }
        }
    }
    Ok(())
}

// BUILD ROWS FOR EVERY SUB-JOB WITHOUT TOUCHING THE LEDGER
pub fn storage_rows(doc: &Value, system: &str) -> Result<Vec<ResultRow>, NormalizeError> {
    let jobs = doc
        .get("jobs")
        .and_then(Value::as_array)
        .ok_or(NormalizeError::MissingList("jobs"))?;

    let mut rows = Vec::with_capacity(jobs.len());
    for (jobnum, job) in jobs.iter().enumerate() {
        let mut row = ResultRow::new();
        row.push(SYSTEM_COLUMN, system);
        row.push(JOB_COLUMN, jobnum);
        for op in OPERATIONS {
            let group = job
                .get(op)
                .ok_or(NormalizeError::MissingOperation { job: jobnum, op })?;
            flatten_operation(&mut row, op, group)?;
        }
        rows.push(row);
    }
    Ok(rows)
}

pub fn append_storage(
    doc: &Value,
    system: &str,
    ledger: &mut ResultLedger,
) -> Result<usize, NormalizeError> {
    let rows = storage_rows(doc, system)?;
    let n = rows.len();
    for row in rows {
        ledger.append_row(row)?;
    }
    Ok(n)
}

// THROUGHPUT DOCUMENTS: ONE ROW PER REPORTING INTERVAL, STREAMS SUMMED,
// END-OF-RUN CPU UTILIZATION REPEATED ON EVERY ROW.
pub fn throughput_rows(
    doc: &Value,
    direction: &str,
    system: &str,
) -> Result<Vec<ResultRow>, NormalizeError> {
    let cpu = doc
        .get("end")
        .and_then(|e| e.get("cpu_utilization_percent"))
        .and_then(Value::as_object)
        .ok_or_else(|| NormalizeError::NotAGroup {
            path: "end.cpu_utilization_percent".to_string(),
        })?;
    let intervals = doc
        .get("intervals")
        .and_then(Value::as_array)
        .ok_or(NormalizeError::MissingList("intervals"))?;

    let mut rows = Vec::with_capacity(intervals.len());
    for (i, interval) in intervals.iter().enumerate() {
        let mut row = ResultRow::new();
        for (key, value) in cpu {
            let column = format!("cpu_{key}");
            let cell = scalar(value, &column)?;
            row.push(column, cell);
        }

        let streams = interval
            .get("streams")
            .and_then(Value::as_array)
            .ok_or(NormalizeError::MissingList("streams"))?;
        let mut moved_bytes = 0i64;
        let mut seconds = 0f64;
        for (s, stream) in streams.iter().enumerate() {
            let path = format!("intervals[{i}].streams[{s}]");
            moved_bytes += stream
                .get("bytes")
                .and_then(Value::as_i64)
                .ok_or_else(|| NormalizeError::NotScalar { path: format!("{path}.bytes") })?;
            seconds += stream
                .get("seconds")
                .and_then(Value::as_f64)
                .ok_or_else(|| NormalizeError::NotScalar { path: format!("{path}.seconds") })?;
        }

        row.push(SYSTEM_COLUMN, system);
        row.push("bytes", Cell::Int(moved_bytes));
        row.push("seconds", Cell::Float(seconds));
        row.push(DIRECTION_COLUMN, direction);
        rows.push(row);
    }
    Ok(rows)
}

pub fn append_throughput(
    doc: &Value,
    direction: &str,
    system: &str,
    ledger: &mut ResultLedger,
) -> Result<usize, NormalizeError> {
    let rows = throughput_rows(doc, direction, system)?;
    let n = rows.len();
    for row in rows {
        ledger.append_row(row)?;
    }
    Ok(n)
}
