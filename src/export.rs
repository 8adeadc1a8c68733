// ENCLAVE-BENCH TABULAR EXPORT
// TAB-SEPARATED DUMP OF THE LEDGER: HEADER ROW, THEN ONE LINE PER ENTRY.
// WRITTEN TWICE: <prefix>-<stamp>.tsv AND <prefix>-latest.tsv

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ledger::{Cell, ResultLedger};

const DELIM: char = '\t';

fn field(raw: &str) -> String {
    if raw.contains(DELIM) || raw.contains('\n') || raw.contains('\r') || raw.contains('"') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn cell_field(cell: Option<&Cell>) -> String {
    cell.map(|c| field(&c.to_string())).unwrap_or_default()
}

pub fn render_tsv(ledger: &ResultLedger) -> String {
    let mut out = String::new();
    let header: Vec<String> = ledger.column_names().map(field).collect();
    out.push_str(&header.join("\t"));
    out.push('\n');
    for i in 0..ledger.len() {
        if let Some(row) = ledger.row(i) {
            let line: Vec<String> = row.into_iter().map(cell_field).collect();
            out.push_str(&line.join("\t"));
            out.push('\n');
        }
    }
    out
}

// RETURNS (STAMPED PATH, LATEST PATH)
pub fn write_tsv(
    ledger: &ResultLedger,
    dir: &Path,
    prefix: &str,
    stamp: &str,
) -> Result<(PathBuf, PathBuf)> {
    let text = render_tsv(ledger);
    let stamped = dir.join(format!("{prefix}-{stamp}.tsv"));
    let latest = dir.join(format!("{prefix}-latest.tsv"));
    fs::write(&stamped, &text).with_context(|| format!("writing {}", stamped.display()))?;
    fs::write(&latest, &text).with_context(|| format!("writing {}", latest.display()))?;
    Ok((stamped, latest))
}
