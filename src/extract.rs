// ENCLAVE-BENCH EMBEDDED-DOCUMENT EXTRACTOR
// ISOLATES ONE JSON OBJECT FROM A LIVE LINE STREAM. THE OBJECT IS BOUNDED
// BY A LINE THAT IS EXACTLY "{" AND A LINE THAT IS EXACTLY "}".
// LINES BEFORE THE OPENING DELIMITER ARE PROGRESS TEXT AND ARE DROPPED.
// CONSUMPTION STOPS ON THE CLOSING DELIMITER; LATER LINES ARE NEVER READ.

use std::io;

use serde_json::Value;
use thiserror::Error;

const OPEN: &str = "{";
const CLOSE: &str = "}";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("did not get a result when running benchmark for {run}")]
    NoDocument { run: String },

    #[error("result document for {run} was cut off after {lines} lines")]
    Truncated { run: String, lines: usize },

    #[error("result document for {run} is malformed: {source}")]
    Malformed {
        run: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("reading output of {run} failed: {source}")]
    Io {
        run: String,
        #[source]
        source: io::Error,
    },
}

enum ScanState {
    Seeking,
    Capturing { buf: String, lines: usize },
}

fn strip_newline(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

// RETURNS THE RAW DOCUMENT TEXT, DELIMITER LINES INCLUDED
pub fn capture_document<I>(lines: I, run: &str) -> Result<String, ExtractError>
where
    I: IntoIterator<Item = io::Result<String>>,
{
    let mut state = ScanState::Seeking;

    for line in lines {
        let line = line.map_err(|source| ExtractError::Io {
            run: run.to_string(),
            source,
        })?;
        let bare = strip_newline(&line);

        state = match state {
            ScanState::Seeking if bare == OPEN => ScanState::Capturing {
                buf: format!("{bare}\n"),
                lines: 1,
            },
            ScanState::Seeking => ScanState::Seeking,
            ScanState::Capturing { mut buf, lines } => {
                buf.push_str(bare);
                buf.push('\n');
                if bare == CLOSE {
                    return Ok(buf);
                }
                ScanState::Capturing { buf, lines: lines + 1 }
            }
        };
    }

    match state {
        ScanState::Seeking => Err(ExtractError::NoDocument { run: run.to_string() }),
        ScanState::Capturing { lines, .. } => Err(ExtractError::Truncated {
            run: run.to_string(),
            lines,
        }),
    }
}

pub fn extract_document<I>(lines: I, run: &str) -> Result<Value, ExtractError>
where
    I: IntoIterator<Item = io::Result<String>>,
{
    let text = capture_document(lines, run)?;
    serde_json::from_str(&text).map_err(|source| ExtractError::Malformed {
        run: run.to_string(),
        source,
    })
}
