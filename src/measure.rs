// ENCLAVE-BENCH MEASUREMENT
// ONE SUPERVISED RUN: START -> STREAM -> EXTRACT -> SHUTDOWN.
// SHUTDOWN ALWAYS RUNS BEFORE AN EXTRACTION ERROR IS RETURNED. UNDER AN
// INTERACTIVE DEBUGGER THE CHILD OWNS THE TERMINAL AND NO DOCUMENT IS EXPECTED.

use std::io::Write;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::extract::{extract_document, ExtractError};
use crate::supervisor::{
    BenchmarkRun, LaunchSpec, OutputMode, ShutdownOutcome, SuperviseError, GRACEFUL_TIMEOUT,
};

#[derive(Debug, Error)]
pub enum MeasureError {
    #[error(transparent)]
    Supervise(#[from] SuperviseError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl MeasureError {
    // FATAL FOR THIS RUN ONLY; A SWEEP MOVES ON TO THE NEXT SYSTEM
    pub fn is_run_local(&self) -> bool {
        matches!(self, Self::Extract(_))
    }
}

#[derive(Debug)]
pub struct Measurement {
    // None ONLY WHEN OUTPUT CAPTURE WAS SKIPPED
    pub document: Option<Value>,
    pub outcome: ShutdownOutcome,
}

pub fn measure<W: Write>(spec: LaunchSpec, echo: W) -> Result<Measurement, MeasureError> {
    measure_with_timeout(spec, echo, GRACEFUL_TIMEOUT)
}

pub fn measure_with_timeout<W: Write>(
    spec: LaunchSpec,
    echo: W,
    graceful_timeout: Duration,
) -> Result<Measurement, MeasureError> {
    let interactive = spec.output != OutputMode::Capture;
    let label = spec.label.clone();
    let mut run = BenchmarkRun::start(spec)?.with_graceful_timeout(graceful_timeout);

    if interactive {
        run.wait_for_exit()?;
        return Ok(Measurement {
            document: None,
            outcome: run.shutdown()?,
        });
    }

    let extracted = {
        let stream = run.lines(echo)?;
        extract_document(stream, &label)
    };

    println!("STOP {}...", label);
    let outcome = run.shutdown()?;
    if outcome.was_forced() {
        tracing::warn!(label = %label, "forced kill after graceful timeout");
    }

    Ok(Measurement {
        document: Some(extracted?),
        outcome,
    })
}
