//! Startup replay of the dump log.
//!
//! The log is read once, before the backend takes live writes. Every line must decode;
//! a single bad line aborts the restore so the collector never serves partially
//! restored state. All records are applied through one [`MetricsStorage::tx`] call.
//!
//! Counter records are deltas and gauge records are values, so replay re-accumulates
//! counters and leaves each gauge at its last logged value.

use super::traits::{MetricsStorage, TxOp, counter_op, gauge_op};
use crate::models::PersistedRecord;
use crate::{Error, Result};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Converts a record into the op that replays it.
#[must_use]
pub fn record_op(record: PersistedRecord) -> TxOp {
    match record {
        PersistedRecord::Counter { name, value } => counter_op(name, value),
        PersistedRecord::Gauge { name, value } => gauge_op(name, value),
    }
}

/// Reads and decodes every record in the log.
///
/// A missing file yields no records. Blank lines are skipped.
///
/// # Errors
///
/// Returns [`Error::SerializationFailure`] naming the first malformed line, or
/// [`Error::OperationFailed`] if the file cannot be read.
pub async fn read_records(path: &Path) -> Result<Vec<PersistedRecord>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No dump file, nothing to restore");
            return Ok(Vec::new());
        },
        Err(e) => {
            return Err(Error::OperationFailed {
                operation: "open_restore_file".to_string(),
                cause: format!("{}: {e}", path.display()),
            });
        },
    };

    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    let mut line_no: usize = 0;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| Error::OperationFailed {
            operation: "read_restore_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?
    {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record = PersistedRecord::decode_line(&line).map_err(|e| {
            Error::SerializationFailure {
                operation: "restore".to_string(),
                cause: format!("{} line {line_no}: {e}", path.display()),
            }
        })?;
        records.push(record);
    }

    Ok(records)
}

/// Replays the log at `path` into `target` as one transaction.
///
/// Returns the number of records applied.
///
/// # Errors
///
/// Fails on the first malformed line, or with the transaction error if `target`
/// rejects the batch. Nothing is applied in either case.
pub async fn restore_from_file(path: &Path, target: &dyn MetricsStorage) -> Result<usize> {
    let records = read_records(path).await?;
    if records.is_empty() {
        return Ok(0);
    }

    let count = records.len();
    let ops: Vec<TxOp> = records.into_iter().map(record_op).collect();
    target.tx(ops).await?;

    tracing::info!(
        path = %path.display(),
        records = count,
        backend = target.backend_name(),
        "Restored metrics from dump file"
    );
    metrics::counter!("metricstore_restored_records_total").increment(count as u64);
    Ok(count)
}
