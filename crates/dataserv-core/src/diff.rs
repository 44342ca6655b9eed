//! Off-reactor binary delta computation (§4.7).
//!
//! A dedicated worker thread receives `(old, new)` jobs over an `mpsc`
//! channel and posts results back over a second channel. The reactor drains
//! completed results with a non-blocking `try_recv` on every tick, the same
//! tight-loop-with-a-short-sleep cadence [`dataserv_transport::tcp::TcpConnector`]
//! itself uses (its `poll_with` never blocks in `mio::Poll` either) - so no
//! extra wakeup plumbing is needed to get a diff result noticed promptly.
//!
//! The requester (the sink pipe) owns the deadline: it stamps each
//! outstanding job with a submit time and, if no result has arrived by
//! `DIFF_DEADLINE`, treats it as a timeout and falls back to the raw
//! payload; a result that arrives late for an already-timed-out job is
//! simply discarded by id mismatch.
//!
//! A panic inside the diff computation is caught at the worker thread
//! boundary and reported as [`DiffError::Crashed`] rather than killing the
//! thread - this gives the "the job's caller sees a failure, everyone else
//! keeps working" behavior the spec asks for ("respawned") without actually
//! needing to track and restart a dead thread.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::mpsc::{self, Receiver, Sender},
    thread,
};

use crate::error::DiffError;

pub type JobId = u64;

struct Job {
    id: JobId,
    old: Vec<u8>,
    new: Vec<u8>,
}

pub struct DiffResult {
    pub id: JobId,
    pub outcome: Result<Vec<u8>, DiffError>,
}

/// Handle to the diff worker thread. Dropping it closes the job channel,
/// which ends the worker's `for job in job_rx` loop and joins it.
pub struct DiffWorker {
    job_tx: Sender<Job>,
    result_rx: Receiver<DiffResult>,
    next_id: JobId,
    _handle: thread::JoinHandle<()>,
}

impl Default for DiffWorker {
    fn default() -> Self {
        Self::spawn()
    }
}

impl DiffWorker {
    #[must_use]
    pub fn spawn() -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel::<DiffResult>();

        let handle = thread::Builder::new()
            .name("dataserv-diff".into())
            .spawn(move || {
                for job in job_rx {
                    let outcome = compute_delta_guarded(&job.old, &job.new);
                    if result_tx.send(DiffResult { id: job.id, outcome }).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn diff worker thread");

        Self { job_tx, result_rx, next_id: 0, _handle: handle }
    }

    /// Submits a diff job and returns its id for later correlation against
    /// [`DiffWorker::try_recv`] results.
    pub fn submit(&mut self, old: Vec<u8>, new: Vec<u8>) -> JobId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        // Worker thread only ever exits when `job_tx` is dropped, which
        // cannot happen while `self` is alive.
        let _ = self.job_tx.send(Job { id, old, new });
        id
    }

    /// Drains one completed result, if any, without blocking.
    pub fn try_recv(&self) -> Option<DiffResult> {
        self.result_rx.try_recv().ok()
    }
}

fn compute_delta_guarded(old: &[u8], new: &[u8]) -> Result<Vec<u8>, DiffError> {
    panic::catch_unwind(AssertUnwindSafe(|| compute_delta(old, new)))
        .map_err(|_| DiffError::Crashed)
        .and_then(|res| res)
}

fn compute_delta(old: &[u8], new: &[u8]) -> Result<Vec<u8>, DiffError> {
    let mut patch = Vec::new();
    qbsdiff::Bsdiff::new(old).compare(new, &mut patch).map_err(|_| DiffError::Crashed)?;
    Ok(patch)
}

/// Applies a delta produced by the diff worker to reconstruct `new` from
/// `old`. Used by `dataserv-client`'s `DataSink` to decode DELTA frames.
pub fn apply_delta(old: &[u8], delta: &[u8]) -> Result<Vec<u8>, DiffError> {
    let patcher = qbsdiff::Bspatch::new(delta).map_err(|_| DiffError::Crashed)?;
    let mut out = Vec::new();
    patcher.apply(old, &mut out).map_err(|_| DiffError::Crashed)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_roundtrips() {
        let old = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut new = old.clone();
        new[4..9].copy_from_slice(b"slow ");
        let delta = compute_delta(&old, &new).unwrap();
        let reconstructed = apply_delta(&old, &delta).unwrap();
        assert_eq!(reconstructed, new);
    }

    #[test]
    fn self_delta_roundtrips() {
        let p = b"a stable snapshot".to_vec();
        let delta = compute_delta(&p, &p).unwrap();
        assert_eq!(apply_delta(&p, &delta).unwrap(), p);
    }

    #[test]
    fn worker_end_to_end() {
        let mut worker = DiffWorker::spawn();

        let old = vec![0u8; 4096];
        let mut new = old.clone();
        new[10] = 7;

        let id = worker.submit(old.clone(), new.clone());

        let mut result = None;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while result.is_none() && std::time::Instant::now() < deadline {
            if let Some(r) = worker.try_recv() {
                result = Some(r);
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }

        let result = result.expect("diff worker never responded");
        assert_eq!(result.id, id);
        let delta = result.outcome.unwrap();
        assert_eq!(apply_delta(&old, &delta).unwrap(), new);
    }

    #[test]
    fn stale_result_is_distinguishable_by_id() {
        let mut worker = DiffWorker::spawn();
        let first = worker.submit(vec![1], vec![2]);
        let second = worker.submit(vec![3], vec![4]);
        assert_ne!(first, second);
    }
}
