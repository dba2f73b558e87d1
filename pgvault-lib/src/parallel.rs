//! The parallel job dispatcher: a bounded worker pool fed by a producer
//! callback, one job channel per worker and a shared result channel.
//!
//! The producer is asked for the next job each time a worker goes idle
//! (`next_job(worker)`), so it can shape locality: the restore engine,
//! for example, keeps one queue per target directory and hands each
//! worker the largest file from the queue nearest to it. There is no
//! ordering guarantee across jobs.
//!
//! Worker errors travel back through the response frame and are re-raised
//! on the dispatching side with `could not <verb> '<key>'` context; the
//! first error cancels the run after in-flight jobs drain.

use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};

use crate::error::{Error, Result};
use crate::protocol::{CommandHandler, ProtoJob, ProtoResponse, ProtoValue};

/// A completed job as seen by the result callback.
#[derive(Debug)]
pub struct JobOutcome {
    pub key: String,
    pub worker: usize,
    pub output: Vec<ProtoValue>,
}

/// Drive `source` to exhaustion over `process_max` workers.
///
/// `verb` labels errors (`could not <verb> '<key>'`). The result callback
/// runs on the dispatching thread, in completion order. A worker that
/// produces nothing for `protocol_timeout` fails the run.
pub fn execute<S, C>(
    process_max: usize,
    verb: &str,
    protocol_timeout: Duration,
    mut source: S,
    handler: &dyn CommandHandler,
    mut on_result: C,
) -> Result<()>
where
    S: FnMut(usize) -> Result<Option<ProtoJob>>,
    C: FnMut(JobOutcome) -> Result<()>,
{
    let process_max = process_max.max(1);
    let (result_tx, result_rx) = unbounded::<(usize, String, ProtoResponse)>();

    std::thread::scope(|scope| -> Result<()> {
        let mut job_tx = Vec::with_capacity(process_max);
        for worker in 0..process_max {
            let (tx, rx) = bounded::<ProtoJob>(1);
            job_tx.push(Some(tx));
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(job) = rx.recv() {
                    let response = ProtoResponse::from_result(handler.execute(&job.command));
                    if result_tx.send((worker, job.key, response)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        // Prime every worker, then replace jobs as results drain.
        let mut outstanding = 0usize;
        let mut first_error: Option<Error> = None;
        for worker in 0..process_max {
            if feed(worker, &mut source, &mut job_tx)? {
                outstanding += 1;
            }
        }

        while outstanding > 0 {
            let (worker, key, response) = match result_rx.recv_timeout(protocol_timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::Protocol(format!(
                        "timeout waiting for worker result after {}s",
                        protocol_timeout.as_secs()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Protocol("worker pool stopped unexpectedly".into()))
                }
            };
            outstanding -= 1;

            match response.into_result() {
                Ok(output) => {
                    if first_error.is_none() {
                        if let Err(err) = on_result(JobOutcome { key, worker, output }) {
                            first_error = Some(err);
                        }
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err.context(&format!("could not {verb} '{key}'")));
                    }
                }
            }

            if first_error.is_none() {
                if feed(worker, &mut source, &mut job_tx)? {
                    outstanding += 1;
                }
            } else {
                // Stop handing out work; let in-flight jobs drain.
                job_tx[worker] = None;
            }
        }
        drop(job_tx);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

fn feed<S>(
    worker: usize,
    source: &mut S,
    job_tx: &mut [Option<crossbeam_channel::Sender<ProtoJob>>],
) -> Result<bool>
where
    S: FnMut(usize) -> Result<Option<ProtoJob>>,
{
    if job_tx[worker].is_none() {
        return Ok(false);
    }
    match source(worker)? {
        Some(job) => {
            job_tx[worker]
                .as_ref()
                .expect("sender present")
                .send(job)
                .map_err(|_| Error::Protocol("worker stopped unexpectedly".into()))?;
            Ok(true)
        }
        None => {
            // Source exhausted for this worker; close its channel.
            job_tx[worker] = None;
            Ok(false)
        }
    }
}
