//! Per-camera capture loop.
//!
//! One scheduler thread per camera, one attempt thread per in-flight capture.
//! The scheduler never lets two attempts for the same camera overlap: on a
//! tick with an attempt still running it cancels that attempt, joins its
//! thread, and only then starts the next one with half the interval as its
//! budget. An attempt that already finished when the tick fires is collected
//! normally and the next one gets the full interval.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, tick, Receiver};

use super::attempt::CaptureRunner;
use crate::camera::Camera;
use crate::cancel::CancelScope;
use crate::control_plane::{AccessToken, SnapshotSink};
use crate::error::CaptureError;

/// Counters for one scheduler over one cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub attempts: u64,
    pub snapshots: u64,
    pub failures: u64,
    pub superseded: u64,
    /// The camera advertised no decodable video and was skipped.
    pub media_missing: bool,
}

#[derive(Debug)]
enum AttemptOutcome {
    Uploaded { bytes: usize },
    UploadFailed(anyhow::Error),
    /// Capture succeeded but the attempt was cancelled before upload.
    Discarded,
    Failed(CaptureError),
}

struct InFlight {
    scope: CancelScope,
    handle: JoinHandle<()>,
    results: Receiver<AttemptOutcome>,
}

pub struct CaptureScheduler {
    camera: Camera,
    runner: Arc<dyn CaptureRunner>,
    sink: Arc<dyn SnapshotSink>,
    token: AccessToken,
}

impl CaptureScheduler {
    pub fn new(
        camera: Camera,
        runner: Arc<dyn CaptureRunner>,
        sink: Arc<dyn SnapshotSink>,
        token: AccessToken,
    ) -> Self {
        Self {
            camera,
            runner,
            sink,
            token,
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Run on a dedicated thread until `cycle` is cancelled.
    pub fn spawn(self, cycle: CancelScope) -> std::io::Result<JoinHandle<SchedulerReport>> {
        thread::Builder::new()
            .name(format!("scheduler-{}", self.camera.id))
            .spawn(move || self.run(&cycle))
    }

    /// Tick until `cycle` is cancelled, then drain the in-flight attempt.
    pub fn run(&self, cycle: &CancelScope) -> SchedulerReport {
        let interval = self.camera.interval;
        let mut report = SchedulerReport::default();
        if interval.is_zero() {
            log::warn!("camera {}: zero capture interval, not scheduling", self.camera.id);
            return report;
        }
        let ticker = tick(interval);
        log::info!(
            "camera {}: scheduling every {:?}",
            self.camera.id,
            interval
        );

        let mut in_flight = self.start(cycle, interval, &mut report);
        loop {
            let results = in_flight
                .as_ref()
                .map(|attempt| attempt.results.clone())
                .unwrap_or_else(never);
            select! {
                recv(cycle.done()) -> _ => {
                    if let Some(attempt) = in_flight.take() {
                        self.retire(attempt, &mut report);
                    }
                    break;
                }
                recv(ticker) -> _ => {
                    let superseded = match in_flight.take() {
                        None => false,
                        Some(attempt) => self.retire(attempt, &mut report),
                    };
                    let budget = if superseded {
                        log::info!(
                            "camera {}: previous attempt was still running, superseded",
                            self.camera.id
                        );
                        report.superseded += 1;
                        interval / 2
                    } else {
                        interval
                    };
                    if report.media_missing || cycle.is_cancelled() {
                        break;
                    }
                    in_flight = self.start(cycle, budget, &mut report);
                }
                recv(results) -> outcome => {
                    if let Some(attempt) = in_flight.take() {
                        join_attempt(&self.camera.id, attempt.handle);
                    }
                    match outcome {
                        Ok(outcome) => self.record(outcome, &mut report),
                        Err(_) => {
                            log::error!("camera {}: attempt exited without a result", self.camera.id);
                            report.failures += 1;
                        }
                    }
                    if report.media_missing {
                        break;
                    }
                }
            }
        }
        log::debug!("camera {}: scheduler stopped {:?}", self.camera.id, report);
        report
    }

    fn start(
        &self,
        cycle: &CancelScope,
        budget: Duration,
        report: &mut SchedulerReport,
    ) -> Option<InFlight> {
        let scope = cycle.child_with_budget(budget);
        let (results_tx, results) = bounded(1);
        let camera = self.camera.clone();
        let runner = Arc::clone(&self.runner);
        let sink = Arc::clone(&self.sink);
        let token = self.token.clone();
        let attempt_scope = scope.clone();
        report.attempts += 1;

        let spawned = thread::Builder::new()
            .name(format!("capture-{}", camera.id))
            .spawn(move || {
                let started = Instant::now();
                let outcome = match runner.capture(&camera, &attempt_scope) {
                    Ok(_) if attempt_scope.is_cancelled() => AttemptOutcome::Discarded,
                    Ok(image) => match sink.upload(&token, &image) {
                        Ok(()) => AttemptOutcome::Uploaded {
                            bytes: image.bytes.len(),
                        },
                        Err(err) => AttemptOutcome::UploadFailed(err),
                    },
                    Err(err) => AttemptOutcome::Failed(err),
                };
                log::info!(
                    "camera {}: attempt finished in {:.3}s",
                    camera.id,
                    started.elapsed().as_secs_f64()
                );
                // Single slot; a scheduler that has moved on simply never reads it.
                let _ = results_tx.try_send(outcome);
            });
        match spawned {
            Ok(handle) => Some(InFlight {
                scope,
                handle,
                results,
            }),
            Err(err) => {
                log::error!(
                    "camera {}: failed to spawn capture thread: {}",
                    self.camera.id,
                    err
                );
                report.failures += 1;
                None
            }
        }
    }

    /// Cancel the attempt if it is still running, wait for it to release
    /// everything, then account for its outcome. Returns true if it had to be
    /// cancelled.
    fn retire(&self, attempt: InFlight, report: &mut SchedulerReport) -> bool {
        let finished = !attempt.results.is_empty() || attempt.handle.is_finished();
        if !finished {
            attempt.scope.cancel();
        }
        join_attempt(&self.camera.id, attempt.handle);
        if let Ok(outcome) = attempt.results.try_recv() {
            self.record(outcome, report);
        }
        !finished
    }

    fn record(&self, outcome: AttemptOutcome, report: &mut SchedulerReport) {
        let id = &self.camera.id;
        match outcome {
            AttemptOutcome::Uploaded { bytes } => {
                report.snapshots += 1;
                log::info!("camera {}: uploaded {} byte snapshot", id, bytes);
            }
            AttemptOutcome::UploadFailed(err) => {
                report.failures += 1;
                log::warn!("camera {}: snapshot upload failed: {:#}", id, err);
            }
            AttemptOutcome::Discarded => {
                log::debug!("camera {}: snapshot discarded after cancellation", id);
            }
            AttemptOutcome::Failed(CaptureError::Cancelled) => {
                log::debug!("camera {}: attempt cancelled", id);
            }
            AttemptOutcome::Failed(CaptureError::MediaNotFound) => {
                report.media_missing = true;
                log::warn!("camera {}: no H264/H265 track, skipping this cycle", id);
            }
            AttemptOutcome::Failed(err) => {
                report.failures += 1;
                log::warn!("camera {}: snapshot failed ({}): {}", id, err.kind(), err);
            }
        }
    }
}

fn join_attempt(camera_id: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("camera {}: capture thread panicked", camera_id);
    }
}
