//! Fleet orchestrator: one operating cycle per heartbeat interval.
//!
//! Each cycle fetches a token and the roster, spawns one scheduler per
//! camera under a fresh root scope, and reports health. When the heartbeat
//! interval elapses or shutdown is requested, the root scope is cancelled and
//! every scheduler is joined before anything else happens.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{after, select, Receiver};

use crate::camera::Camera;
use crate::cancel::CancelScope;
use crate::capture::{CaptureRunner, CaptureScheduler, SchedulerReport};
use crate::control_plane::{AccessToken, Authenticator, HeartbeatSink, RosterSource, SnapshotSink};

pub struct FleetCollaborators {
    pub auth: Arc<dyn Authenticator>,
    pub roster: Arc<dyn RosterSource>,
    pub sink: Arc<dyn SnapshotSink>,
    pub heartbeat: Arc<dyn HeartbeatSink>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub healthy: bool,
    pub cameras: usize,
    pub skipped: usize,
    pub schedulers: Vec<(String, SchedulerReport)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleEnd {
    Rollover,
    Shutdown,
}

pub struct Fleet {
    collaborators: FleetCollaborators,
    runner: Arc<dyn CaptureRunner>,
    heartbeat_interval: Duration,
}

struct RunningCycle {
    root: CancelScope,
    healthy: bool,
    cameras: usize,
    skipped: usize,
    schedulers: Vec<(String, JoinHandle<SchedulerReport>)>,
}

impl Fleet {
    pub fn new(
        collaborators: FleetCollaborators,
        runner: Arc<dyn CaptureRunner>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            collaborators,
            runner,
            heartbeat_interval,
        }
    }

    /// Run cycles until `shutdown` yields or disconnects.
    pub fn run(&self, shutdown: &Receiver<()>) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        loop {
            let (report, end) = self.run_cycle(shutdown);
            reports.push(report);
            if end == CycleEnd::Shutdown {
                log::info!("shutdown requested, fleet drained");
                return reports;
            }
        }
    }

    /// One full cycle: start, wait for rollover or shutdown, drain.
    pub fn run_cycle(&self, shutdown: &Receiver<()>) -> (CycleReport, CycleEnd) {
        let cycle = self.start_cycle();
        let end = select! {
            recv(shutdown) -> _ => CycleEnd::Shutdown,
            recv(after(self.heartbeat_interval)) -> _ => CycleEnd::Rollover,
        };
        log::info!("cycle ending ({:?}), draining schedulers", end);
        (self.drain(cycle), end)
    }

    fn start_cycle(&self) -> RunningCycle {
        let root = CancelScope::root();
        let mut cycle = RunningCycle {
            root,
            healthy: false,
            cameras: 0,
            skipped: 0,
            schedulers: Vec::new(),
        };

        let token = match self.collaborators.auth.token() {
            Ok(token) => Some(token),
            Err(err) => {
                log::error!("token request failed: {:#}", err);
                None
            }
        };
        let cameras = match token.as_ref().map(|token| self.collaborators.roster.cameras(token)) {
            Some(Ok(cameras)) => Some(cameras),
            Some(Err(err)) => {
                log::error!("roster fetch failed: {:#}", err);
                None
            }
            None => None,
        };

        if let (Some(token), Some(cameras)) = (token.as_ref(), cameras) {
            cycle.healthy = true;
            self.spawn_schedulers(&mut cycle, token, cameras);
        }

        if let Err(err) = self
            .collaborators
            .heartbeat
            .heartbeat(token.as_ref(), cycle.healthy)
        {
            log::warn!("heartbeat failed: {:#}", err);
        }
        cycle
    }

    fn spawn_schedulers(&self, cycle: &mut RunningCycle, token: &AccessToken, cameras: Vec<Camera>) {
        for camera in cameras {
            if !camera.is_schedulable() {
                log::warn!(
                    "camera {}: missing stream address or interval, skipped",
                    camera.id
                );
                cycle.skipped += 1;
                continue;
            }
            let id = camera.id.clone();
            let scheduler = CaptureScheduler::new(
                camera,
                Arc::clone(&self.runner),
                Arc::clone(&self.collaborators.sink),
                token.clone(),
            );
            match scheduler.spawn(cycle.root.child()) {
                Ok(handle) => {
                    cycle.cameras += 1;
                    cycle.schedulers.push((id, handle));
                }
                Err(err) => {
                    log::error!("camera {}: failed to spawn scheduler: {}", id, err);
                    cycle.skipped += 1;
                }
            }
        }
        log::info!(
            "cycle started: {} cameras scheduled, {} skipped",
            cycle.cameras,
            cycle.skipped
        );
    }

    fn drain(&self, cycle: RunningCycle) -> CycleReport {
        cycle.root.cancel();
        let mut report = CycleReport {
            healthy: cycle.healthy,
            cameras: cycle.cameras,
            skipped: cycle.skipped,
            schedulers: Vec::with_capacity(cycle.schedulers.len()),
        };
        for (id, handle) in cycle.schedulers {
            match handle.join() {
                Ok(scheduler) => report.schedulers.push((id, scheduler)),
                Err(_) => log::error!("camera {}: scheduler thread panicked", id),
            }
        }
        log::debug!("drained {} schedulers", report.schedulers.len());
        report
    }
}
