use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use snapshot_agent::{
    AccessToken, Authenticator, CancelScope, Camera, CaptureResult, CaptureRunner, CycleEnd, Fleet,
    FleetCollaborators, HeartbeatSink, RosterSource, SnapshotImage, SnapshotSink,
};

#[derive(Default)]
struct FakePlane {
    fail_auth: bool,
    fail_roster: bool,
    cameras: Vec<Camera>,
    token_calls: AtomicUsize,
    roster_calls: AtomicUsize,
    uploads: Mutex<Vec<String>>,
    /// (had token, healthy) per heartbeat.
    heartbeats: Mutex<Vec<(bool, bool)>>,
}

impl Authenticator for FakePlane {
    fn token(&self) -> Result<AccessToken> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_auth {
            return Err(anyhow!("invalid_grant"));
        }
        Ok(AccessToken::bearer("fleet-token"))
    }
}

impl RosterSource for FakePlane {
    fn cameras(&self, token: &AccessToken) -> Result<Vec<Camera>> {
        self.roster_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(token.access_token, "fleet-token");
        if self.fail_roster {
            return Err(anyhow!("roster unavailable"));
        }
        Ok(self.cameras.clone())
    }
}

impl SnapshotSink for FakePlane {
    fn upload(&self, _token: &AccessToken, image: &SnapshotImage) -> Result<()> {
        self.uploads.lock().unwrap().push(image.camera_id.clone());
        Ok(())
    }
}

impl HeartbeatSink for FakePlane {
    fn heartbeat(&self, token: Option<&AccessToken>, healthy: bool) -> Result<()> {
        self.heartbeats
            .lock()
            .unwrap()
            .push((token.is_some(), healthy));
        Ok(())
    }
}

struct InstantCapture;

impl CaptureRunner for InstantCapture {
    fn capture(&self, camera: &Camera, _scope: &CancelScope) -> CaptureResult<SnapshotImage> {
        Ok(SnapshotImage::new(camera.id.clone(), vec![0x89, b'P', b'N', b'G']))
    }
}

fn fleet(plane: &Arc<FakePlane>, heartbeat: Duration) -> Fleet {
    Fleet::new(
        FleetCollaborators {
            auth: plane.clone(),
            roster: plane.clone(),
            sink: plane.clone(),
            heartbeat: plane.clone(),
        },
        Arc::new(InstantCapture),
        heartbeat,
    )
}

fn roster() -> Vec<Camera> {
    vec![
        Camera::new("front-door", "rtsp://10.0.0.2/stream", Duration::from_secs(10)),
        Camera::new("yard", "rtsp://10.0.0.3/stream", Duration::from_secs(10)),
        Camera::new("unconfigured", "rtsp://10.0.0.4/stream", Duration::ZERO),
        Camera::new("no-address", "", Duration::from_secs(10)),
    ]
}

#[test]
fn healthy_cycle_schedules_valid_cameras_and_rolls_over() {
    let plane = Arc::new(FakePlane {
        cameras: roster(),
        ..FakePlane::default()
    });
    let (_tx, rx) = crossbeam_channel::unbounded::<()>();

    let (report, end) = fleet(&plane, Duration::from_millis(150)).run_cycle(&rx);

    assert_eq!(end, CycleEnd::Rollover);
    assert!(report.healthy);
    assert_eq!(report.cameras, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.schedulers.len(), 2);
    assert_eq!(*plane.heartbeats.lock().unwrap(), vec![(true, true)]);

    let mut uploads = plane.uploads.lock().unwrap().clone();
    uploads.sort();
    assert_eq!(uploads, vec!["front-door", "yard"]);
    for (_, scheduler) in &report.schedulers {
        assert_eq!(scheduler.attempts, 1);
        assert_eq!(scheduler.snapshots, 1);
    }
}

#[test]
fn roster_failure_reports_unhealthy_and_schedules_nothing() {
    let plane = Arc::new(FakePlane {
        fail_roster: true,
        cameras: roster(),
        ..FakePlane::default()
    });
    let (_tx, rx) = crossbeam_channel::unbounded::<()>();

    let (report, _) = fleet(&plane, Duration::from_millis(50)).run_cycle(&rx);

    assert!(!report.healthy);
    assert_eq!(report.cameras, 0);
    assert!(report.schedulers.is_empty());
    assert_eq!(*plane.heartbeats.lock().unwrap(), vec![(true, false)]);
    assert!(plane.uploads.lock().unwrap().is_empty());
}

#[test]
fn token_failure_skips_roster_and_reports_unhealthy() {
    let plane = Arc::new(FakePlane {
        fail_auth: true,
        cameras: roster(),
        ..FakePlane::default()
    });
    let (_tx, rx) = crossbeam_channel::unbounded::<()>();

    let (report, _) = fleet(&plane, Duration::from_millis(50)).run_cycle(&rx);

    assert!(!report.healthy);
    assert_eq!(plane.roster_calls.load(Ordering::SeqCst), 0);
    assert_eq!(*plane.heartbeats.lock().unwrap(), vec![(false, false)]);
}

#[test]
fn shutdown_signal_ends_the_current_cycle_and_drains() {
    let plane = Arc::new(FakePlane {
        cameras: roster(),
        ..FakePlane::default()
    });
    let (tx, rx) = crossbeam_channel::unbounded();
    tx.send(()).unwrap();
    let started = Instant::now();

    let reports = fleet(&plane, Duration::from_secs(60)).run(&rx);

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].schedulers.len(), 2);
}

#[test]
fn every_cycle_refreshes_token_roster_and_heartbeat() {
    let plane = Arc::new(FakePlane {
        cameras: roster(),
        ..FakePlane::default()
    });
    let (tx, rx) = crossbeam_channel::unbounded();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(250));
        let _ = tx.send(());
    });

    let reports = fleet(&plane, Duration::from_millis(60)).run(&rx);
    stopper.join().unwrap();

    assert!(reports.len() >= 2, "{} cycles", reports.len());
    assert_eq!(plane.token_calls.load(Ordering::SeqCst), reports.len());
    assert_eq!(plane.roster_calls.load(Ordering::SeqCst), reports.len());
    assert_eq!(plane.heartbeats.lock().unwrap().len(), reports.len());
    assert!(reports.iter().all(|report| report.healthy));
}
