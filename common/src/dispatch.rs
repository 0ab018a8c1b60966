use chrono::{DateTime, FixedOffset};
use log::{error, info, warn};
use thiserror::Error;

use crate::{
    cloud::CloudClient,
    codec::CodecError,
    transport::HttpTransport,
    types::{SensorReadings, Snapshot, View},
};

pub const STALE_AFTER_CYCLES: u64 = 3;

#[derive(Debug, Error)]
#[error("{sensor} read failed: {reason}")]
pub struct SensorError {
    pub sensor: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("couldn't find {sensor}: {reason}")]
pub struct SensorInitError {
    pub sensor: &'static str,
    pub reason: String,
}

pub trait SensorSource {
    fn read(&mut self) -> Result<SensorReadings, SensorError>;
}

pub trait Clock {
    fn epoch_secs(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ButtonEdge {
    was_down: bool,
}

impl ButtonEdge {
    pub fn update(&mut self, is_down: bool) -> bool {
        let pressed = is_down && !self.was_down;
        self.was_down = is_down;
        pressed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Uploaded,
    Failed,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub snapshot: Snapshot,
    pub upload: UploadStatus,
    pub cloud: Option<Snapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepReport {
    pub toggled: bool,
    pub cycle: Option<CycleReport>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub view: View,
    pub snapshot: Option<Snapshot>,
    pub stale: bool,
}

impl Frame {
    pub fn lines(&self, utc_offset_secs: i32) -> Vec<String> {
        let mut lines = vec![self.view.title().to_string()];
        if self.stale {
            lines.push("(stale)".to_string());
        }

        let Some(snapshot) = self.snapshot else {
            lines.push("Waiting for data...".to_string());
            return lines;
        };

        lines.push(format!(
            "Temp: {:.2}C / {:.2}F",
            snapshot.temp,
            snapshot.temp_f()
        ));
        lines.push(format!("Humidity: {:.2} %rH", snapshot.rel_humidity));
        if self.view == View::Live {
            lines.push(format!(
                "Prox: {}  AL: {}  RWL: {}",
                snapshot.prox, snapshot.ambient_light, snapshot.white_light
            ));
            lines.push(format!(
                "Accel: {:.2} {:.2} {:.2} m/s^2",
                snapshot.acc_x, snapshot.acc_y, snapshot.acc_z
            ));
        }
        lines.push(format!(
            "Time: {}",
            format_epoch_secs(snapshot.time_captured, utc_offset_secs)
        ));
        lines.push(format!("Cloud Time: {}", snapshot.cloud_upload_time));
        lines
    }
}

pub fn format_epoch_secs(epoch_secs: i64, utc_offset_secs: i32) -> String {
    let Some(offset) = FixedOffset::east_opt(utc_offset_secs) else {
        return epoch_secs.to_string();
    };
    match DateTime::from_timestamp(epoch_secs, 0) {
        Some(utc) => utc
            .with_timezone(&offset)
            .format("%m/%d/%Y %I:%M:%S%p")
            .to_string(),
        None => epoch_secs.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    view: View,
    dirty: bool,
    shown_stale: bool,
    cycle_interval_ms: u64,
    last_cycle_ms: u64,
    live: Option<Snapshot>,
    cloud: Option<Snapshot>,
    last_cloud_ok_ms: Option<u64>,
    button: ButtonEdge,
}

impl AppState {
    pub fn new(cycle_interval_ms: u64) -> Self {
        Self {
            view: View::Live,
            dirty: true,
            shown_stale: false,
            cycle_interval_ms,
            last_cycle_ms: 0,
            live: None,
            cloud: None,
            last_cloud_ok_ms: None,
            button: ButtonEdge::default(),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn live(&self) -> Option<&Snapshot> {
        self.live.as_ref()
    }

    pub fn cloud(&self) -> Option<&Snapshot> {
        self.cloud.as_ref()
    }

    pub fn update_button(&mut self, is_down: bool, now_ms: u64) -> bool {
        let pressed = self.button.update(is_down);
        if pressed {
            self.press_button(now_ms);
        }
        pressed
    }

    pub fn press_button(&mut self, now_ms: u64) {
        self.view = self.view.toggled();
        self.dirty = true;
        self.last_cycle_ms = now_ms;
        info!("view switched to {}", self.view.as_str());
    }

    pub fn cycle_due(&self, now_ms: u64) -> bool {
        now_ms.wrapping_sub(self.last_cycle_ms) > self.cycle_interval_ms
    }

    pub fn skip_cycle(&mut self, now_ms: u64) {
        self.last_cycle_ms = now_ms;
    }

    pub fn record_capture(&mut self, snapshot: Snapshot, now_ms: u64) {
        self.live = Some(snapshot);
        self.last_cycle_ms = now_ms;
        if self.view == View::Live {
            self.dirty = true;
        }
    }

    pub fn apply_cloud(&mut self, cloud: Option<Snapshot>, now_ms: u64) {
        if let Some(snapshot) = cloud {
            self.cloud = Some(snapshot);
            self.last_cloud_ok_ms = Some(now_ms);
            self.dirty = true;
        }
    }

    pub fn is_cloud_stale(&self, now_ms: u64) -> bool {
        let limit = self.cycle_interval_ms.saturating_mul(STALE_AFTER_CYCLES);
        match self.last_cloud_ok_ms {
            Some(last_ok) => now_ms.wrapping_sub(last_ok) > limit,
            None => self.cloud.is_none(),
        }
    }

    pub fn take_frame(&mut self, now_ms: u64) -> Option<Frame> {
        let stale = self.view == View::Cloud && self.is_cloud_stale(now_ms);
        if !self.dirty && stale == self.shown_stale {
            return None;
        }

        self.dirty = false;
        self.shown_stale = stale;
        let snapshot = match self.view {
            View::Live => self.live,
            View::Cloud => self.cloud,
        };
        Some(Frame {
            view: self.view,
            snapshot,
            stale,
        })
    }
}

pub fn run_cycle<T: HttpTransport>(client: &mut CloudClient<T>, snapshot: Snapshot) -> CycleReport {
    let upload = match client.upload_snapshot(&snapshot) {
        Ok(true) => UploadStatus::Uploaded,
        Ok(false) => UploadStatus::Failed,
        Err(err @ CodecError::EncodingOverflow { .. }) => {
            error!("snapshot cannot be uploaded: {err}");
            UploadStatus::Overflow
        }
        Err(err) => {
            error!("snapshot encoding failed: {err}");
            UploadStatus::Failed
        }
    };

    let cloud = match client.fetch_latest() {
        Ok(cloud) => cloud,
        Err(err) => {
            error!("retrieval request cannot be built: {err}");
            None
        }
    };

    CycleReport {
        snapshot,
        upload,
        cloud,
    }
}

/// One pass of the single-threaded loop: button, then (when due) capture,
/// upload and retrieval. Sensor and network calls block for their duration.
pub fn dispatch_step<S, C, T>(
    state: &mut AppState,
    now_ms: u64,
    button_down: bool,
    sensors: &mut S,
    clock: &C,
    client: &mut CloudClient<T>,
) -> StepReport
where
    S: SensorSource + ?Sized,
    C: Clock + ?Sized,
    T: HttpTransport,
{
    let toggled = state.update_button(button_down, now_ms);

    if !state.cycle_due(now_ms) {
        return StepReport {
            toggled,
            cycle: None,
        };
    }

    let readings = match sensors.read() {
        Ok(readings) => readings,
        Err(err) => {
            warn!("skipping cycle: {err}");
            state.skip_cycle(now_ms);
            return StepReport {
                toggled,
                cycle: None,
            };
        }
    };

    let snapshot = Snapshot::capture(readings, clock.epoch_secs());
    state.record_capture(snapshot, now_ms);

    let report = run_cycle(client, snapshot);
    state.apply_cloud(report.cloud, now_ms);

    StepReport {
        toggled,
        cycle: Some(report),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::CloudConfig, transport::testing::StubTransport};

    const LATEST_BODY: &str = r#"{"otherDetails":{"cloudUploadTime":"1700000123456","timeCaptured":"1700000000"},"shtDetails":{"temp":"21.4","rHum":"43.9"}}"#;

    struct FixedSensors(SensorReadings);

    impl SensorSource for FixedSensors {
        fn read(&mut self) -> Result<SensorReadings, SensorError> {
            Ok(self.0)
        }
    }

    struct BrokenSensors;

    impl SensorSource for BrokenSensors {
        fn read(&mut self) -> Result<SensorReadings, SensorError> {
            Err(SensorError {
                sensor: "SHT4x",
                reason: "i2c nack".to_string(),
            })
        }
    }

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn epoch_secs(&self) -> i64 {
            self.0
        }
    }

    fn readings() -> SensorReadings {
        SensorReadings {
            prox: 12,
            ambient_light: 300,
            white_light: 50,
            temp_c: 21.5,
            rel_humidity: 44.0,
            acc_x: 0.1,
            acc_y: 9.7,
            acc_z: 0.2,
        }
    }

    fn client(transport: StubTransport) -> CloudClient<StubTransport> {
        CloudClient::new(transport, CloudConfig::default())
    }

    #[test]
    fn button_toggles_only_on_press_edge() {
        let mut state = AppState::new(5_000);

        assert!(state.update_button(true, 10));
        assert_eq!(state.view(), View::Cloud);
        assert!(!state.update_button(true, 20));
        assert_eq!(state.view(), View::Cloud);
        assert!(!state.update_button(false, 30));
        assert!(state.update_button(true, 40));
        assert_eq!(state.view(), View::Live);
    }

    #[test]
    fn cycle_is_gated_by_wall_clock_interval() {
        let state = AppState::new(5_000);

        assert!(!state.cycle_due(5_000));
        assert!(state.cycle_due(5_001));
    }

    #[test]
    fn toggle_restarts_the_cycle_timer() {
        let mut state = AppState::new(5_000);
        state.press_button(4_000);

        assert!(!state.cycle_due(6_000));
        assert!(state.cycle_due(9_001));
    }

    #[test]
    fn step_before_interval_does_no_io() {
        let mut state = AppState::new(5_000);
        let mut client = client(StubTransport::default());

        let report = dispatch_step(
            &mut state,
            1_000,
            false,
            &mut FixedSensors(readings()),
            &FixedClock(1_700_000_000),
            &mut client,
        );

        assert_eq!(report, StepReport::default());
        assert!(client.transport().requests.is_empty());
    }

    #[test]
    fn due_step_uploads_then_retrieves_and_fills_both_views() {
        let transport = StubTransport::default()
            .reply(200, "stored")
            .reply(200, LATEST_BODY);
        let mut client = client(transport);
        let mut state = AppState::new(5_000);

        let report = dispatch_step(
            &mut state,
            5_001,
            false,
            &mut FixedSensors(readings()),
            &FixedClock(1_700_000_000),
            &mut client,
        );

        let cycle = report.cycle.unwrap();
        assert_eq!(cycle.upload, UploadStatus::Uploaded);
        assert_eq!(cycle.snapshot.time_captured, 1_700_000_000);

        let requests = &client.transport().requests;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].headers[0].0, "M5-Details");
        assert_eq!(requests[1].headers[0].0, "USER-ID");

        assert_eq!(state.live().unwrap().prox, 12);
        let cloud = state.cloud().unwrap();
        assert_eq!(cloud.cloud_upload_time, 1_700_000_123_456);
        assert!((cloud.temp - 21.4).abs() < 1e-9);
    }

    #[test]
    fn failed_retrieval_keeps_previous_cloud_snapshot() {
        let transport = StubTransport::default()
            .reply(200, "stored")
            .reply(200, LATEST_BODY)
            .reply(200, "stored")
            .fail("timeout");
        let mut client = client(transport);
        let mut state = AppState::new(5_000);
        let mut sensors = FixedSensors(readings());
        let clock = FixedClock(1_700_000_000);

        dispatch_step(&mut state, 5_001, false, &mut sensors, &clock, &mut client);
        let first = *state.cloud().unwrap();
        state.take_frame(5_001);

        let report = dispatch_step(&mut state, 10_002, false, &mut sensors, &clock, &mut client);

        assert_eq!(report.cycle.unwrap().cloud, None);
        assert_eq!(*state.cloud().unwrap(), first);
    }

    #[test]
    fn header_upload_is_not_retried() {
        let transport = StubTransport::default()
            .reply(503, "busy")
            .reply(200, LATEST_BODY);
        let mut client = client(transport);
        let mut state = AppState::new(5_000);

        let report = dispatch_step(
            &mut state,
            5_001,
            false,
            &mut FixedSensors(readings()),
            &FixedClock(1),
            &mut client,
        );

        assert_eq!(report.cycle.unwrap().upload, UploadStatus::Failed);
        assert_eq!(client.transport().requests.len(), 2);
    }

    #[test]
    fn overflow_is_reported_and_retrieval_still_runs() {
        let config = CloudConfig {
            header_capacity: 64,
            ..CloudConfig::default()
        };
        let mut client = CloudClient::new(StubTransport::default().reply(200, LATEST_BODY), config);
        let mut state = AppState::new(5_000);

        let report = dispatch_step(
            &mut state,
            5_001,
            false,
            &mut FixedSensors(readings()),
            &FixedClock(1),
            &mut client,
        );

        let cycle = report.cycle.unwrap();
        assert_eq!(cycle.upload, UploadStatus::Overflow);
        assert!(cycle.cloud.is_some());
        assert_eq!(client.transport().requests.len(), 1);
    }

    #[test]
    fn sensor_failure_skips_the_cycle() {
        let mut client = client(StubTransport::default());
        let mut state = AppState::new(5_000);

        let report = dispatch_step(
            &mut state,
            5_001,
            false,
            &mut BrokenSensors,
            &FixedClock(1),
            &mut client,
        );

        assert!(report.cycle.is_none());
        assert!(client.transport().requests.is_empty());
        assert!(!state.cycle_due(6_000));
    }

    #[test]
    fn dirty_flag_drives_redraws() {
        let mut state = AppState::new(5_000);

        let first = state.take_frame(0).unwrap();
        assert_eq!(first.view, View::Live);
        assert_eq!(first.snapshot, None);
        assert!(state.take_frame(1).is_none());

        state.press_button(2);
        let cloud = state.take_frame(2).unwrap();
        assert_eq!(cloud.view, View::Cloud);
        assert!(cloud.stale);
        assert!(state.take_frame(3).is_none());

        state.apply_cloud(Some(Snapshot::default()), 4);
        let refreshed = state.take_frame(4).unwrap();
        assert!(!refreshed.stale);
        assert!(!state.is_dirty());
    }

    #[test]
    fn failed_retrieval_does_not_mark_dirty() {
        let mut state = AppState::new(5_000);
        state.take_frame(0);

        state.apply_cloud(None, 10);

        assert!(!state.is_dirty());
    }

    #[test]
    fn cloud_view_turns_stale_after_missed_cycles() {
        let mut state = AppState::new(5_000);
        state.apply_cloud(Some(Snapshot::default()), 1_000);
        state.press_button(1_000);
        assert!(!state.take_frame(1_000).unwrap().stale);

        assert!(state.take_frame(16_000).is_none());
        let stale = state.take_frame(16_001).unwrap();
        assert!(stale.stale);
    }

    #[test]
    fn frame_lines_include_both_temperature_scales() {
        let frame = Frame {
            view: View::Cloud,
            snapshot: Some(Snapshot {
                temp: 21.5,
                rel_humidity: 44.0,
                time_captured: 0,
                cloud_upload_time: 1_700_000_123_456,
                ..Snapshot::default()
            }),
            stale: false,
        };

        let lines = frame.lines(0);

        assert_eq!(lines[0], "Cloud Data");
        assert_eq!(lines[1], "Temp: 21.50C / 70.70F");
        assert_eq!(lines[2], "Humidity: 44.00 %rH");
        assert_eq!(lines[3], "Time: 01/01/1970 12:00:00AM");
        assert_eq!(lines[4], "Cloud Time: 1700000123456");
    }
}
