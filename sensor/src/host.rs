use std::{
    fs,
    io::{self, ErrorKind, Read},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use reqwest::blocking::{Client, Response};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use cloudsense_common::{
    run_cycle, types::accel_g_to_ms2, AppState, Clock, CloudClient, FileCounter, Frame,
    HttpTransport, RawResponse, RequestDescriptor, RuntimeConfig, SensorError, SensorInitError,
    SensorReadings, SensorSource, Snapshot, SnapshotFileStore, SystemClock, TransportError,
    UploadStatus,
};

const UI_TICK_MS: u64 = 100;
const FILE_COUNTER_NAME: &str = "file_counter.bin";

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    if !store.runtime_path.exists() {
        if let Err(err) = store.save_runtime_config(&runtime).await {
            warn!("failed to write default runtime config: {err:#}");
        }
    }

    let missing = std::env::var("CLOUDSENSE_MISSING_SENSOR").ok();
    let mut sensors = SimulatedSensors::detect(missing.as_deref())
        .context("failed to initialize sensor suite")?;

    let (snapshot_tx, snapshot_rx) = watch::channel::<Option<Snapshot>>(None);
    let (cloud_tx, mut cloud_rx) = watch::channel::<Option<Snapshot>>(None);
    let worker = spawn_network_worker(
        runtime.clone(),
        store.data_dir.clone(),
        snapshot_rx,
        cloud_tx,
    );

    let mut presses = spawn_button_reader();
    let mut state = AppState::new(runtime.device.cycle_interval_ms);
    let clock = SystemClock;
    let utc_offset = runtime.device.display_utc_offset_secs;
    let mut tick = tokio::time::interval(Duration::from_millis(UI_TICK_MS));

    info!(
        "sensor node started for `{}` (cycle every {} ms, press Enter to switch views)",
        runtime.cloud.user_id, runtime.device.cycle_interval_ms
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            Some(()) = presses.recv() => state.press_button(monotonic_ms()),
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down sensor node");
                break;
            }
        }

        let now = monotonic_ms();
        if state.cycle_due(now) {
            match sensors.read() {
                Ok(readings) => {
                    let snapshot = Snapshot::capture(readings, clock.epoch_secs());
                    state.record_capture(snapshot, now);
                    snapshot_tx.send_replace(Some(snapshot));
                }
                Err(err) => {
                    warn!("skipping cycle: {err}");
                    state.skip_cycle(now);
                }
            }
        }

        if cloud_rx.has_changed().unwrap_or(false) {
            let cloud = *cloud_rx.borrow_and_update();
            state.apply_cloud(cloud, now);
        }

        if let Some(frame) = state.take_frame(now) {
            render_frame(&frame, utc_offset);
        }
    }

    drop(snapshot_tx);
    worker.await.context("network worker panicked")?;
    Ok(())
}

fn spawn_network_worker(
    runtime: RuntimeConfig,
    data_dir: PathBuf,
    mut snapshots: watch::Receiver<Option<Snapshot>>,
    cloud_tx: watch::Sender<Option<Snapshot>>,
) -> JoinHandle<()> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let timeout = Duration::from_millis(runtime.cloud.request_timeout_ms);
        let transport = match ReqwestTransport::new(timeout) {
            Ok(transport) => transport,
            Err(err) => {
                error!("http client unavailable, network worker stopped: {err:#}");
                return;
            }
        };
        let mut client = CloudClient::new(transport, runtime.cloud.clone());
        let mut file_store = runtime.device.file_upload_enabled.then(|| {
            SnapshotFileStore::new(
                &runtime.device.storage_root,
                DiskCounter::new(data_dir.join(FILE_COUNTER_NAME)),
            )
        });

        while handle.block_on(snapshots.changed()).is_ok() {
            let Some(snapshot) = *snapshots.borrow_and_update() else {
                continue;
            };
            if !network_cycle(&mut client, file_store.as_mut(), snapshot, &cloud_tx) {
                break;
            }
        }
    })
}

/// Returns false once the UI side has gone away.
fn network_cycle<T: HttpTransport, C: FileCounter>(
    client: &mut CloudClient<T>,
    file_store: Option<&mut SnapshotFileStore<C>>,
    snapshot: Snapshot,
    cloud_tx: &watch::Sender<Option<Snapshot>>,
) -> bool {
    let report = run_cycle(client, snapshot);
    match report.upload {
        UploadStatus::Uploaded => info!("snapshot {} uploaded", snapshot.time_captured),
        UploadStatus::Failed => warn!("snapshot {} not uploaded", snapshot.time_captured),
        UploadStatus::Overflow => {}
    }

    // The file upload can retry for a long time; the cloud view must not wait on it.
    if report.cloud.is_some() && cloud_tx.send(report.cloud).is_err() {
        return false;
    }

    if let Some(store) = file_store {
        match client.upload_snapshot_file(store, &snapshot) {
            Ok(outcome) if outcome.succeeded => {
                info!("snapshot file uploaded after {} attempt(s)", outcome.attempts)
            }
            Ok(outcome) => warn!(
                "snapshot file upload gave up after {} attempts (last status {})",
                outcome.attempts, outcome.last_status
            ),
            Err(err) => warn!("snapshot file upload skipped: {err}"),
        }
    }
    true
}

fn spawn_button_reader() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

fn render_frame(frame: &Frame, utc_offset_secs: i32) {
    for line in frame.lines(utc_offset_secs) {
        info!("| {line}");
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(user_id) = std::env::var("CLOUDSENSE_USER_ID") {
        runtime.cloud.user_id = user_id;
    }
    if let Ok(url) = std::env::var("CLOUDSENSE_UPLOAD_URL") {
        runtime.cloud.upload_url = url;
    }
    if let Ok(url) = std::env::var("CLOUDSENSE_RETRIEVE_URL") {
        runtime.cloud.retrieve_url = url;
    }
    if let Some(interval) = std::env::var("CLOUDSENSE_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        runtime.device.cycle_interval_ms = interval;
    }
}

#[derive(Clone)]
struct AppStore {
    data_dir: PathBuf,
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLOUDSENSE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.cloudsense"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir,
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&mut self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let response = builder
            .send()
            .map_err(|err| map_reqwest_error(&request.url, err))?;
        into_raw_response(&request.url, response)
    }

    fn post(
        &mut self,
        request: &RequestDescriptor,
        body: &mut dyn Read,
    ) -> Result<RawResponse, TransportError> {
        let mut payload = Vec::new();
        body.read_to_end(&mut payload)
            .map_err(|source| TransportError::Io {
                url: request.url.clone(),
                source,
            })?;

        let mut builder = self.client.post(&request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(payload)
            .send()
            .map_err(|err| map_reqwest_error(&request.url, err))?;
        into_raw_response(&request.url, response)
    }
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_connect() {
        TransportError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        TransportError::Other(format!("{url}: {err}"))
    }
}

fn into_raw_response(url: &str, response: Response) -> Result<RawResponse, TransportError> {
    let status = i32::from(response.status().as_u16());
    let body = response
        .text()
        .map_err(|err| map_reqwest_error(url, err))?;
    Ok(RawResponse { status, body })
}

struct DiskCounter {
    path: PathBuf,
}

impl DiskCounter {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl FileCounter for DiskCounter {
    fn read(&mut self) -> io::Result<u8> {
        match fs::read(self.path()) {
            Ok(raw) => Ok(raw.first().copied().unwrap_or(0)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn store(&mut self, value: u8) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, [value])
    }
}

struct SimulatedSensors {
    tick: u64,
}

impl SimulatedSensors {
    fn detect(missing: Option<&str>) -> Result<Self, SensorInitError> {
        for sensor in ["VCNL4040", "SHT40", "MPU6886"] {
            if missing.is_some_and(|name| name.eq_ignore_ascii_case(sensor)) {
                return Err(SensorInitError {
                    sensor,
                    reason: "not present on the bus".to_string(),
                });
            }
        }
        Ok(Self { tick: 0 })
    }
}

impl SensorSource for SimulatedSensors {
    fn read(&mut self) -> Result<SensorReadings, SensorError> {
        self.tick = self.tick.saturating_add(1);
        let tick = self.tick;

        Ok(SensorReadings {
            prox: 5 + (tick % 20) as i32,
            ambient_light: 250 + (tick % 10) as i32 * 12,
            white_light: 400 + (tick % 7) as i32 * 9,
            temp_c: 21.0 + (tick % 8) as f64 * 0.15,
            rel_humidity: 42.0 + (tick % 6) as f64 * 0.5,
            acc_x: accel_g_to_ms2((tick % 5) as f32 * 0.01),
            acc_y: accel_g_to_ms2(0.0),
            acc_z: accel_g_to_ms2(1.0),
        })
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
