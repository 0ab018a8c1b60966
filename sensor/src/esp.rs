use std::{
    io,
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::BLOCK,
    gpio::{InputPin, OutputPin},
    i2c::{I2c, I2cConfig, I2cDriver},
    peripheral::Peripheral,
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use cloudsense_common::{
    config::NetworkConfig, dispatch_step, types::accel_g_to_ms2, AppState, CloudClient,
    FileCounter, Frame, HttpTransport, RawResponse, RequestDescriptor, RuntimeConfig, SensorError,
    SensorInitError, SensorReadings, SensorSource, SnapshotFileStore, SystemClock,
    TransportError,
};

const NVS_NAMESPACE: &str = "cloudsense";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_FILE_COUNTER_KEY: &str = "file_num";

const MAX_HTTP_BODY: usize = 4096;
const UPLOAD_CHUNK_SIZE: usize = 512;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SNTP_WAIT_SECS: u64 = 30;
const LOOP_DELAY_MS: u64 = 20;

const VCNL4040_ADDR: u8 = 0x60;
const VCNL4040_REG_ALS_CONF: u8 = 0x00;
const VCNL4040_REG_PS_CONF1: u8 = 0x03;
const VCNL4040_REG_PS_CONF3: u8 = 0x04;
const VCNL4040_REG_PS_DATA: u8 = 0x08;
const VCNL4040_REG_ALS_DATA: u8 = 0x09;
const VCNL4040_REG_WHITE_DATA: u8 = 0x0A;
const VCNL4040_REG_ID: u8 = 0x0C;
const VCNL4040_ID: u16 = 0x0186;
const VCNL4040_LUX_PER_COUNT: f32 = 0.1;

const SHT4X_ADDR: u8 = 0x44;
const SHT4X_CMD_MEASURE_HIGH: u8 = 0xFD;
const SHT4X_CMD_SERIAL: u8 = 0x89;
const SHT4X_CMD_SOFT_RESET: u8 = 0x94;

const MPU6886_ADDR: u8 = 0x68;
const MPU6886_REG_ACCEL_CONFIG: u8 = 0x1C;
const MPU6886_REG_ACCEL_XOUT_H: u8 = 0x3B;
const MPU6886_REG_PWR_MGMT_1: u8 = 0x6B;
const MPU6886_REG_WHO_AM_I: u8 = 0x75;
const MPU6886_WHO_AM_I: u8 = 0x19;
/// g per LSB with the +-8g full scale.
const MPU6886_ACCEL_SCALE: f32 = 8.0 / 32768.0;

const FT6336_ADDR: u8 = 0x38;
const FT6336_REG_TD_STATUS: u8 = 0x02;
/// Touch zone of the middle button below the panel: x, y, width, height.
const BUTTON_B_ZONE: (u16, u16, u16, u16) = (130, 240, 70, 40);

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    let Peripherals {
        modem,
        pins,
        i2c0,
        i2c1,
        ..
    } = Peripherals::take()?;

    let internal_bus = open_i2c(i2c0, pins.gpio21, pins.gpio22)?;
    let port_a_bus = open_i2c(i2c1, pins.gpio32, pins.gpio33)?;
    let mut board = match Core2Board::new(internal_bus, port_a_bus) {
        Ok(board) => board,
        Err(err) => halt(err),
    };

    let _wifi = connect_wifi(modem, sys_loop, nvs_partition.clone(), &runtime.network)
        .context("wifi startup failed")?;
    let _sntp = start_time_sync()?;

    let timeout = Duration::from_millis(runtime.cloud.request_timeout_ms);
    let mut client = CloudClient::new(EspTransport { timeout }, runtime.cloud.clone());
    let mut file_store = runtime.device.file_upload_enabled.then(|| {
        SnapshotFileStore::new(
            &runtime.device.storage_root,
            NvsFileCounter {
                partition: nvs_partition.clone(),
            },
        )
    });

    let mut state = AppState::new(runtime.device.cycle_interval_ms);
    let clock = SystemClock;
    let utc_offset = runtime.device.display_utc_offset_secs;

    info!("sensor node running for `{}`", runtime.cloud.user_id);

    loop {
        let button_down = board.button_b_down();
        let report = dispatch_step(
            &mut state,
            monotonic_ms(),
            button_down,
            &mut board,
            &clock,
            &mut client,
        );

        if let Some(frame) = state.take_frame(monotonic_ms()) {
            render_frame(&frame, utc_offset);
        }

        if let (Some(cycle), Some(store)) = (report.cycle, file_store.as_mut()) {
            match client.upload_snapshot_file(store, &cycle.snapshot) {
                Ok(outcome) if !outcome.succeeded => warn!(
                    "snapshot file upload gave up after {} attempts",
                    outcome.attempts
                ),
                Ok(_) => {}
                Err(err) => warn!("snapshot file upload skipped: {err}"),
            }
        }

        thread::sleep(Duration::from_millis(LOOP_DELAY_MS));
    }
}

fn halt(err: SensorInitError) -> ! {
    error!("{err}");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

fn render_frame(frame: &Frame, utc_offset_secs: i32) {
    for line in frame.lines(utc_offset_secs) {
        info!("| {line}");
    }
}

fn open_i2c<'d, I: I2c>(
    i2c: impl Peripheral<P = I> + 'd,
    sda: impl Peripheral<P = impl InputPin + OutputPin> + 'd,
    scl: impl Peripheral<P = impl InputPin + OutputPin> + 'd,
) -> anyhow::Result<I2cDriver<'d>> {
    let config = I2cConfig::new().baudrate(400.kHz().into());
    Ok(I2cDriver::new(i2c, sda, scl, &config)?)
}

struct Core2Board {
    internal: I2cDriver<'static>,
    port_a: I2cDriver<'static>,
}

impl Core2Board {
    fn new(
        mut internal: I2cDriver<'static>,
        mut port_a: I2cDriver<'static>,
    ) -> Result<Self, SensorInitError> {
        init_vcnl4040(&mut port_a)?;
        info!("VCNL4040 ready");
        init_sht4x(&mut port_a)?;
        info!("SHT40 ready");
        init_mpu6886(&mut internal)?;
        info!("MPU6886 ready");

        Ok(Self { internal, port_a })
    }

    fn button_b_down(&mut self) -> bool {
        let mut raw = [0_u8; 5];
        if let Err(err) = self
            .internal
            .write_read(FT6336_ADDR, &[FT6336_REG_TD_STATUS], &mut raw, BLOCK)
        {
            warn!("touch read failed: {err:?}");
            return false;
        }

        if raw[0] & 0x0F == 0 {
            return false;
        }

        let x = (u16::from(raw[1] & 0x0F) << 8) | u16::from(raw[2]);
        let y = (u16::from(raw[3] & 0x0F) << 8) | u16::from(raw[4]);
        let (zone_x, zone_y, width, height) = BUTTON_B_ZONE;
        (zone_x..zone_x + width).contains(&x) && (zone_y..zone_y + height).contains(&y)
    }

    fn read_vcnl4040(&mut self) -> Result<(i32, i32, i32), SensorError> {
        let prox = read_u16_le(&mut self.port_a, VCNL4040_ADDR, VCNL4040_REG_PS_DATA)
            .map_err(|reason| sensor_error("VCNL4040", reason))?;
        let als = read_u16_le(&mut self.port_a, VCNL4040_ADDR, VCNL4040_REG_ALS_DATA)
            .map_err(|reason| sensor_error("VCNL4040", reason))?;
        let white = read_u16_le(&mut self.port_a, VCNL4040_ADDR, VCNL4040_REG_WHITE_DATA)
            .map_err(|reason| sensor_error("VCNL4040", reason))?;

        let lux = (f32::from(als) * VCNL4040_LUX_PER_COUNT) as i32;
        Ok((i32::from(prox), lux, i32::from(white)))
    }

    fn read_sht4x(&mut self) -> Result<(f64, f64), SensorError> {
        self.port_a
            .write(SHT4X_ADDR, &[SHT4X_CMD_MEASURE_HIGH], BLOCK)
            .map_err(|err| sensor_error("SHT40", format!("{err:?}")))?;
        thread::sleep(Duration::from_millis(10));

        let mut raw = [0_u8; 6];
        self.port_a
            .read(SHT4X_ADDR, &mut raw, BLOCK)
            .map_err(|err| sensor_error("SHT40", format!("{err:?}")))?;

        let temp_ticks = checked_word(&raw[0..3]).map_err(|reason| sensor_error("SHT40", reason))?;
        let rh_ticks = checked_word(&raw[3..6]).map_err(|reason| sensor_error("SHT40", reason))?;

        let temp_c = -45.0 + 175.0 * f64::from(temp_ticks) / 65535.0;
        let rel_humidity = (-6.0 + 125.0 * f64::from(rh_ticks) / 65535.0).clamp(0.0, 100.0);
        Ok((temp_c, rel_humidity))
    }

    fn read_mpu6886(&mut self) -> Result<[f64; 3], SensorError> {
        let mut raw = [0_u8; 6];
        self.internal
            .write_read(MPU6886_ADDR, &[MPU6886_REG_ACCEL_XOUT_H], &mut raw, BLOCK)
            .map_err(|err| sensor_error("MPU6886", format!("{err:?}")))?;

        let axis = |hi: usize| {
            let counts = i16::from_be_bytes([raw[hi], raw[hi + 1]]);
            accel_g_to_ms2(f32::from(counts) * MPU6886_ACCEL_SCALE)
        };
        Ok([axis(0), axis(2), axis(4)])
    }
}

impl SensorSource for Core2Board {
    fn read(&mut self) -> Result<SensorReadings, SensorError> {
        let (prox, ambient_light, white_light) = self.read_vcnl4040()?;
        let (temp_c, rel_humidity) = self.read_sht4x()?;
        let [acc_x, acc_y, acc_z] = self.read_mpu6886()?;

        info!("[SHT40] {temp_c:.2}C {rel_humidity:.2}%rH  [VCNL4040] ps={prox} al={ambient_light} w={white_light}");

        Ok(SensorReadings {
            prox,
            ambient_light,
            white_light,
            temp_c,
            rel_humidity,
            acc_x,
            acc_y,
            acc_z,
        })
    }
}

fn init_vcnl4040(bus: &mut I2cDriver<'static>) -> Result<(), SensorInitError> {
    let id = read_u16_le(bus, VCNL4040_ADDR, VCNL4040_REG_ID)
        .map_err(|reason| init_error("VCNL4040", reason))?;
    if id != VCNL4040_ID {
        return Err(init_error("VCNL4040", format!("unexpected id {id:#06x}")));
    }

    // Power up ALS and PS; PS_HD selects 16-bit proximity output.
    for (reg, lsb, msb) in [
        (VCNL4040_REG_ALS_CONF, 0x00, 0x00),
        (VCNL4040_REG_PS_CONF1, 0x00, 0x08),
        (VCNL4040_REG_PS_CONF3, 0x00, 0x00),
    ] {
        bus.write(VCNL4040_ADDR, &[reg, lsb, msb], BLOCK)
            .map_err(|err| init_error("VCNL4040", format!("{err:?}")))?;
    }
    Ok(())
}

fn init_sht4x(bus: &mut I2cDriver<'static>) -> Result<(), SensorInitError> {
    bus.write(SHT4X_ADDR, &[SHT4X_CMD_SOFT_RESET], BLOCK)
        .map_err(|err| init_error("SHT40", format!("{err:?}")))?;
    thread::sleep(Duration::from_millis(2));

    bus.write(SHT4X_ADDR, &[SHT4X_CMD_SERIAL], BLOCK)
        .map_err(|err| init_error("SHT40", format!("{err:?}")))?;
    thread::sleep(Duration::from_millis(2));

    let mut raw = [0_u8; 6];
    bus.read(SHT4X_ADDR, &mut raw, BLOCK)
        .map_err(|err| init_error("SHT40", format!("{err:?}")))?;
    let high = checked_word(&raw[0..3]).map_err(|reason| init_error("SHT40", reason))?;
    let low = checked_word(&raw[3..6]).map_err(|reason| init_error("SHT40", reason))?;
    info!("SHT40 serial {:#010x}", (u32::from(high) << 16) | u32::from(low));
    Ok(())
}

fn init_mpu6886(bus: &mut I2cDriver<'static>) -> Result<(), SensorInitError> {
    let mut who_am_i = [0_u8; 1];
    bus.write_read(MPU6886_ADDR, &[MPU6886_REG_WHO_AM_I], &mut who_am_i, BLOCK)
        .map_err(|err| init_error("MPU6886", format!("{err:?}")))?;
    if who_am_i[0] != MPU6886_WHO_AM_I {
        return Err(init_error(
            "MPU6886",
            format!("unexpected WHO_AM_I {:#04x}", who_am_i[0]),
        ));
    }

    for (reg, value) in [(MPU6886_REG_PWR_MGMT_1, 0x00), (MPU6886_REG_ACCEL_CONFIG, 0x10)] {
        bus.write(MPU6886_ADDR, &[reg, value], BLOCK)
            .map_err(|err| init_error("MPU6886", format!("{err:?}")))?;
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn read_u16_le(bus: &mut I2cDriver<'static>, addr: u8, reg: u8) -> Result<u16, String> {
    let mut raw = [0_u8; 2];
    bus.write_read(addr, &[reg], &mut raw, BLOCK)
        .map_err(|err| format!("{err:?}"))?;
    Ok(u16::from_le_bytes(raw))
}

/// Two data bytes followed by their CRC-8 (poly 0x31, init 0xFF).
fn checked_word(chunk: &[u8]) -> Result<u16, String> {
    let [hi, lo, crc] = chunk else {
        return Err(format!("expected 3 bytes, got {}", chunk.len()));
    };
    let computed = crc8(&[*hi, *lo]);
    if computed != *crc {
        return Err(format!("crc mismatch ({computed:#04x} != {crc:#04x})"));
    }
    Ok(u16::from_be_bytes([*hi, *lo]))
}

fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFF_u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn sensor_error(sensor: &'static str, reason: String) -> SensorError {
    SensorError { sensor, reason }
}

fn init_error(sensor: &'static str, reason: String) -> SensorInitError {
    SensorInitError { sensor, reason }
}

struct EspTransport {
    timeout: Duration,
}

impl EspTransport {
    fn connect(&self, url: &str) -> Result<HttpClient<EspHttpConnection>, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&conf).map_err(|err| TransportError::Connect {
            url: url.to_string(),
            reason: format!("{err:?}"),
        })?;
        Ok(HttpClient::wrap(connection))
    }
}

impl HttpTransport for EspTransport {
    fn get(&mut self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        let mut client = self.connect(&request.url)?;
        let headers: Vec<(&str, &str)> = request.headers.iter().collect();

        let pending = client
            .request(Method::Get, &request.url, &headers)
            .map_err(|err| connect_error(&request.url, err))?;
        let mut response = pending
            .submit()
            .map_err(|err| connect_error(&request.url, err))?;

        let status = i32::from(response.status());
        let body = read_body(&mut response)?;
        Ok(RawResponse { status, body })
    }

    fn post(
        &mut self,
        request: &RequestDescriptor,
        body: &mut dyn io::Read,
    ) -> Result<RawResponse, TransportError> {
        let mut payload = Vec::new();
        io::Read::read_to_end(body, &mut payload).map_err(|source| TransportError::Io {
            url: request.url.clone(),
            source,
        })?;

        let content_length = payload.len().to_string();
        let mut headers: Vec<(&str, &str)> = request.headers.iter().collect();
        headers.push(("Content-Length", content_length.as_str()));

        let mut client = self.connect(&request.url)?;
        let mut pending = client
            .request(Method::Post, &request.url, &headers)
            .map_err(|err| connect_error(&request.url, err))?;
        for chunk in payload.chunks(UPLOAD_CHUNK_SIZE) {
            pending
                .write_all(chunk)
                .map_err(|err| TransportError::Other(format!("{}: {err:?}", request.url)))?;
        }
        pending
            .flush()
            .map_err(|err| TransportError::Other(format!("{}: {err:?}", request.url)))?;

        let mut response = pending
            .submit()
            .map_err(|err| connect_error(&request.url, err))?;
        let status = i32::from(response.status());
        let body = read_body(&mut response)?;
        Ok(RawResponse { status, body })
    }
}

fn connect_error(url: &str, err: impl std::fmt::Debug) -> TransportError {
    TransportError::Connect {
        url: url.to_string(),
        reason: format!("{err:?}"),
    }
}

fn read_body<R: Read>(response: &mut R) -> Result<String, TransportError>
where
    R::Error: std::fmt::Debug,
{
    let mut body = Vec::new();
    let mut chunk = [0_u8; 512];

    loop {
        let read = response
            .read(&mut chunk)
            .map_err(|err| TransportError::Other(format!("{err:?}")))?;
        if read == 0 {
            break;
        }
        if body.len() + read > MAX_HTTP_BODY {
            return Err(TransportError::Other(format!(
                "response body exceeds {MAX_HTTP_BODY} bytes"
            )));
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

struct NvsFileCounter {
    partition: EspDefaultNvsPartition,
}

impl NvsFileCounter {
    fn open(&self) -> io::Result<EspNvs<esp_idf_svc::nvs::NvsDefault>> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| io::Error::other(format!("{err:?}")))
    }
}

impl FileCounter for NvsFileCounter {
    fn read(&mut self) -> io::Result<u8> {
        let nvs = self.open()?;
        let value = nvs
            .get_u8(NVS_FILE_COUNTER_KEY)
            .map_err(|err| io::Error::other(format!("{err:?}")))?;
        Ok(value.unwrap_or(0))
    }

    fn store(&mut self, value: u8) -> io::Result<()> {
        let nvs = self.open()?;
        nvs.set_u8(NVS_FILE_COUNTER_KEY, value)
            .map_err(|err| io::Error::other(format!("{err:?}")))
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn start_time_sync() -> anyhow::Result<EspSntp<'static>> {
    let sntp = EspSntp::new_default().context("failed to start sntp")?;
    let started = Instant::now();

    while sntp.get_sync_status() != SyncStatus::Completed {
        if started.elapsed() >= Duration::from_secs(SNTP_WAIT_SECS) {
            warn!("sntp not synced after {SNTP_WAIT_SECS}s; capture times may be wrong");
            return Ok(sntp);
        }
        thread::sleep(Duration::from_millis(200));
    }

    info!("time synced");
    Ok(sntp)
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
