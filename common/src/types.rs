pub const STANDARD_GRAVITY_APPROX: f64 = 9.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Live,
    Cloud,
}

impl View {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::Cloud => "CLOUD",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Live => Self::Cloud,
            Self::Cloud => Self::Live,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Live => "Live Data",
            Self::Cloud => "Cloud Data",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReadings {
    pub prox: i32,
    pub ambient_light: i32,
    pub white_light: i32,
    pub temp_c: f64,
    pub rel_humidity: f64,
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Snapshot {
    pub prox: i32,
    pub ambient_light: i32,
    pub white_light: i32,
    pub rel_humidity: f64,
    /// Degrees Celsius.
    pub temp: f64,
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    /// Epoch seconds.
    pub time_captured: i64,
    /// Epoch milliseconds, 0 until the server has stored it.
    pub cloud_upload_time: i64,
}

impl Snapshot {
    pub fn capture(readings: SensorReadings, time_captured: i64) -> Self {
        Self {
            prox: readings.prox,
            ambient_light: readings.ambient_light,
            white_light: readings.white_light,
            rel_humidity: readings.rel_humidity,
            temp: readings.temp_c,
            acc_x: readings.acc_x,
            acc_y: readings.acc_y,
            acc_z: readings.acc_z,
            time_captured,
            cloud_upload_time: 0,
        }
    }

    pub fn temp_f(&self) -> f64 {
        celsius_to_fahrenheit(self.temp)
    }
}

pub fn celsius_to_fahrenheit(temp_c: f64) -> f64 {
    temp_c * 9.0 / 5.0 + 32.0
}

pub fn accel_g_to_ms2(g: f32) -> f64 {
    f64::from(g) * STANDARD_GRAVITY_APPROX
}
