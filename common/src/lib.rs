pub mod cloud;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod retry;
pub mod storage;
pub mod transport;
pub mod types;

pub use cloud::{CloudClient, FileUploadError};
pub use codec::{CodecError, DEFAULT_HEADER_CAPACITY};
pub use config::{CloudConfig, DeviceConfig, NetworkConfig, RuntimeConfig};
pub use dispatch::{
    dispatch_step, run_cycle, AppState, Clock, CycleReport, Frame, SensorError, SensorInitError,
    SensorSource, StepReport, SystemClock, UploadStatus,
};
pub use retry::{retry_until_ok, RetryOutcome, RetryPolicy};
pub use storage::{FileCounter, MemoryCounter, SnapshotFileStore};
pub use transport::{
    Headers, HttpTransport, RawResponse, RequestDescriptor, TransportError, STATUS_OK,
    STATUS_TRANSPORT_ERROR,
};
pub use types::{SensorReadings, Snapshot, View};
