use std::io::{self, Read, Seek, SeekFrom};

use log::{info, warn};
use thiserror::Error;

use crate::{
    codec::{self, CodecError},
    config::CloudConfig,
    retry::{retry_until_ok, RetryOutcome},
    storage::{file_name_of, FileCounter, SnapshotFileStore},
    transport::{
        self, is_success, Headers, HttpTransport, RequestDescriptor, CONTENT_TYPE_TEXT_PLAIN,
        HEADER_CONTENT_DISPOSITION, HEADER_CONTENT_TYPE, HEADER_M5_DETAILS, HEADER_USER_ID,
        STATUS_TRANSPORT_ERROR,
    },
    types::Snapshot,
};

#[derive(Debug, Error)]
pub enum FileUploadError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("snapshot file unavailable: {0}")]
    Storage(#[from] io::Error),
}

pub struct CloudClient<T> {
    transport: T,
    config: CloudConfig,
}

impl<T: HttpTransport> CloudClient<T> {
    pub fn new(transport: T, config: CloudConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn upload_snapshot(&mut self, snapshot: &Snapshot) -> Result<bool, CodecError> {
        let request = RequestDescriptor::new(
            self.config.upload_url.clone(),
            Headers::new().with(HEADER_M5_DETAILS, self.snapshot_header(snapshot)?),
        );

        info!("posting snapshot captured at {}", snapshot.time_captured);
        let status = transport::get_with_headers(&mut self.transport, &request);
        Ok(is_success(status))
    }

    pub fn fetch_latest(&mut self) -> Result<Option<Snapshot>, CodecError> {
        let user_header = codec::encode_user_id_header(
            &self.config.user_id,
            self.config.header_capacity,
        )?;
        let request = RequestDescriptor::new(
            self.config.retrieve_url.clone(),
            Headers::new().with(HEADER_USER_ID, user_header),
        );

        let (status, snapshot) = transport::get_latest_with_headers(&mut self.transport, &request);
        if !is_success(status) {
            warn!("retrieval for `{}` returned {status}", self.config.user_id);
        }
        Ok(snapshot)
    }

    pub fn upload_file<R: Read + Seek>(
        &mut self,
        device_path: &str,
        snapshot: &Snapshot,
        file: &mut R,
    ) -> Result<RetryOutcome, CodecError> {
        let filename = file_name_of(device_path);
        let headers = Headers::new()
            .with(HEADER_CONTENT_TYPE, CONTENT_TYPE_TEXT_PLAIN)
            .with(
                HEADER_CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            )
            .with(HEADER_M5_DETAILS, self.snapshot_header(snapshot)?);
        let request = RequestDescriptor::new(self.config.file_upload_url(), headers);

        let http = &mut self.transport;
        let label = format!("upload of {filename}");
        Ok(retry_until_ok(self.config.retry, &label, |_attempt| {
            if let Err(err) = file.seek(SeekFrom::Start(0)) {
                warn!("failed to rewind {filename}: {err}");
                return STATUS_TRANSPORT_ERROR;
            }
            transport::post_file(&mut *http, &request, &mut *file)
        }))
    }

    pub fn upload_snapshot_file<C: FileCounter>(
        &mut self,
        store: &mut SnapshotFileStore<C>,
        snapshot: &Snapshot,
    ) -> Result<RetryOutcome, FileUploadError> {
        let payload = self.snapshot_header(snapshot)?;
        let device_path = store.write(payload.as_bytes())?;
        let mut file = store.open(&device_path)?;
        Ok(self.upload_file(&device_path, snapshot, &mut file)?)
    }

    fn snapshot_header(&self, snapshot: &Snapshot) -> Result<String, CodecError> {
        codec::encode_snapshot_header(
            &self.config.user_id,
            snapshot.time_captured,
            snapshot,
            self.config.header_capacity,
        )
    }
}
