use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Snapshot;

/// Upper bound on a serialized header document, in bytes.
pub const DEFAULT_HEADER_CAPACITY: usize = 650;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoded payload is {size} bytes, exceeds capacity of {capacity} bytes")]
    EncodingOverflow { size: usize, capacity: usize },
    #[error("failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed response body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("response field `{field}` is not a valid number: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Serialize)]
struct SnapshotHeader<'a> {
    #[serde(rename = "vcnlDetails")]
    vcnl_details: VcnlDetails,
    #[serde(rename = "shtDetails")]
    sht_details: ShtDetails,
    #[serde(rename = "m5Details")]
    m5_details: ImuDetails,
    #[serde(rename = "otherDetails")]
    other_details: OtherDetails<'a>,
}

#[derive(Debug, Serialize)]
struct VcnlDetails {
    prox: i32,
    al: i32,
    rwl: i32,
}

#[derive(Debug, Serialize)]
struct ShtDetails {
    temp: f64,
    #[serde(rename = "rHum")]
    rel_humidity: f64,
}

#[derive(Debug, Serialize)]
struct ImuDetails {
    ax: f64,
    ay: f64,
    az: f64,
}

#[derive(Debug, Serialize)]
struct OtherDetails<'a> {
    #[serde(rename = "timeCaptured")]
    time_captured: i64,
    #[serde(rename = "userId")]
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct UserIdHeader<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(rename = "otherDetails")]
    other_details: LatestOtherDetails,
    #[serde(rename = "shtDetails")]
    sht_details: LatestShtDetails,
}

#[derive(Debug, Deserialize)]
struct LatestOtherDetails {
    #[serde(rename = "cloudUploadTime")]
    cloud_upload_time: WireScalar,
    #[serde(rename = "timeCaptured")]
    time_captured: WireScalar,
}

#[derive(Debug, Deserialize)]
struct LatestShtDetails {
    temp: WireScalar,
    #[serde(rename = "rHum")]
    rel_humidity: WireScalar,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireScalar {
    Text(String),
    Number(serde_json::Number),
}

impl WireScalar {
    fn to_i64(&self, field: &'static str) -> Result<i64, CodecError> {
        let parsed = match self {
            Self::Text(text) => text.trim().parse::<i64>().ok(),
            Self::Number(number) => number.as_i64(),
        };
        parsed.ok_or_else(|| self.invalid(field))
    }

    fn to_f64(&self, field: &'static str) -> Result<f64, CodecError> {
        let parsed = match self {
            Self::Text(text) => text.trim().parse::<f64>().ok(),
            Self::Number(number) => number.as_f64(),
        };
        parsed
            .filter(|value| value.is_finite())
            .ok_or_else(|| self.invalid(field))
    }

    fn invalid(&self, field: &'static str) -> CodecError {
        let value = match self {
            Self::Text(text) => text.clone(),
            Self::Number(number) => number.to_string(),
        };
        CodecError::InvalidField { field, value }
    }
}

pub fn encode_snapshot_header(
    user_id: &str,
    time_captured: i64,
    snapshot: &Snapshot,
    capacity: usize,
) -> Result<String, CodecError> {
    let header = SnapshotHeader {
        vcnl_details: VcnlDetails {
            prox: snapshot.prox,
            al: snapshot.ambient_light,
            rwl: snapshot.white_light,
        },
        sht_details: ShtDetails {
            temp: snapshot.temp,
            rel_humidity: snapshot.rel_humidity,
        },
        m5_details: ImuDetails {
            ax: snapshot.acc_x,
            ay: snapshot.acc_y,
            az: snapshot.acc_z,
        },
        other_details: OtherDetails {
            time_captured,
            user_id,
        },
    };

    serialize_bounded(&header, capacity)
}

pub fn encode_user_id_header(user_id: &str, capacity: usize) -> Result<String, CodecError> {
    serialize_bounded(&UserIdHeader { user_id }, capacity)
}

pub fn decode_snapshot_response(body: &str) -> Result<Snapshot, CodecError> {
    let mut snapshot = Snapshot::default();
    decode_snapshot_response_into(body, &mut snapshot)?;
    Ok(snapshot)
}

/// Writes the echoed fields into `target`, touching nothing unless the whole body
/// parsed.
pub fn decode_snapshot_response_into(body: &str, target: &mut Snapshot) -> Result<(), CodecError> {
    let response: LatestResponse = serde_json::from_str(body).map_err(CodecError::Decode)?;

    let cloud_upload_time = response
        .other_details
        .cloud_upload_time
        .to_i64("otherDetails.cloudUploadTime")?;
    let time_captured = response
        .other_details
        .time_captured
        .to_i64("otherDetails.timeCaptured")?;
    let temp = response.sht_details.temp.to_f64("shtDetails.temp")?;
    let rel_humidity = response
        .sht_details
        .rel_humidity
        .to_f64("shtDetails.rHum")?;

    target.cloud_upload_time = cloud_upload_time;
    target.time_captured = time_captured;
    target.temp = temp;
    target.rel_humidity = rel_humidity;
    Ok(())
}

fn serialize_bounded<T: Serialize>(payload: &T, capacity: usize) -> Result<String, CodecError> {
    let encoded = serde_json::to_string(payload).map_err(CodecError::Serialize)?;
    if encoded.len() > capacity {
        return Err(CodecError::EncodingOverflow {
            size: encoded.len(),
            capacity,
        });
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            prox: 12,
            ambient_light: 300,
            white_light: 50,
            rel_humidity: 44.0,
            temp: 21.5,
            acc_x: 0.1,
            acc_y: 9.7,
            acc_z: 0.2,
            time_captured: 1_700_000_000,
            cloud_upload_time: 0,
        }
    }

    #[test]
    fn encodes_grouped_snapshot_header() {
        let encoded = encode_snapshot_header(
            "MyUserName",
            1_700_000_000,
            &sample_snapshot(),
            DEFAULT_HEADER_CAPACITY,
        )
        .unwrap();

        assert_eq!(
            encoded,
            concat!(
                r#"{"vcnlDetails":{"prox":12,"al":300,"rwl":50},"#,
                r#""shtDetails":{"temp":21.5,"rHum":44.0},"#,
                r#""m5Details":{"ax":0.1,"ay":9.7,"az":0.2},"#,
                r#""otherDetails":{"timeCaptured":1700000000,"userId":"MyUserName"}}"#,
            )
        );
    }

    #[test]
    fn header_omits_cloud_upload_time() {
        let snapshot = Snapshot {
            cloud_upload_time: 1_700_000_123_456,
            ..sample_snapshot()
        };
        let encoded =
            encode_snapshot_header("u", 1, &snapshot, DEFAULT_HEADER_CAPACITY).unwrap();

        assert!(!encoded.contains("cloudUploadTime"));
        assert!(!encoded.contains("1700000123456"));
    }

    #[test]
    fn encoding_is_deterministic() {
        let snapshot = sample_snapshot();
        let first = encode_snapshot_header("MyUserName", 42, &snapshot, 650).unwrap();
        let second = encode_snapshot_header("MyUserName", 42, &snapshot, 650).unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn oversized_header_fails_instead_of_truncating() {
        let user_id = "x".repeat(DEFAULT_HEADER_CAPACITY);
        let err = encode_snapshot_header(&user_id, 1, &sample_snapshot(), DEFAULT_HEADER_CAPACITY)
            .unwrap_err();

        match err {
            CodecError::EncodingOverflow { size, capacity } => {
                assert!(size > capacity);
                assert_eq!(capacity, DEFAULT_HEADER_CAPACITY);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn capacity_boundary_is_inclusive() {
        let exact = encode_user_id_header("abc", 4096).unwrap();
        assert!(encode_user_id_header("abc", exact.len()).is_ok());
        assert!(matches!(
            encode_user_id_header("abc", exact.len() - 1),
            Err(CodecError::EncodingOverflow { .. })
        ));
    }

    #[test]
    fn encodes_user_id_header() {
        let encoded = encode_user_id_header("MyUserName", DEFAULT_HEADER_CAPACITY).unwrap();
        assert_eq!(encoded, r#"{"userId":"MyUserName"}"#);
    }

    #[test]
    fn user_id_is_json_escaped() {
        let encoded = encode_user_id_header("a\"b", DEFAULT_HEADER_CAPACITY).unwrap();
        assert_eq!(encoded, r#"{"userId":"a\"b"}"#);
    }

    #[test]
    fn decodes_text_typed_retrieval_body() {
        let body = r#"{"otherDetails":{"cloudUploadTime":"1700000123456","timeCaptured":"1700000000"},"shtDetails":{"temp":"21.4","rHum":"43.9"}}"#;
        let decoded = decode_snapshot_response(body).unwrap();

        assert_eq!(decoded.cloud_upload_time, 1_700_000_123_456);
        assert_eq!(decoded.time_captured, 1_700_000_000);
        assert!((decoded.temp - 21.4).abs() < 1e-9);
        assert!((decoded.rel_humidity - 43.9).abs() < 1e-9);
        assert_eq!(decoded.prox, 0);
        assert_eq!(decoded.ambient_light, 0);
        assert_eq!(decoded.acc_y, 0.0);
    }

    #[test]
    fn tolerates_bare_numbers_and_extra_fields() {
        let body = r#"{"otherDetails":{"cloudUploadTime":1700000123456,"timeCaptured":1700000000,"userId":"MyUserName"},"shtDetails":{"temp":21.4,"rHum":43.9},"vcnlDetails":{"prox":"3"}}"#;
        let decoded = decode_snapshot_response(body).unwrap();

        assert_eq!(decoded.cloud_upload_time, 1_700_000_123_456);
        assert_eq!(decoded.prox, 0);
    }

    #[test]
    fn header_values_survive_a_server_echo() {
        let snapshot = Snapshot {
            temp: 23.125,
            rel_humidity: 51.75,
            time_captured: 1_712_345_678,
            ..sample_snapshot()
        };
        let echoed = format!(
            r#"{{"otherDetails":{{"cloudUploadTime":"{}","timeCaptured":"{}"}},"shtDetails":{{"temp":"{}","rHum":"{}"}}}}"#,
            1_712_345_679_000_i64, snapshot.time_captured, snapshot.temp, snapshot.rel_humidity
        );
        let decoded = decode_snapshot_response(&echoed).unwrap();

        assert_eq!(decoded.time_captured, snapshot.time_captured);
        assert_eq!(decoded.cloud_upload_time, 1_712_345_679_000);
        assert!((decoded.temp - snapshot.temp).abs() < 1e-9);
        assert!((decoded.rel_humidity - snapshot.rel_humidity).abs() < 1e-9);
    }

    #[test]
    fn malformed_body_leaves_target_untouched() {
        let mut target = sample_snapshot();
        target.cloud_upload_time = 99;
        let before = target;

        let err = decode_snapshot_response_into("<html>502</html>", &mut target).unwrap_err();

        assert!(matches!(err, CodecError::Decode(_)));
        assert_eq!(target, before);
    }

    #[test]
    fn non_numeric_leaf_leaves_target_untouched() {
        let mut target = sample_snapshot();
        let before = target;
        let body = r#"{"otherDetails":{"cloudUploadTime":"1700000123456","timeCaptured":"1700000000"},"shtDetails":{"temp":"warm","rHum":"43.9"}}"#;

        let err = decode_snapshot_response_into(body, &mut target).unwrap_err();

        match err {
            CodecError::InvalidField { field, value } => {
                assert_eq!(field, "shtDetails.temp");
                assert_eq!(value, "warm");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(target, before);
    }

    #[test]
    fn missing_group_is_a_decode_error() {
        let body = r#"{"otherDetails":{"cloudUploadTime":"1","timeCaptured":"2"}}"#;
        assert!(matches!(
            decode_snapshot_response(body),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn non_finite_temperature_is_rejected() {
        let body = r#"{"otherDetails":{"cloudUploadTime":"1","timeCaptured":"2"},"shtDetails":{"temp":"NaN","rHum":"1"}}"#;
        assert!(matches!(
            decode_snapshot_response(body),
            Err(CodecError::InvalidField { .. })
        ));
    }
}
