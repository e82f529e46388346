use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;

use super::command::CommandKind;
use super::device::DeviceType;

/// Transport-level failure talking to a board
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

/// Body of `GET /info`. Every field is optional on the wire, and a field
/// of the wrong type reads as absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoResponse {
    /// Family marker, e.g. `DDM-ESP32`
    #[serde(deserialize_with = "lenient")]
    pub system: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub device_id: Option<String>,
    #[serde(rename = "type", deserialize_with = "lenient")]
    pub device_type: DeviceType,
    #[serde(deserialize_with = "lenient")]
    pub led_count: Option<u32>,
    #[serde(deserialize_with = "lenient")]
    pub led_type: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub color_order: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub max_brightness: Option<u8>,
    #[serde(deserialize_with = "lenient")]
    pub current_brightness: Option<u8>,
    #[serde(deserialize_with = "lenient")]
    pub firmware_version: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub mac_address: Option<String>,
    #[serde(deserialize_with = "lenient_count")]
    pub uptime: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    pub temperature: Option<f64>,
    #[serde(deserialize_with = "lenient_count")]
    pub free_memory: Option<u64>,
}

/// Body of `GET /status`. Same leniency rules as [`InfoResponse`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    #[serde(deserialize_with = "lenient_count")]
    pub uptime: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    pub temperature: Option<f64>,
    #[serde(deserialize_with = "lenient_count")]
    pub free_memory: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    pub cpu_usage: Option<f64>,
    /// dBm
    #[serde(deserialize_with = "lenient")]
    pub wifi_strength: Option<i32>,
    #[serde(deserialize_with = "lenient")]
    pub error_count: Option<u32>,
    #[serde(deserialize_with = "lenient")]
    pub firmware_version: Option<String>,
}

/// Read a field, falling back to its default if it has the wrong shape
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Like [`lenient`], but a non-negative float such as `3600.5` is truncated
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0 && *f < u64::MAX as f64)
            .map(|f| f as u64)
    }))
}

/// Body of a 2xx reply to `POST /command`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandReply {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Trait for the board-facing wire contract
///
/// This trait allows for mocking the boards for testing purposes
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Whether `address` accepts a TCP connection within `timeout`
    async fn connect_check(&self, address: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }

    /// `GET /info`
    async fn fetch_info(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<InfoResponse, TransportError>;

    /// `GET /status`
    async fn fetch_status(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<StatusResponse, TransportError>;

    /// `GET /ping`; any 2xx counts as alive
    async fn ping(&self, address: &str, timeout: Duration) -> Result<(), TransportError>;

    /// `POST /command` with `{command, parameters}`
    async fn send_command(
        &self,
        address: &str,
        command: &CommandKind,
        timeout: Duration,
    ) -> Result<CommandReply, TransportError>;
}

/// Real board client using reqwest
pub struct HttpDeviceClient {
    http: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new() -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("derbyd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { http })
    }

    async fn get(&self, address: &str, path: &str, timeout: Duration) -> Result<String, TransportError> {
        let response = self
            .http
            .get(format!("http://{}{}", address, path))
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;
        read_body(response).await
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Unreachable(e.to_string())
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, TransportError> {
    let status = response.status();
    let body = response.text().await.map_err(classify)?;
    if !status.is_success() {
        return Err(TransportError::Status {
            code: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, TransportError> {
    serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn fetch_info(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<InfoResponse, TransportError> {
        decode(&self.get(address, "/info", timeout).await?)
    }

    async fn fetch_status(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<StatusResponse, TransportError> {
        decode(&self.get(address, "/status", timeout).await?)
    }

    async fn ping(&self, address: &str, timeout: Duration) -> Result<(), TransportError> {
        self.get(address, "/ping", timeout).await.map(|_| ())
    }

    async fn send_command(
        &self,
        address: &str,
        command: &CommandKind,
        timeout: Duration,
    ) -> Result<CommandReply, TransportError> {
        let response = self
            .http
            .post(format!("http://{}/command", address))
            .timeout(timeout)
            .json(command)
            .send()
            .await
            .map_err(classify)?;
        let body = read_body(response).await?;

        // Some firmware answers with plain text
        Ok(serde_json::from_str(&body).unwrap_or_else(|_| CommandReply {
            message: "ok".to_string(),
            data: Some(serde_json::json!({ "raw_response": body })),
        }))
    }
}

#[cfg(test)]
pub use mock::*;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_fields_are_optional() {
        let info: InfoResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(info, InfoResponse::default());

        let info: InfoResponse = serde_json::from_str(
            r#"{"system": "DDM-ESP32", "type": "matrix_wall", "led_count": 256, "extra": 1}"#,
        )
        .unwrap();
        assert_eq!(info.system.as_deref(), Some("DDM-ESP32"));
        assert_eq!(info.device_type, DeviceType::MatrixWall);
        assert_eq!(info.led_count, Some(256));
    }

    #[test]
    fn test_status_partial_payload() {
        let status: StatusResponse =
            serde_json::from_str(r#"{"free_memory": 900, "wifi_strength": -70}"#).unwrap();
        assert_eq!(status.free_memory, Some(900));
        assert_eq!(status.wifi_strength, Some(-70));
        assert!(status.temperature.is_none());
    }

    #[test]
    fn test_mistyped_fields_read_as_absent() {
        let status: StatusResponse = decode(
            r#"{"uptime": 3600.5, "temperature": "hot", "free_memory": -4, "error_count": 2}"#,
        )
        .unwrap();
        assert_eq!(status.uptime, Some(3600));
        assert!(status.temperature.is_none());
        assert!(status.free_memory.is_none());
        assert_eq!(status.error_count, Some(2));

        let info: InfoResponse = decode(
            r#"{"system": "DDM-ESP32", "type": 7, "max_brightness": 1000, "led_count": null}"#,
        )
        .unwrap();
        assert_eq!(info.system.as_deref(), Some("DDM-ESP32"));
        assert_eq!(info.device_type, DeviceType::Unknown);
        assert!(info.max_brightness.is_none());
        assert!(info.led_count.is_none());
    }

    #[test]
    fn test_unparseable_body_is_decode_error() {
        assert!(matches!(
            decode::<StatusResponse>("<html>oops</html>"),
            Err(TransportError::Decode(_))
        ));
        assert!(matches!(
            decode::<InfoResponse>("[1, 2]"),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_transport_error_display() {
        let e = TransportError::Status {
            code: 500,
            body: "LED driver fault".to_string(),
        };
        insta::assert_snapshot!(e.to_string(), @"HTTP 500: LED driver fault");
    }

    #[tokio::test]
    async fn test_mock_unknown_address_is_unreachable() {
        let client = MockDeviceClient::new();
        assert!(!client.connect_check("10.0.0.1:80", Duration::from_millis(50)).await);
        assert!(matches!(
            client.ping("10.0.0.1:80", Duration::from_millis(50)).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
