//! Vendor API client: the two-step credential exchange (§4.2) that yields a
//! device list with type, firmware version, MAC, id and salt.

use md5::{Digest, Md5};
use serde::Deserialize;
use std::error::Error as StdError;
use std::time::Duration;
use tracing::warn;

const MOBILE_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 HameSolarApp/2.3.1";

const LOGIN_PATH: &str = "/app/Solar/v2_get_device.php";
const DEVICE_LIST_PATH: &str = "/ems/api/v1/getDeviceList";

const MAX_CALL_ATTEMPTS: u32 = 3;
const MAX_FETCH_ATTEMPTS: u32 = 2;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(10);
const BACKOFF_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct VendorDevice {
    pub devid: String,
    #[serde(default)]
    pub name: Option<String>,
    pub mac: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default, deserialize_with = "version_from_string_or_number")]
    pub version: Option<f64>,
    #[serde(default)]
    pub salt: Option<String>,
}

fn version_from_string_or_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(f64),
    }
    let raw = Option::<StringOrNumber>::deserialize(deserializer)?;
    Ok(match raw {
        None => None,
        Some(StringOrNumber::Number(n)) => Some(n),
        Some(StringOrNumber::String(s)) if s.is_empty() => None,
        Some(StringOrNumber::String(s)) => s.parse().ok(),
    })
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct DeviceListResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<VendorDevice>,
}

#[derive(Debug)]
pub enum BadCredentialsKind {
    EmailNotRegistered,
    WrongPassword,
    Unknown(String),
}

impl std::fmt::Display for BadCredentialsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BadCredentialsKind::EmailNotRegistered => write!(f, "email not registered"),
            BadCredentialsKind::WrongPassword => write!(f, "wrong password"),
            BadCredentialsKind::Unknown(code) => write!(f, "unknown login code {code}"),
        }
    }
}

#[derive(Debug)]
pub enum VendorApiError {
    Transport { message: String, retryable: bool },
    ServerError(u16),
    UnexpectedResponse(String),
    Deserialize(String),
    BadCredentials(BadCredentialsKind),
}

impl VendorApiError {
    fn is_retryable(&self) -> bool {
        match self {
            VendorApiError::ServerError(_) => true,
            VendorApiError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        let retryable = classify_transport_retryable(&err);
        VendorApiError::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

impl std::fmt::Display for VendorApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VendorApiError::Transport { message, .. } => write!(f, "transport error: {message}"),
            VendorApiError::ServerError(status) => write!(f, "vendor API returned HTTP {status}"),
            VendorApiError::UnexpectedResponse(s) => write!(f, "unexpected response: {s}"),
            VendorApiError::Deserialize(s) => write!(f, "could not parse response: {s}"),
            VendorApiError::BadCredentials(kind) => write!(f, "login rejected: {kind}"),
        }
    }
}

impl std::error::Error for VendorApiError {}

/// Walks the error source chain looking for an OS-level timeout or
/// connection-reset, matching the ETIMEDOUT/ECONNRESET classification in
/// §4.2. `reqwest`'s own `is_timeout()` covers client-side timeouts.
fn classify_transport_retryable(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(s) = source {
        if let Some(io_err) = s.downcast_ref::<std::io::Error>() {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        source = s.source();
    }
    false
}

fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = BASE_DELAY.as_millis() as u64;
    let ms = base_ms.saturating_mul((BACKOFF_MULTIPLIER as u64).saturating_pow(attempt - 1));
    Duration::from_millis(ms).min(MAX_DELAY)
}

pub struct VendorApiClient {
    http: reqwest::Client,
    base_url: String,
    mailbox: String,
    password: String,
}

impl VendorApiClient {
    pub fn new(base_url: impl Into<String>, mailbox: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            mailbox: mailbox.into(),
            password: password.into(),
        }
    }

    /// The full two-step flow, retried as a composite up to
    /// `MAX_FETCH_ATTEMPTS` times.
    pub async fn fetch_devices(&self) -> Result<Vec<VendorDevice>, VendorApiError> {
        let mut last_err = None;
        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            match self.fetch_devices_once().await {
                Ok(devices) => return Ok(devices),
                Err(err) => {
                    warn!(attempt, error = %err, "fetchDevices attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    async fn fetch_devices_once(&self) -> Result<Vec<VendorDevice>, VendorApiError> {
        let token = self.login_with_retry().await?;
        self.device_list_with_retry(&token).await
    }

    async fn login_with_retry(&self) -> Result<String, VendorApiError> {
        let mut attempt = 1;
        loop {
            match self.login().await {
                Ok(token) => return Ok(token),
                Err(err) if attempt < MAX_CALL_ATTEMPTS && err.is_retryable() => {
                    let delay = backoff_delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "login call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn device_list_with_retry(&self, token: &str) -> Result<Vec<VendorDevice>, VendorApiError> {
        let mut attempt = 1;
        loop {
            match self.device_list(token).await {
                Ok(devices) => return Ok(devices),
                Err(err) if attempt < MAX_CALL_ATTEMPTS && err.is_retryable() => {
                    let delay = backoff_delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "getDeviceList call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn login(&self) -> Result<String, VendorApiError> {
        let pwd_hash = hex::encode(Md5::digest(self.password.as_bytes()));
        let url = format!("{}{LOGIN_PATH}", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("mailbox", self.mailbox.as_str()), ("pwd", pwd_hash.as_str())])
            .header(reqwest::header::USER_AGENT, MOBILE_USER_AGENT)
            .send()
            .await
            .map_err(VendorApiError::from_transport)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(VendorApiError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(VendorApiError::UnexpectedResponse(format!("HTTP {status}")));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| VendorApiError::Deserialize(e.to_string()))?;

        match body.code.as_str() {
            "2" if !body.token.is_empty() => Ok(body.token),
            "3" => Err(VendorApiError::BadCredentials(BadCredentialsKind::EmailNotRegistered)),
            "4" => Err(VendorApiError::BadCredentials(BadCredentialsKind::WrongPassword)),
            _ => Err(VendorApiError::BadCredentials(BadCredentialsKind::Unknown(
                format!("{} ({})", body.code, body.msg),
            ))),
        }
    }

    async fn device_list(&self, token: &str) -> Result<Vec<VendorDevice>, VendorApiError> {
        let url = format!("{}{DEVICE_LIST_PATH}", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("mailbox", self.mailbox.as_str()), ("token", token)])
            .header(reqwest::header::USER_AGENT, MOBILE_USER_AGENT)
            .send()
            .await
            .map_err(VendorApiError::from_transport)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(VendorApiError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(VendorApiError::UnexpectedResponse(format!("HTTP {status}")));
        }

        let body: DeviceListResponse = response
            .json()
            .await
            .map_err(|e| VendorApiError::Deserialize(e.to_string()))?;

        if body.code != 1 {
            return Err(VendorApiError::UnexpectedResponse(format!(
                "getDeviceList code {} ({})",
                body.code, body.msg
            )));
        }
        Ok(body.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_base_mult_cap_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
        assert_eq!(backoff_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn version_parses_from_string_or_number() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "version_from_string_or_number")]
            version: Option<f64>,
        }
        let from_string: Wrapper = serde_json::from_str(r#"{"version":"136.5"}"#).unwrap();
        assert_eq!(from_string.version, Some(136.5));
        let from_number: Wrapper = serde_json::from_str(r#"{"version":154.0}"#).unwrap();
        assert_eq!(from_number.version, Some(154.0));
        let from_empty: Wrapper = serde_json::from_str(r#"{"version":""}"#).unwrap();
        assert_eq!(from_empty.version, None);
    }

    #[test]
    fn vendor_api_error_classifies_server_errors_as_retryable() {
        let err = VendorApiError::ServerError(503);
        assert!(err.is_retryable());
        let err = VendorApiError::UnexpectedResponse("boom".to_owned());
        assert!(!err.is_retryable());
    }
}
