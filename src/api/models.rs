use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Envelope header sent with every RPC call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    pub client: String,
    pub client_revision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Request body for a named RPC method
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<P> {
    pub header: RpcHeader,
    pub method: &'static str,
    pub parameters: P,
}

/// Fault returned instead of a result
#[derive(Debug, Clone, Deserialize)]
pub struct Fault {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Response envelope carrying either `result` or `fault`
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub fault: Option<Fault>,
}

/// Parameters of `getStreamKeyFromSongIDEx`
#[derive(Debug, Clone, Serialize)]
pub struct StreamKeyParams {
    #[serde(rename = "songID")]
    pub song_id: u64,
    pub country: Value,
    pub mobile: bool,
    pub prefetch: bool,
    #[serde(rename = "type")]
    pub kind: u8,
}

/// Result bundle of `getStreamKeyFromSongIDEx`
#[derive(Debug, Clone, Deserialize)]
pub struct StreamKeyResult {
    #[serde(default)]
    pub ip: String,
    #[serde(rename = "streamKey", default)]
    pub stream_key: String,
    #[serde(rename = "streamServerID", default, deserialize_with = "lenient_string")]
    pub stream_server_id: String,
    #[serde(rename = "uSecs", default, deserialize_with = "lenient_u64")]
    pub u_secs: u64,
}

/// Parameters of `markSongDownloadedEx`
#[derive(Debug, Clone, Serialize)]
pub struct MarkDownloadedParams {
    #[serde(rename = "songID")]
    pub song_id: u64,
    #[serde(rename = "streamKey")]
    pub stream_key: String,
    #[serde(rename = "streamServerID")]
    pub stream_server_id: String,
}

/// Result of `markSongDownloadedEx`
#[derive(Debug, Clone, Deserialize)]
pub struct MarkDownloadedResult {
    #[serde(rename = "Return", default)]
    pub returned: Value,
}

impl MarkDownloadedResult {
    /// The service answers with either a JSON bool or the string "true"
    pub fn is_affirmative(&self) -> bool {
        match &self.returned {
            Value::Bool(b) => *b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// HTTP proxy used for the streaming transport
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Configuration for the API client
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub client_name: String,
    pub client_revision: String,
    pub session: Option<String>,
    pub country: Value,
    pub proxy: Option<ProxyConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://grooveshark.com/more.php".to_string(),
            client_name: "htmlshark".to_string(),
            client_revision: "20130520".to_string(),
            session: None,
            country: json!({
                "ID": 1,
                "CC1": 0,
                "CC2": 0,
                "CC3": 0,
                "CC4": 0,
                "DMA": 0,
                "IPR": 0
            }),
            proxy: None,
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.max(0.0) as u64),
        Value::Null => Some(0),
        _ => None,
    };
    parsed.ok_or_else(|| serde::de::Error::custom(format!("expected a number, got {value}")))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => Some(0),
        _ => None,
    };
    parsed.ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_result_accepts_strings_and_numbers() {
        let parsed: RpcResponse<StreamKeyResult> = serde_json::from_str(
            r#"{"result":{"ip":"10.0.0.1","streamKey":"abc","streamServerID":42,"uSecs":"183000000"}}"#,
        )
        .unwrap();
        let result = parsed.result.unwrap();
        assert_eq!(result.stream_server_id, "42");
        assert_eq!(result.u_secs, 183_000_000);
        assert!(parsed.fault.is_none());
    }

    #[test]
    fn test_fault_code_as_string() {
        let parsed: RpcResponse<StreamKeyResult> =
            serde_json::from_str(r#"{"fault":{"code":"256","message":"invalid token"}}"#).unwrap();
        let fault = parsed.fault.unwrap();
        assert_eq!(fault.code, 256);
        assert_eq!(fault.message, "invalid token");
    }

    #[test]
    fn test_mark_downloaded_result() {
        let yes: MarkDownloadedResult = serde_json::from_str(r#"{"Return":"TRUE"}"#).unwrap();
        let no: MarkDownloadedResult = serde_json::from_str(r#"{"Return":false}"#).unwrap();
        let missing: MarkDownloadedResult = serde_json::from_str("{}").unwrap();
        assert!(yes.is_affirmative());
        assert!(!no.is_affirmative());
        assert!(!missing.is_affirmative());
    }
}
