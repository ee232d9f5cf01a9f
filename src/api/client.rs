use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::{Client, Proxy, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use super::models::{
    ApiConfig, MarkDownloadedParams, MarkDownloadedResult, RpcHeader, RpcRequest, RpcResponse,
    StreamKeyParams, StreamKeyResult,
};
use super::{AudioStream, ResolvedStream, StreamSource};
use crate::domain::TransferTarget;

const RESOLVE_METHOD: &str = "getStreamKeyFromSongIDEx";
const ACKNOWLEDGE_METHOD: &str = "markSongDownloadedEx";
const KEEP_ALIVE_SECS: &str = "300";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("service fault {code}: {message}")]
    Fault { code: i64, message: String },

    #[error("{url}: {status} {reason}")]
    HttpStatus {
        url: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Client for the catalog's RPC endpoint and its stream servers
#[derive(Debug, Clone)]
pub struct ApiClient {
    config: ApiConfig,
    rpc: Client,
    stream: Client,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let rpc = Client::builder().build()?;

        let mut stream_builder = Client::builder();
        if let Some(proxy) = &config.proxy {
            debug!(host = %proxy.host, port = proxy.port, "streaming through proxy");
            stream_builder =
                stream_builder.proxy(Proxy::all(format!("http://{}:{}", proxy.host, proxy.port))?);
        }
        let stream = stream_builder.build()?;

        Ok(Self {
            config,
            rpc,
            stream,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn header(&self) -> RpcHeader {
        RpcHeader {
            client: self.config.client_name.clone(),
            client_revision: self.config.client_revision.clone(),
            session: self.config.session.clone(),
        }
    }

    /// Sends one RPC call and unwraps its `result`, turning a `fault` into an error
    async fn send_request<P, T>(&self, method: &'static str, parameters: P) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let url = format!("{}?{}", self.config.endpoint, method);
        let body = RpcRequest {
            header: self.header(),
            method,
            parameters,
        };

        let response = self.rpc.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                url,
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let envelope: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{method}: JSON decode error: {e}")))?;

        if let Some(fault) = envelope.fault {
            return Err(ApiError::Fault {
                code: fault.code,
                message: fault.message,
            });
        }

        envelope.result.ok_or_else(|| {
            ApiError::InvalidResponse(format!("{method}: response has neither result nor fault"))
        })
    }
}

#[async_trait]
impl StreamSource for ApiClient {
    /// Phase 1: exchange a song id for a short-lived stream key
    #[instrument(skip(self))]
    async fn resolve_stream(&self, song_id: u64) -> Result<ResolvedStream> {
        let result: StreamKeyResult = self
            .send_request(
                RESOLVE_METHOD,
                StreamKeyParams {
                    song_id,
                    country: self.config.country.clone(),
                    mobile: false,
                    prefetch: false,
                    kind: 0,
                },
            )
            .await?;

        if result.ip.is_empty() || result.stream_key.is_empty() {
            return Err(ApiError::InvalidResponse(format!(
                "{RESOLVE_METHOD}: missing ip or streamKey"
            )));
        }

        let url = Url::parse(&format!("http://{}/stream.php", result.ip))
            .map_err(|e| ApiError::InvalidResponse(format!("bad stream host {}: {e}", result.ip)))?;

        Ok(ResolvedStream {
            target: TransferTarget {
                url: url.to_string(),
                stream_key: result.stream_key,
                stream_server_id: result.stream_server_id,
            },
            estimated_micros: result.u_secs,
        })
    }

    /// Phase 2: open the audio body. Only a 200 counts as success.
    #[instrument(skip(self, target), fields(url = %target.url))]
    async fn open_stream(&self, target: &TransferTarget) -> Result<AudioStream> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("streamKey", &target.stream_key)
            .finish();

        let response = self
            .stream
            .post(&target.url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CONNECTION, "keep-alive")
            .header("Keep-Alive", KEEP_ALIVE_SECS)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ApiError::HttpStatus {
                url: target.url.clone(),
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let content_length = response.content_length();
        let body = response.bytes_stream().map_err(ApiError::RequestError);

        Ok(AudioStream {
            content_length,
            body: Box::pin(body),
        })
    }

    /// Phase 3: tell the service the song was fully fetched
    #[instrument(skip(self, target))]
    async fn acknowledge_download(&self, song_id: u64, target: &TransferTarget) -> Result<bool> {
        let result: MarkDownloadedResult = self
            .send_request(
                ACKNOWLEDGE_METHOD,
                MarkDownloadedParams {
                    song_id,
                    stream_key: target.stream_key.clone(),
                    stream_server_id: target.stream_server_id.clone(),
                },
            )
            .await?;
        Ok(result.is_affirmative())
    }
}
