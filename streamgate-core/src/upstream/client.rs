//! Platform gateway HTTP client
//!
//! Production transport: bot-token-authenticated JSON calls against the
//! platform's gateway API, plus a raw byte endpoint for chunk reads.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::{ChannelHandle, ChannelMessage, MessageMedia, UpstreamError, UpstreamTransport};
use crate::models::{AccountInfo, UpstreamLocator};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Error envelope returned by the gateway on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    account: AccountInfo,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    #[serde(default)]
    media: Option<WireMedia>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireMedia {
    Document {
        object_id: i64,
        access_hash: i64,
        reference: String,
        size: i64,
        #[serde(default)]
        filename: String,
        #[serde(default)]
        mime_type: String,
    },
    Photo {
        object_id: i64,
        access_hash: i64,
        reference: String,
        thumb_size: String,
    },
}

pub struct GatewayClient {
    base_url: String,
    bot_token: String,
    client: reqwest::Client,
    account: AccountInfo,
}

impl GatewayClient {
    /// Authenticate a bot account against the gateway.
    pub async fn connect(
        base_url: &str,
        api_id: i32,
        api_hash: &str,
        bot_token: &str,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Transport(format!("build http client: {e}")))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        let response = client
            .post(format!("{base_url}/gateway/auth.signIn"))
            .json(&json!({
                "api_id": api_id,
                "api_hash": api_hash,
                "bot_token": bot_token,
            }))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let signin: SignInResponse = decode_json(response).await?;
        Ok(Self {
            base_url,
            bot_token: bot_token.to_string(),
            client,
            account: signin.account,
        })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, UpstreamError> {
        let response = self
            .client
            .post(format!("{}/gateway/{method}", self.base_url))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        decode_json(response).await
    }

    fn locator_json(locator: &UpstreamLocator) -> serde_json::Value {
        match locator {
            UpstreamLocator::Document {
                object_id,
                access_hash,
                reference,
            } => json!({
                "kind": "document",
                "object_id": object_id,
                "access_hash": access_hash,
                "reference": BASE64.encode(reference),
            }),
            UpstreamLocator::Photo {
                object_id,
                access_hash,
                reference,
                thumb_size,
            } => json!({
                "kind": "photo",
                "object_id": object_id,
                "access_hash": access_hash,
                "reference": BASE64.encode(reference),
                "thumb_size": thumb_size,
            }),
        }
    }
}

#[async_trait]
impl UpstreamTransport for GatewayClient {
    fn account(&self) -> AccountInfo {
        self.account.clone()
    }

    async fn resolve_channel(&self, channel_id: i64) -> Result<ChannelHandle, UpstreamError> {
        self.post_json("channels.resolve", json!({ "channel_id": channel_id }))
            .await
    }

    async fn get_messages(
        &self,
        channel: &ChannelHandle,
        ids: &[i64],
    ) -> Result<Vec<ChannelMessage>, UpstreamError> {
        let response: MessagesResponse = self
            .post_json(
                "channels.getMessages",
                json!({
                    "channel_id": channel.channel_id,
                    "access_hash": channel.access_hash,
                    "ids": ids,
                }),
            )
            .await?;

        response
            .messages
            .into_iter()
            .map(|message| {
                let media = message.media.map(decode_media).transpose()?;
                Ok(ChannelMessage {
                    id: message.id,
                    media,
                })
            })
            .collect()
    }

    async fn read_file(
        &self,
        locator: &UpstreamLocator,
        offset: i64,
        limit: i64,
    ) -> Result<Bytes, UpstreamError> {
        let response = self
            .client
            .post(format!("{}/gateway/upload.getFile", self.base_url))
            .bearer_auth(&self.bot_token)
            .json(&json!({
                "location": Self::locator_json(locator),
                "offset": offset,
                "limit": limit,
            }))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(decode_api_error(status, response).await);
        }
        response.bytes().await.map_err(map_reqwest_error)
    }
}

fn decode_media(media: WireMedia) -> Result<MessageMedia, UpstreamError> {
    let decode_reference = |reference: String| {
        BASE64
            .decode(reference.as_bytes())
            .map_err(|e| UpstreamError::BadResponse(format!("bad reference encoding: {e}")))
    };
    Ok(match media {
        WireMedia::Document {
            object_id,
            access_hash,
            reference,
            size,
            filename,
            mime_type,
        } => MessageMedia::Document {
            object_id,
            access_hash,
            reference: decode_reference(reference)?,
            size,
            filename,
            mime_type,
        },
        WireMedia::Photo {
            object_id,
            access_hash,
            reference,
            thumb_size,
        } => MessageMedia::Photo {
            object_id,
            access_hash,
            reference: decode_reference(reference)?,
            thumb_size,
        },
    })
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, UpstreamError> {
    let status = response.status();
    if !status.is_success() {
        return Err(decode_api_error(status, response).await);
    }
    response.json().await.map_err(map_reqwest_error)
}

/// Map a gateway error envelope onto the tagged error kinds.
async fn decode_api_error(status: StatusCode, response: reqwest::Response) -> UpstreamError {
    let body = response.bytes().await.unwrap_or_default();
    let Ok(envelope) = serde_json::from_slice::<ApiError>(&body) else {
        return UpstreamError::BadResponse(format!("status {status}, undecodable error body"));
    };

    match envelope.error.as_str() {
        "FILE_REFERENCE_EXPIRED" => UpstreamError::ReferenceExpired,
        "MESSAGE_NOT_FOUND" => UpstreamError::NotFound,
        "MESSAGE_DELETED" => UpstreamError::Deleted,
        "FLOOD_WAIT" => UpstreamError::FloodWait {
            retry_after: Duration::from_secs(envelope.retry_after.unwrap_or(1)),
        },
        other => UpstreamError::BadResponse(format!("status {status}: {other}")),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_media_decodes_document() {
        let media = WireMedia::Document {
            object_id: 5,
            access_hash: 6,
            reference: BASE64.encode([1u8, 2, 3]),
            size: 99,
            filename: "f".to_string(),
            mime_type: "text/plain".to_string(),
        };
        let decoded = decode_media(media).unwrap();
        match decoded {
            MessageMedia::Document { reference, size, .. } => {
                assert_eq!(reference, vec![1, 2, 3]);
                assert_eq!(size, 99);
            }
            MessageMedia::Photo { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_bad_reference_encoding_is_rejected() {
        let media = WireMedia::Photo {
            object_id: 5,
            access_hash: 6,
            reference: "***".to_string(),
            thumb_size: "y".to_string(),
        };
        assert!(decode_media(media).is_err());
    }

    #[test]
    fn test_locator_json_is_tagged() {
        let locator = UpstreamLocator::Document {
            object_id: 1,
            access_hash: 2,
            reference: vec![7],
        };
        let value = GatewayClient::locator_json(&locator);
        assert_eq!(value["kind"], "document");
        assert_eq!(value["reference"], BASE64.encode([7u8]));
    }
}
