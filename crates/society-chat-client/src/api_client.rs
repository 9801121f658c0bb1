//! REST calls to the relay: history, submissions, presence.

use std::collections::BTreeMap;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use society_chat_shared::{ChatMessage, ClientRef, PresenceSnapshot, SocietyId, UserId};

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitText<'a> {
    sender: &'a UserId,
    receiver: &'a UserId,
    society_id: &'a SocietyId,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ref: Option<ClientRef>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// A file about to be uploaded.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(config.connect_timeout * 6).build()?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn health(&self) -> Result<bool, ClientError> {
        let response = self.http.get(self.url("/health")).send().await?;
        Ok(response.status().is_success())
    }

    /// Conversation between `user` and `peer`, oldest first, as `user` sees it.
    pub async fn history(
        &self,
        user: &UserId,
        peer: &UserId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<ChatMessage>, ClientError> {
        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset));
        }

        let request = self
            .http
            .get(self.url(&format!("/messages/{}/{}", user.as_str(), peer.as_str())))
            .query(&query);
        let response = Self::check(self.authorized(request).send().await?).await?;
        let messages: Vec<ChatMessage> = response.json().await?;
        debug!(peer = %peer.short(), count = messages.len(), "History fetched");
        Ok(messages)
    }

    pub async fn submit_text(
        &self,
        sender: &UserId,
        receiver: &UserId,
        society_id: &SocietyId,
        text: &str,
        client_ref: Option<ClientRef>,
    ) -> Result<ChatMessage, ClientError> {
        let body = SubmitText {
            sender,
            receiver,
            society_id,
            text,
            client_ref,
        };
        let request = self.http.post(self.url("/messages")).json(&body);
        let response = Self::check(self.authorized(request).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn submit_file(
        &self,
        sender: &UserId,
        receiver: &UserId,
        society_id: &SocietyId,
        caption: Option<&str>,
        client_ref: Option<ClientRef>,
        upload: Upload,
    ) -> Result<ChatMessage, ClientError> {
        let size = upload.bytes.len();
        let part = Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.mime_type)?;

        let mut form = Form::new()
            .text("sender", sender.as_str().to_string())
            .text("receiver", receiver.as_str().to_string())
            .text("societyId", society_id.as_str().to_string());
        if let Some(caption) = caption {
            form = form.text("text", caption.to_string());
        }
        if let Some(client_ref) = client_ref {
            form = form.text("clientRef", client_ref.to_string());
        }
        form = form.part("file", part);

        let request = self.http.post(self.url("/messages/file")).multipart(form);
        let response = Self::check(self.authorized(request).send().await?).await?;
        let message: ChatMessage = response.json().await?;
        debug!(id = %message.id, size, "File uploaded");
        Ok(message)
    }

    /// Presence table as `viewer` is allowed to see it.
    pub async fn presence(
        &self,
        viewer: &UserId,
    ) -> Result<BTreeMap<UserId, PresenceSnapshot>, ClientError> {
        let request = self
            .http
            .get(self.url("/presence"))
            .query(&[("user", viewer.as_str())]);
        let response = Self::check(self.authorized(request).send().await?).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let config = ClientConfig {
            api_url: "http://127.0.0.1:8080/".into(),
            ..ClientConfig::default()
        };
        let api = ApiClient::new(&config).unwrap();
        assert_eq!(api.url("/health"), "http://127.0.0.1:8080/health");
    }

    #[test]
    fn test_submit_body_shape() {
        let body = SubmitText {
            sender: &"u1".into(),
            receiver: &"u2".into(),
            society_id: &SocietyId::new("s1"),
            text: "hi",
            client_ref: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["societyId"], "s1");
        assert!(json.get("clientRef").is_none());
    }
}
