use log::debug;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{NoteMetadata, NoteService, Query, SearchHit};
use crate::error::QueryError;
use crate::settings::Settings;

const JSON_LOGIC_CONTENT_TYPE: &str = "application/vnd.olrapi.jsonlogic+json";
const NOTE_JSON_ACCEPT: &str = "application/vnd.olrapi.note+json";

/// HTTP client for a Local REST API style note service.
#[derive(Debug, Clone)]
pub struct RestNoteService {
    client: Client,
    base: Url,
    api_key: String,
}

impl RestNoteService {
    pub fn new(
        endpoint: &str,
        api_key: impl Into<String>,
        insecure_tls: bool,
        timeout: Duration,
    ) -> Result<Self, QueryError> {
        let mut base = Url::parse(endpoint)?;
        if base.cannot_be_a_base() {
            return Err(QueryError::Invalid(format!(
                "endpoint '{}' cannot be used as a base url",
                endpoint
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base,
            api_key: api_key.into(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, QueryError> {
        Self::new(
            &settings.endpoint,
            settings.api_key.clone(),
            settings.insecure_tls,
            settings.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn note_url(&self, path: &str) -> Result<Url, QueryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| QueryError::Invalid(format!("cannot build note url for '{}'", path)))?
            .pop_if_empty()
            .push("vault")
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        Ok(url)
    }
}

/// Turn a non-success response into `QueryError::Status`, using the
/// service's `{ "message": ... }` body when it sends one.
async fn check_status(response: Response) -> Result<Response, QueryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(QueryError::Status {
        status: status.as_u16(),
        message,
    })
}

impl NoteService for RestNoteService {
    async fn search(&self, query: &Query) -> Result<Vec<SearchHit>, QueryError> {
        let url = self.base.join("search/")?;
        let body = query.to_json_logic().to_string();
        debug!("note service: POST {} {}", url, body);

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, JSON_LOGIC_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json::<Vec<SearchHit>>()
            .await
            .map_err(|e| QueryError::Decode(e.to_string()))
    }

    async fn fetch_note(&self, path: &str) -> Result<NoteMetadata, QueryError> {
        let url = self.note_url(path)?;
        debug!("note service: GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, NOTE_JSON_ACCEPT)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json::<NoteMetadata>()
            .await
            .map_err(|e| QueryError::Decode(e.to_string()))
    }
}
