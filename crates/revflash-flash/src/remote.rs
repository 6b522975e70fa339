//! Shared HTTP plumbing for remote collaborators

use std::time::Duration;

use reqwest::{Client, StatusCode};
use revflash_core::{CollaboratorError, CollaboratorResult};
use url::Url;

use crate::config::{RemoteConfig, TimeoutsConfig};

#[derive(Debug, Clone)]
pub(crate) struct RemoteClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    api_key_header: String,
}

impl RemoteClient {
    pub(crate) fn new(remote: &RemoteConfig, timeouts: &TimeoutsConfig) -> CollaboratorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeouts.request_ms))
            .connect_timeout(Duration::from_millis(timeouts.connect_ms))
            .build()
            .map_err(|e| CollaboratorError::Unreachable(e.to_string()))?;

        // trailing slash so joins keep any path prefix such as /api/v1
        let mut base = remote.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| CollaboratorError::InvalidResponse(format!("base URL {}: {}", base, e)))?;

        Ok(Self {
            client,
            base_url,
            api_key: remote.api_key.clone(),
            api_key_header: remote.api_key_header.clone(),
        })
    }

    pub(crate) fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> CollaboratorResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| CollaboratorError::InvalidResponse(format!("URL {}: {}", path, e)))
    }

    pub(crate) fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.add_auth_header(self.client.get(url))
    }

    pub(crate) fn post(&self, url: Url) -> reqwest::RequestBuilder {
        self.add_auth_header(self.client.post(url))
    }

    pub(crate) fn patch(&self, url: Url) -> reqwest::RequestBuilder {
        self.add_auth_header(self.client.patch(url))
    }

    fn add_auth_header(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.api_key {
            request.header(&self.api_key_header, api_key)
        } else {
            request
        }
    }

    pub(crate) async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> CollaboratorResult<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| CollaboratorError::Unreachable(e.to_string()))
    }

    pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> CollaboratorResult<T> {
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
    }

    pub(crate) async fn check_status(
        response: reqwest::Response,
    ) -> CollaboratorResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| format!("HTTP {}", status));

        match status {
            StatusCode::NOT_FOUND => Err(CollaboratorError::NotFound(message)),
            _ => Err(CollaboratorError::remote(status.as_u16(), message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_keeps_base_path() {
        let client = RemoteClient::new(
            &RemoteConfig::new("http://localhost:8000/api/v1"),
            &TimeoutsConfig::default(),
        )
        .unwrap();
        assert_eq!(
            client.url("/garage/flash-jobs/").unwrap().as_str(),
            "http://localhost:8000/api/v1/garage/flash-jobs/"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = RemoteClient::new(&RemoteConfig::new("not a url"), &TimeoutsConfig::default())
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidResponse(_)));
    }
}
