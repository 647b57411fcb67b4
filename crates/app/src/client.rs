use crate::api::{
    AskRequest, AskResponse, ErrorBody, HealthResponse, ModelsResponse, StatusResponse,
    UploadResponse,
};
use docchat_core::{UploadedFile, VectorStoreStats};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid API url: {0}")]
    Url(#[from] url::ParseError),

    #[error("could not reach the API: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status} {error_type}): {message}")]
    Api {
        status: u16,
        error_type: String,
        message: String,
    },
}

/// Thin client for the docchat REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let normalized = format!("{}/", base_url.trim().trim_end_matches('/'));
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(&normalized)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let response = self.http.get(self.endpoint("health")?).send().await?;
        decode(response).await
    }

    pub async fn upload(&self, files: &[UploadedFile]) -> Result<UploadResponse, ClientError> {
        let mut form = Form::new();
        for file in files {
            let part = Part::bytes(file.bytes.clone())
                .file_name(file.name.clone())
                .mime_str("application/pdf")?;
            form = form.part("files", part);
        }

        debug!(files = files.len(), "uploading documents");
        let response = self
            .http
            .post(self.endpoint("upload")?)
            .multipart(form)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn ask(&self, request: &AskRequest) -> Result<AskResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("ask")?)
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn stats(&self) -> Result<VectorStoreStats, ClientError> {
        let response = self.http.get(self.endpoint("stats")?).send().await?;
        decode(response).await
    }

    pub async fn reset(&self) -> Result<StatusResponse, ClientError> {
        let response = self.http.delete(self.endpoint("reset")?).send().await?;
        decode(response).await
    }

    pub async fn models(&self) -> Result<ModelsResponse, ClientError> {
        let response = self.http.get(self.endpoint("models")?).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let (error_type, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.error_type, body.message),
        Err(_) => ("unknown".to_string(), text),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        error_type,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_under_the_base_path() {
        let client = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(
            client.endpoint("ask").unwrap().as_str(),
            "http://localhost:8000/ask"
        );

        let nested = ApiClient::new("http://example.com/docchat").unwrap();
        assert_eq!(
            nested.endpoint("stats").unwrap().as_str(),
            "http://example.com/docchat/stats"
        );
    }

    #[test]
    fn invalid_base_url_is_reported() {
        assert!(matches!(
            ApiClient::new("not a url"),
            Err(ClientError::Url(_))
        ));
    }
}
