use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::config::EngineSettings;
use crate::errors::{LauncherError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ManifestRequest {
    CoreVersion { mc_version: String },
    AssetIndex { id: String, url: String },
    LoaderProfile { mc_version: String, loader_version: String },
    ExtraDependencies,
}

impl ManifestRequest {
    pub fn describe(&self) -> String {
        match self {
            Self::CoreVersion { mc_version } => format!("version {}", mc_version),
            Self::AssetIndex { id, .. } => format!("asset index {}", id),
            Self::LoaderProfile {
                mc_version,
                loader_version,
            } => format!("fabric {} for {}", loader_version, mc_version),
            Self::ExtraDependencies => "extra dependencies".to_string(),
        }
    }
}

/// Where manifest documents come from when the local cache misses.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, request: ManifestRequest) -> Result<Value>;
}

#[derive(Deserialize)]
struct VersionList {
    versions: Vec<VersionListEntry>,
}

#[derive(Deserialize)]
struct VersionListEntry {
    id: String,
    url: String,
}

#[derive(Clone)]
pub struct HttpMetadataSource {
    client: reqwest::Client,
    version_manifest_url: String,
    fabric_meta_url: String,
    extra_dependencies_url: Option<String>,
}

impl HttpMetadataSource {
    pub fn new(settings: &EngineSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .connect_timeout(settings.http_connect_timeout)
            .build()?;
        Ok(Self {
            client,
            version_manifest_url: settings.version_manifest_url.clone(),
            fabric_meta_url: settings.fabric_meta_url.clone(),
            extra_dependencies_url: settings.extra_dependencies_url.clone(),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(LauncherError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LauncherError::Http(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }
        Ok(response.json::<Value>().await?)
    }

    async fn version_url(&self, mc_version: &str) -> Result<String> {
        let list = self.get_json(&self.version_manifest_url).await?;
        let list: VersionList = serde_json::from_value(list)
            .map_err(|err| LauncherError::ManifestParse(format!("version list: {}", err)))?;
        list.versions
            .into_iter()
            .find(|entry| entry.id == mc_version)
            .map(|entry| entry.url)
            .ok_or_else(|| LauncherError::NotFound(format!("minecraft version {}", mc_version)))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self, request: ManifestRequest) -> Result<Value> {
        tracing::debug!("fetching {}", request.describe());
        match request {
            ManifestRequest::CoreVersion { mc_version } => {
                let url = self.version_url(&mc_version).await?;
                self.get_json(&url).await
            }
            ManifestRequest::AssetIndex { url, .. } => self.get_json(&url).await,
            ManifestRequest::LoaderProfile {
                mc_version,
                loader_version,
            } => {
                let url = format!(
                    "{}/versions/loader/{}/{}/profile/json",
                    self.fabric_meta_url.trim_end_matches('/'),
                    mc_version,
                    loader_version
                );
                self.get_json(&url).await
            }
            ManifestRequest::ExtraDependencies => match self.extra_dependencies_url.as_deref() {
                Some(url) => self.get_json(url).await,
                None => Ok(Value::Object(Default::default())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_extra_dependencies_url_yields_empty_document() {
        let source = HttpMetadataSource::new(&EngineSettings::default()).expect("client");
        let document = source
            .fetch(ManifestRequest::ExtraDependencies)
            .await
            .expect("fetch");
        assert_eq!(document, serde_json::json!({}));
    }
}
