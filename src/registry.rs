//! Registry tag listing (the version source).
//!
//! Lists published tags for a service's repository over the Docker Hub v2
//! API, filters them down to the service's naming convention, and parses them
//! into semantic versions. Tags that fail the version grammar are skipped and
//! logged, never fatal to the listing. Transport failures are retried with
//! exponential backoff before `RegistryUnavailable` surfaces.

use std::collections::BTreeSet;

use anyhow::Result;
use semver::Version;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{RegistryConfig, ServiceConfig};
use crate::error::CuoError;
use crate::version::parse_tag;

/// One page of tags from a registry listing.
#[derive(Debug, Clone)]
pub struct TagPage {
    pub tags: Vec<String>,
    pub has_next: bool,
}

/// Raw tag pagination, implemented by the registry transport.
pub trait TagSource {
    fn fetch_page(
        &self,
        repository: &str,
        page: u32,
    ) -> impl Future<Output = Result<TagPage>> + Send;
}

/// Docker Hub v2 repository tags endpoint.
pub struct DockerHub {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl DockerHub {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: 50,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    results: Vec<TagItem>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagItem {
    name: String,
}

impl TagSource for DockerHub {
    async fn fetch_page(&self, repository: &str, page: u32) -> Result<TagPage> {
        let url = format!(
            "{}/repositories/{}/tags?page_size={}&page={}",
            self.base_url, repository, self.page_size, page
        );

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body: TagsResponse = response.json().await?;

        Ok(TagPage {
            tags: body.results.into_iter().map(|t| t.name).collect(),
            has_next: body.next.is_some(),
        })
    }
}

/// Version listing over a [`TagSource`] with retry and tag filtering.
pub struct VersionSource<S> {
    source: S,
    config: RegistryConfig,
}

impl<S: TagSource> VersionSource<S> {
    pub const fn new(source: S, config: RegistryConfig) -> Self {
        Self { source, config }
    }

    /// List the published versions for a service, deduplicated and sorted
    /// ascending.
    pub async fn list_versions(&self, service: &ServiceConfig) -> Result<Vec<Version>, CuoError> {
        let mut versions = BTreeSet::new();
        let mut skipped = 0usize;

        for page in 1..=self.config.max_pages {
            let tag_page = self.fetch_with_retry(&service.repository, page).await?;

            for tag in &tag_page.tags {
                if !matches_convention(tag, service) {
                    continue;
                }
                match parse_tag(tag, service.flavor.as_deref()) {
                    Ok(version) => {
                        versions.insert(version);
                    }
                    Err(_) => {
                        debug!(tag, repository = %service.repository, "Skipping unparsable tag");
                        skipped += 1;
                    }
                }
            }

            if !tag_page.has_next {
                break;
            }
        }

        info!(
            repository = %service.repository,
            versions = versions.len(),
            skipped,
            "Registry listing complete"
        );

        Ok(versions.into_iter().collect())
    }

    async fn fetch_with_retry(&self, repository: &str, page: u32) -> Result<TagPage, CuoError> {
        let attempts = self.config.attempts.max(1);
        let mut backoff = self.config.initial_backoff();

        for attempt in 1..=attempts {
            match self.source.fetch_page(repository, page).await {
                Ok(tag_page) => return Ok(tag_page),
                Err(e) if attempt < attempts => {
                    warn!(
                        repository,
                        page,
                        attempt,
                        error = %e,
                        "Registry request failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(CuoError::RegistryUnavailable {
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }

        unreachable!("retry loop returns on the final attempt")
    }
}

/// Whether a tag belongs to the service's supported naming convention.
fn matches_convention(tag: &str, service: &ServiceConfig) -> bool {
    if service
        .excluded_tags
        .iter()
        .any(|sub| tag.contains(sub.as_str()))
    {
        return false;
    }
    match &service.flavor {
        Some(flavor) => tag.ends_with(&format!("-{flavor}")),
        None => true,
    }
}
