//! REST store driver.
//!
//! Queries go to `GET {instance}/services/data/v{api}/query?q=...`; further
//! pages are fetched from the `nextRecordsUrl` the previous page returned.
//! Field lists come from `GET .../sobjects/{type}/describe`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;

use crate::config::OrgConfig;
use crate::core::{MetadataDescriber, QueryPage, Record, RecordStore};
use crate::error::{MigrateError, Result};
use crate::query::split_query;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    fields: Vec<DescribeField>,
}

#[derive(Debug, Deserialize)]
struct DescribeField {
    name: String,
}

/// Store backed by an organization's REST API.
pub struct RestStore {
    http: Client,
    alias: String,
    instance_url: String,
    api_base: String,
    access_token: String,
}

impl RestStore {
    /// Create a store for `org`, authenticating with `access_token`.
    pub fn new(org: &OrgConfig, access_token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            alias: org.alias.clone(),
            instance_url: org.instance_url.trim_end_matches('/').to_string(),
            api_base: org.api_base(),
            access_token: access_token.into(),
        })
    }

    /// Create a store using the token resolved from the org configuration.
    pub fn from_config(org: &OrgConfig) -> Result<Self> {
        let token = org.resolve_access_token()?;
        Self::new(org, token)
    }

    async fn get(&self, url: &str, query: &[(&str, &str)], object: &str) -> Result<Response> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read response: {}", e));
            return Err(MigrateError::store(
                object,
                format!("{} returned {}: {}", self.alias, status, text),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn query_page(&self, query: &str, cursor: Option<&str>) -> Result<QueryPage> {
        let object = split_query(query)
            .map(|p| p.object_type)
            .unwrap_or_else(|_| self.alias.clone());

        let response = match cursor {
            None => {
                debug!("{}: {}", self.alias, query);
                let url = format!("{}/query", self.api_base);
                self.get(&url, &[("q", query)], &object).await?
            }
            Some(next) => {
                let url = format!("{}{}", self.instance_url, next);
                self.get(&url, &[], &object).await?
            }
        };

        let body: QueryResponse = response.json().await?;
        Ok(QueryPage {
            records: body.records,
            total_size: body.total_size,
            next_cursor: body.next_records_url,
        })
    }

    fn store_name(&self) -> &str {
        &self.alias
    }
}

#[async_trait]
impl MetadataDescriber for RestStore {
    async fn describe_fields(&self, object_type: &str) -> Result<Vec<String>> {
        let url = format!("{}/sobjects/{}/describe", self.api_base, object_type);
        let response = self.get(&url, &[], object_type).await?;
        let body: DescribeResponse = response.json().await?;
        Ok(body.fields.into_iter().map(|f| f.name).collect())
    }
}
