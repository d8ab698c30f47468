//! Supabase REST (PostgREST) and Storage client

use super::BackendStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Supabase project client authenticated with the service role key
#[derive(Clone)]
pub struct SupabaseStore {
    http: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn object_url(&self, bucket: &str, filename: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, filename)
    }

    /// Public URL of an uploaded object
    pub fn public_url(&self, bucket: &str, filename: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, filename
        )
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl BackendStore for SupabaseStore {
    async fn insert(&self, table: &str, record: Value) -> Result<()> {
        let response = self
            .authed(self.http.post(self.rest_url(table)))
            .header("Prefer", "return=minimal")
            .json(&record)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Persistence(format!(
                "insert into {} failed: HTTP {}: {}",
                table, status, body
            )));
        }

        tracing::debug!(table = %table, "Row inserted");
        Ok(())
    }

    async fn query(&self, table: &str, filters: &[(&str, String)]) -> Result<Vec<Value>> {
        let mut params: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
        params.extend(
            filters
                .iter()
                .map(|(column, value)| (column.to_string(), format!("eq.{}", value))),
        );

        let response = self
            .authed(self.http.get(self.rest_url(table)))
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Persistence(format!(
                "query on {} failed: HTTP {}: {}",
                table, status, body
            )));
        }

        let rows: Vec<Value> = response.json().await?;
        Ok(rows)
    }

    async fn upload_artifact(
        &self,
        bucket: &str,
        filename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let size = data.len();
        let response = self
            .authed(self.http.post(self.object_url(bucket, filename)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Artifact(format!("upload of {} failed: {}", filename, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Artifact(format!(
                "upload of {} failed: HTTP {}: {}",
                filename, status, body
            )));
        }

        let url = self.public_url(bucket, filename);
        tracing::info!(filename = %filename, size = size, url = %url, "Artifact uploaded");
        Ok(url)
    }
}
