//! Typed Rust client for the Linode API (v4).
//!
//! Covers the subset needed for managing instances: instances (create, get,
//! power, resize, rebuild, delete), disks, images, instance types and regions.

mod types;

pub use types::*;

use std::time::Duration;

const BASE_URL: &str = "https://api.linode.com/v4";

/// Raw response bodies attached to errors are trimmed to this length.
const MAX_BODY_LEN: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("linode api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("linode api {endpoint} returned {status}: {message}")]
    Api {
        endpoint: &'static str,
        status: u16,
        message: String,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status of the failed response, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Request(e) => e.status().map(|s| s.as_u16()),
        }
    }

    /// Whether this is a vendor 404 (id lookups fall through on these).
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Client for the Linode REST API.
#[derive(Clone)]
pub struct LinodeClient {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl LinodeClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, BASE_URL)
    }

    /// Client against a non-default endpoint (tests, API-compatible panels).
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            token: token.into(),
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status: status.as_u16(),
                message: error_message(&body),
                body: trim_body(body),
            });
        }
        Ok(resp)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
    ) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Fetch every page of a list endpoint until an empty page comes back.
    async fn get_paged<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
    ) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let resp = self
                .http
                .get(self.url(path))
                .header("Authorization", self.auth())
                .query(&[("page", page.to_string()), ("page_size", "100".into())])
                .send()
                .await?;

            let current: Page<T> = Self::check(resp, endpoint).await?.json().await?;
            if current.data.is_empty() {
                break;
            }

            let pages = current.pages;
            all.extend(current.data);

            if page >= pages {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn post<T: serde::de::DeserializeOwned, B: serde::Serialize>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let mut builder = self
            .http
            .post(self.url(path))
            .header("Authorization", self.auth());

        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;

        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    async fn post_empty<B: serde::Serialize>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: Option<&B>,
    ) -> Result<()> {
        let mut builder = self
            .http
            .post(self.url(path))
            .header("Authorization", self.auth());

        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        Self::check(resp, endpoint).await?;
        Ok(())
    }

    // ── Instances ────────────────────────────────────────────────────

    pub async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<Instance> {
        self.post("create instance", "/linode/instances", Some(req))
            .await
    }

    pub async fn get_instance(&self, instance_id: u64) -> Result<Instance> {
        self.get("get instance", &format!("/linode/instances/{instance_id}"))
            .await
    }

    pub async fn boot_instance(&self, instance_id: u64) -> Result<()> {
        self.post_empty::<()>(
            "boot instance",
            &format!("/linode/instances/{instance_id}/boot"),
            None,
        )
        .await
    }

    pub async fn reboot_instance(&self, instance_id: u64) -> Result<()> {
        self.post_empty::<()>(
            "reboot instance",
            &format!("/linode/instances/{instance_id}/reboot"),
            None,
        )
        .await
    }

    pub async fn shutdown_instance(&self, instance_id: u64) -> Result<()> {
        self.post_empty::<()>(
            "shutdown instance",
            &format!("/linode/instances/{instance_id}/shutdown"),
            None,
        )
        .await
    }

    pub async fn resize_instance(&self, instance_id: u64, type_id: &str) -> Result<()> {
        self.post_empty(
            "resize instance",
            &format!("/linode/instances/{instance_id}/resize"),
            Some(&serde_json::json!({ "type": type_id })),
        )
        .await
    }

    pub async fn rebuild_instance(&self, instance_id: u64, req: &RebuildRequest) -> Result<Instance> {
        self.post(
            "rebuild instance",
            &format!("/linode/instances/{instance_id}/rebuild"),
            Some(req),
        )
        .await
    }

    pub async fn delete_instance(&self, instance_id: u64) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/linode/instances/{instance_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "delete instance").await?;
        Ok(())
    }

    // ── Disks ────────────────────────────────────────────────────────

    pub async fn list_disks(&self, instance_id: u64) -> Result<Vec<Disk>> {
        self.get_paged("list disks", &format!("/linode/instances/{instance_id}/disks"))
            .await
    }

    pub async fn reset_disk_password(
        &self,
        instance_id: u64,
        disk_id: u64,
        password: &str,
    ) -> Result<()> {
        self.post_empty(
            "reset disk password",
            &format!("/linode/instances/{instance_id}/disks/{disk_id}/password"),
            Some(&serde_json::json!({ "password": password })),
        )
        .await
    }

    // ── Catalogs ─────────────────────────────────────────────────────

    pub async fn get_image(&self, image_id: &str) -> Result<Image> {
        self.get("get image", &format!("/images/{image_id}")).await
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        self.get_paged("list images", "/images").await
    }

    pub async fn get_type(&self, type_id: &str) -> Result<InstanceType> {
        self.get("get type", &format!("/linode/types/{type_id}"))
            .await
    }

    pub async fn list_types(&self) -> Result<Vec<InstanceType>> {
        self.get_paged("list types", "/linode/types").await
    }

    pub async fn get_region(&self, region_id: &str) -> Result<Region> {
        self.get("get region", &format!("/regions/{region_id}"))
            .await
    }
}

/// Flatten a `{"errors": [{"reason", "field"}]}` body into one message.
fn error_message(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        errors: Vec<ErrorEntry>,
    }

    #[derive(serde::Deserialize)]
    struct ErrorEntry {
        reason: String,
        field: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .iter()
            .map(|e| match &e.field {
                Some(field) => format!("{field}: {}", e.reason),
                None => e.reason.clone(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => "Unknown error".into(),
    }
}

fn trim_body(mut body: String) -> String {
    if body.len() > MAX_BODY_LEN {
        let mut end = MAX_BODY_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_flattens_fields() {
        let body = r#"{"errors":[{"reason":"Invalid value","field":"region"},{"reason":"Not found"}]}"#;
        assert_eq!(error_message(body), "region: Invalid value, Not found");
    }

    #[test]
    fn error_message_falls_back_on_garbage() {
        assert_eq!(error_message("<html>oops</html>"), "Unknown error");
    }

    #[test]
    fn trim_body_respects_char_boundaries() {
        let body = format!("{}é", "x".repeat(MAX_BODY_LEN - 1));
        let trimmed = trim_body(body);
        assert!(trimmed.len() <= MAX_BODY_LEN);
        assert!(trimmed.ends_with('x'));
    }

    #[tokio::test]
    async fn list_types_walks_every_page() {
        let mut server = mockito::Server::new_async().await;

        let _page1 = server
            .mock("GET", "/linode/types")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"id":"g6-nanode-1","label":"Nanode 1GB"}],"page":1,"pages":2,"results":2}"#,
            )
            .create_async()
            .await;

        let _page2 = server
            .mock("GET", "/linode/types")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"id":"g6-standard-2","label":"Linode 4GB"}],"page":2,"pages":2,"results":2}"#,
            )
            .create_async()
            .await;

        let client = LinodeClient::with_base_url("test-token", server.url()).unwrap();
        let types = client.list_types().await.unwrap();

        assert_eq!(types.len(), 2);
        assert_eq!(types[0].id, "g6-nanode-1");
        assert_eq!(types[1].id, "g6-standard-2");
    }

    #[tokio::test]
    async fn get_instance_not_found_is_detectable() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("GET", "/linode/instances/42")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"errors":[{"reason":"Not found"}]}"#)
            .create_async()
            .await;

        let client = LinodeClient::with_base_url("test-token", server.url()).unwrap();
        let err = client.get_instance(42).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(err.to_string().contains("Not found"));
    }
}
