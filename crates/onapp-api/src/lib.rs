//! Client for the OnApp REST API.
//!
//! JSON over basic auth. Error bodies arrive as `{"errors": {field: [msgs]}}`
//! maps that are flattened into one `field: msg` message line; raw bodies are
//! kept, trimmed, for debugging.

mod types;

pub use types::*;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Method;
use serde_json::Value;

/// Raw response bodies attached to errors are trimmed to this length.
const MAX_BODY_LEN: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("onapp api connection error: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("onapp api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("onapp api {endpoint} returned {status}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
        body: String,
    },

    #[error("onapp api {endpoint} returned an undecodable body")]
    Unparseable { endpoint: String, body: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Client for the OnApp REST API.
#[derive(Clone)]
pub struct OnAppClient {
    credentials: String,
    base_url: String,
    http: reqwest::Client,
}

impl OnAppClient {
    pub fn new(
        hostname: &str,
        username: &str,
        password: &str,
        timeout: Option<u64>,
    ) -> Result<Self> {
        Self::with_base_url(format!("https://{hostname}"), username, password, timeout)
    }

    /// Client against a non-default endpoint (tests, reverse proxies).
    pub fn with_base_url(
        base_url: impl Into<String>,
        username: &str,
        password: &str,
        timeout: Option<u64>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout.unwrap_or(120)))
            .build()?;

        Ok(Self {
            credentials: BASE64.encode(format!("{username}:{password}")),
            base_url: base_url.into(),
            http,
        })
    }

    /// Make an API request and return the decoded body, if any.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Basic {}", self.credentials));

        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Error::Connect(e)
            } else {
                Error::Request(e)
            }
        })?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(Error::Api {
                endpoint: path.to_string(),
                status: status.as_u16(),
                message: error_message(&text, status.as_u16()),
                body: trim_body(text),
            });
        }

        if text.is_empty() {
            return Ok(None);
        }

        match serde_json::from_str(&text) {
            Ok(data) => Ok(Some(data)),
            Err(_) => Err(Error::Unparseable {
                endpoint: path.to_string(),
                body: trim_body(text),
            }),
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, &[], None)
            .await?
            .ok_or_else(|| Error::Unparseable {
                endpoint: path.to_string(),
                body: String::new(),
            })
    }

    // ── Virtual machines ─────────────────────────────────────────────

    pub async fn get_virtual_machine(&self, server_id: &str) -> Result<VirtualMachine> {
        let path = format!("/virtual_machines/{server_id}.json");
        let data = self.get(&path).await?;
        unwrap_entity(&data, "virtual_machine", &path)
    }

    pub async fn create_virtual_machine(
        &self,
        req: &CreateVirtualMachineRequest,
    ) -> Result<VirtualMachine> {
        let body = serde_json::json!({ "virtual_machine": req });
        let data = self
            .request(Method::POST, "/virtual_machines.json", &[], Some(&body))
            .await?
            .ok_or_else(|| Error::Unparseable {
                endpoint: "/virtual_machines.json".into(),
                body: String::new(),
            })?;

        unwrap_entity(&data, "virtual_machine", "/virtual_machines.json")
    }

    pub async fn reset_password(&self, server_id: &str, password: &str) -> Result<()> {
        let body = serde_json::json!({
            "virtual_machine": { "initial_root_password": password }
        });
        self.request(
            Method::POST,
            &format!("/virtual_machines/{server_id}/reset_password.json"),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    /// Update memory and CPU counts. Disk changes go through `resize_disk`.
    pub async fn update_resources(&self, server_id: &str, memory: u64, cpus: u64) -> Result<()> {
        let body = serde_json::json!({
            "virtual_machine": { "memory": memory, "cpus": cpus }
        });
        self.request(
            Method::PUT,
            &format!("/virtual_machines/{server_id}.json"),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn resize_disk(&self, server_id: &str, disk_id: u64, size_gb: u64) -> Result<()> {
        let body = serde_json::json!({ "disk": { "disk_size": size_gb } });
        self.request(
            Method::PUT,
            &format!("/virtual_machines/{server_id}/disks/{disk_id}.json"),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn list_disks(&self, server_id: &str) -> Result<Vec<Disk>> {
        let path = format!("/virtual_machines/{server_id}/disks.json");
        let data = self.get(&path).await?;
        unwrap_entity_list(&data, "disk", &path)
    }

    /// The first disk is the primary one.
    pub async fn primary_disk(&self, server_id: &str) -> Result<Disk> {
        let path = format!("/virtual_machines/{server_id}/disks.json");
        self.list_disks(server_id)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::Unparseable {
                endpoint: path,
                body: String::new(),
            })
    }

    pub async fn reboot(&self, server_id: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/virtual_machines/{server_id}/reboot.json"),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn shutdown(&self, server_id: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/virtual_machines/{server_id}/shutdown.json"),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn startup(&self, server_id: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/virtual_machines/{server_id}/startup.json"),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn destroy(&self, server_id: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("/virtual_machines/{server_id}.json"),
            &[("destroy_all_backups", "1".to_string())],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn rebuild(&self, server_id: &str, template_id: u64) -> Result<()> {
        let body = serde_json::json!({
            "virtual_machine": { "template_id": template_id, "required_startup": 1 }
        });
        self.request(
            Method::POST,
            &format!("/virtual_machines/{server_id}/build.json"),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    // ── Catalogs ─────────────────────────────────────────────────────

    pub async fn get_template(&self, template_id: u64) -> Result<Template> {
        let path = format!("/templates/{template_id}.json");
        let data = self.get(&path).await?;
        unwrap_entity(&data, "image_template", &path)
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        let data = self.get("/templates/system.json").await?;
        unwrap_entity_list(&data, "image_template", "/templates/system.json")
    }

    pub async fn get_location_group(&self, location_id: u64) -> Result<LocationGroup> {
        let path = format!("/settings/location_groups/{location_id}.json");
        let data = self.get(&path).await?;
        unwrap_entity(&data, "location_group", &path)
    }

    pub async fn list_location_groups(&self) -> Result<Vec<LocationGroup>> {
        let data = self.get("/settings/location_groups.json").await?;
        unwrap_entity_list(&data, "location_group", "/settings/location_groups.json")
    }

    /// Resolve a hypervisor's location group by walking hypervisor →
    /// hypervisor zone → location group.
    pub async fn hypervisor_location(&self, hypervisor_id: u64) -> Result<Option<LocationGroup>> {
        let data = self
            .get(&format!("/settings/hypervisors/{hypervisor_id}.json"))
            .await?;
        let Some(group_id) = data["hypervisor"]["hypervisor_group_id"].as_u64() else {
            return Ok(None);
        };

        let data = self
            .get(&format!("/settings/hypervisor_zones/{group_id}.json"))
            .await?;
        let Some(location_id) = data["hypervisor_group"]["location_group_id"].as_u64() else {
            return Ok(None);
        };

        Ok(Some(self.get_location_group(location_id).await?))
    }
}

/// Flatten `{"errors": {field: [msgs]}}` (or an `error` list) into one line.
fn error_message(body: &str, status: u16) -> String {
    let data: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    let errors = match (&data["errors"], &data["error"]) {
        (Value::Null, other) => other,
        (errors, _) => errors,
    };

    let mut messages: Vec<String> = Vec::new();
    match errors {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::Array(list) => {
                        let joined = list
                            .iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(", ");
                        messages.push(format!("{key}: {joined}"));
                    }
                    Value::String(s) => messages.push(s.clone()),
                    _ => {}
                }
            }
        }
        Value::Array(list) => {
            messages.extend(list.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        Value::String(s) => messages.push(s.clone()),
        _ => {}
    }

    let mut message = messages.join(", ");

    if message.is_empty() && status == 401 {
        message = "Unauthorized - check credentials and whitelisted IPs".to_string();
    }

    if message.contains("account has been locked") {
        message = "Configuration account error".to_string();
    }

    if message.is_empty() {
        message = "Unknown".to_string();
    }

    message
}

fn unwrap_entity<T: serde::de::DeserializeOwned>(
    data: &Value,
    key: &str,
    endpoint: &str,
) -> Result<T> {
    serde_json::from_value(data[key].clone()).map_err(|_| Error::Unparseable {
        endpoint: endpoint.to_string(),
        body: trim_body(data.to_string()),
    })
}

/// Unwrap a `[{"<key>": {...}}, ...]` list into its inner entities.
fn unwrap_entity_list<T: serde::de::DeserializeOwned>(
    data: &Value,
    key: &str,
    endpoint: &str,
) -> Result<Vec<T>> {
    let Some(list) = data.as_array() else {
        return Err(Error::Unparseable {
            endpoint: endpoint.to_string(),
            body: trim_body(data.to_string()),
        });
    };

    let mut entities = Vec::with_capacity(list.len());
    for entry in list {
        let entity = serde_json::from_value(entry[key].clone()).map_err(|_| Error::Unparseable {
            endpoint: endpoint.to_string(),
            body: trim_body(data.to_string()),
        })?;
        entities.push(entity);
    }

    Ok(entities)
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
    fn error_message_flattens_field_maps() {
        let body = r#"{"errors":{"field":["bad"],"memory":["too small","not a number"]}}"#;
        let message = error_message(body, 422);
        assert!(message.contains("field: bad"));
        assert!(message.contains("memory: too small, not a number"));
    }

    #[test]
    fn error_message_falls_back_for_unauthorized() {
        assert_eq!(
            error_message("", 401),
            "Unauthorized - check credentials and whitelisted IPs"
        );
    }

    #[test]
    fn error_message_rewrites_locked_accounts() {
        let body = r#"{"error":"This account has been locked"}"#;
        assert_eq!(error_message(body, 403), "Configuration account error");
    }

    #[tokio::test]
    async fn api_error_keeps_message_and_body() {
        let mut server = mockito::Server::new_async().await;

        let raw = r#"{"errors":{"field":["bad"]}}"#;
        let _mock = server
            .mock("GET", "/virtual_machines/abc.json")
            .with_status(500)
            .with_header("content-type", "application/json")
            .with_body(raw)
            .create_async()
            .await;

        let client =
            OnAppClient::with_base_url(server.url(), "admin", "secret", None).unwrap();
        let err = client.get_virtual_machine("abc").await.unwrap_err();

        match err {
            Error::Api { message, body, status, .. } => {
                assert_eq!(status, 500);
                assert!(message.contains("field: bad"));
                assert_eq!(body, raw);
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_disks_unwraps_entities() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("GET", "/virtual_machines/abc/disks.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"disk":{"id":5,"disk_size":20}},{"disk":{"id":6,"disk_size":1,"is_swap":true}}]"#)
            .create_async()
            .await;

        let client =
            OnAppClient::with_base_url(server.url(), "admin", "secret", None).unwrap();
        let disks = client.list_disks("abc").await.unwrap();

        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].id, 5);
        assert_eq!(disks[0].disk_size, Some(20));
    }
}
