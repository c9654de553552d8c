//! Typed Rust client for the VirtFusion REST API.
//!
//! Bearer auth, JSON under `/api/v1`. Covers the subset needed for managing
//! servers: create/build/destroy, power, package changes, template catalogs,
//! users, VNC and SSO login tokens.

mod types;

pub use types::*;

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

/// Raw response bodies attached to errors are trimmed to this length.
const MAX_BODY_LEN: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("virtfusion api connection error: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("virtfusion api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("virtfusion api {endpoint} returned {status}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
        body: String,
    },

    #[error("virtfusion api {endpoint} returned an undecodable body")]
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

/// Client for the VirtFusion REST API.
#[derive(Clone)]
pub struct VirtfusionClient {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

impl VirtfusionClient {
    pub fn new(hostname: &str, token: impl Into<String>, timeout: Option<u64>) -> Result<Self> {
        Self::with_base_url(format!("https://{hostname}"), token, timeout)
    }

    /// Client against a non-default endpoint (tests, reverse proxies).
    pub fn with_base_url(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Option<u64>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout.unwrap_or(120)))
            .build()?;

        Ok(Self {
            token: token.into(),
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
        let path = format!("/api/v1/{}", path.trim_start_matches('/'));

        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {}", self.token));

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
                endpoint: path.clone(),
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
                endpoint: path,
                body: trim_body(text),
            }),
        }
    }

    async fn get_data(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let data = self
            .request(Method::GET, path, query, None)
            .await?
            .ok_or_else(|| Error::Unparseable {
                endpoint: path.to_string(),
                body: String::new(),
            })?;
        Ok(data["data"].clone())
    }

    // ── Servers ──────────────────────────────────────────────────────

    /// Fetch a server record, optionally including the hypervisor-reported
    /// remote state.
    pub async fn get_server(&self, server_id: &str, with_remote_state: bool) -> Result<Value> {
        self.get_data(
            &format!("/servers/{server_id}"),
            &[(
                "remoteState",
                if with_remote_state { "true" } else { "false" }.to_string(),
            )],
        )
        .await
    }

    /// Register a new server and return its id. The server still needs a
    /// `build_server` call before it is usable.
    pub async fn create_server(
        &self,
        user_id: i64,
        package_id: i64,
        hypervisor_group_id: i64,
    ) -> Result<i64> {
        let body = serde_json::json!({
            "userId": user_id,
            "packageId": package_id,
            "ipv4": 1,
            "hypervisorId": hypervisor_group_id,
        });

        let data = self
            .request(Method::POST, "/servers", &[], Some(&body))
            .await?
            .unwrap_or(Value::Null);

        data["data"]["id"].as_i64().ok_or_else(|| Error::Unparseable {
            endpoint: "/servers".into(),
            body: trim_body(data.to_string()),
        })
    }

    /// Install an OS onto a freshly created server.
    pub async fn build_server(
        &self,
        server_id: i64,
        name: Option<&str>,
        hostname: &str,
        os_id: i64,
        ssh_keys: &[i64],
    ) -> Result<()> {
        let body = serde_json::json!({
            "name": name,
            "hostname": hostname,
            "operatingSystemId": os_id,
            "sshKeys": ssh_keys,
        });

        self.request(
            Method::POST,
            &format!("/servers/{server_id}/build"),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    /// Reset the root password; the panel mails the new one to the owner.
    pub async fn reset_password(&self, server_id: &str) -> Result<()> {
        let body = serde_json::json!({ "user": "root", "sendMail": true });
        self.request(
            Method::POST,
            &format!("/servers/{server_id}/resetPassword"),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn suspend(&self, server_id: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/servers/{server_id}/suspend"),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn unsuspend(&self, server_id: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/servers/{server_id}/unsuspend"),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    /// Run a power action: `boot`, `shutdown` or `restart`.
    pub async fn power(&self, server_id: &str, action: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/servers/{server_id}/power/{action}"),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn destroy(&self, server_id: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("/servers/{server_id}"),
            &[("delay", "0".to_string())],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn change_package(&self, server_id: &str, package_id: i64) -> Result<Value> {
        let data = self
            .request(
                Method::PUT,
                &format!("/servers/{server_id}/package/{package_id}"),
                &[],
                None,
            )
            .await?;
        Ok(data.unwrap_or(Value::Null))
    }

    /// Enable VNC access and return the connection details.
    pub async fn vnc(&self, server_id: &str) -> Result<VncDetails> {
        let body = serde_json::json!({ "action": "enable" });
        let data = self
            .request(
                Method::POST,
                &format!("/servers/{server_id}/vnc"),
                &[],
                Some(&body),
            )
            .await?
            .unwrap_or(Value::Null);

        serde_json::from_value(data["data"]["vnc"].clone()).map_err(|_| Error::Unparseable {
            endpoint: format!("/servers/{server_id}/vnc"),
            body: trim_body(data.to_string()),
        })
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Create a panel user and return its id.
    pub async fn create_user(&self, name: &str, email: &str) -> Result<i64> {
        let body = serde_json::json!({
            "name": name,
            "email": email,
            "sendMail": true,
        });

        let data = self
            .request(Method::POST, "/users", &[], Some(&body))
            .await?
            .unwrap_or(Value::Null);

        data["data"]["id"].as_i64().ok_or_else(|| Error::Unparseable {
            endpoint: "/users".into(),
            body: trim_body(data.to_string()),
        })
    }

    /// Enabled SSH key ids registered for a user.
    pub async fn user_ssh_key_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        let data = self.get_data(&format!("/ssh_keys/user/{user_id}"), &[]).await?;

        let keys: Vec<SshKey> = serde_json::from_value(data.clone()).unwrap_or_default();
        Ok(keys.into_iter().filter(|k| k.enabled).map(|k| k.id).collect())
    }

    /// Generate SSO login tokens for a user/server pair.
    pub async fn authentication_tokens(
        &self,
        ext_user_id: i64,
        server_id: i64,
    ) -> Result<AuthenticationTokens> {
        let path = format!("/users/{ext_user_id}/serverAuthenticationTokens/{server_id}");
        let data = self
            .request(Method::POST, &path, &[], None)
            .await?
            .unwrap_or(Value::Null);

        serde_json::from_value(data["data"]["authentication"].clone()).map_err(|_| {
            Error::Unparseable {
                endpoint: path,
                body: trim_body(data.to_string()),
            }
        })
    }

    // ── Catalogs ─────────────────────────────────────────────────────

    pub async fn list_packages(&self) -> Result<Vec<Package>> {
        let data = self.get_data("/packages", &[]).await?;
        serde_json::from_value(data.clone()).map_err(|_| Error::Unparseable {
            endpoint: "/packages".into(),
            body: trim_body(data.to_string()),
        })
    }

    /// Template groups available to a package.
    pub async fn package_templates(&self, package_id: i64) -> Result<Vec<TemplateGroup>> {
        let path = format!("/media/templates/fromServerPackageSpec/{package_id}");
        let data = self.get_data(&path, &[]).await?;
        serde_json::from_value(data.clone()).map_err(|_| Error::Unparseable {
            endpoint: path,
            body: trim_body(data.to_string()),
        })
    }

    /// Template groups available to an existing server.
    pub async fn server_templates(&self, server_id: &str) -> Result<Vec<TemplateGroup>> {
        let path = format!("/servers/{server_id}/templates");
        let data = self.get_data(&path, &[]).await?;
        serde_json::from_value(data.clone()).map_err(|_| Error::Unparseable {
            endpoint: path,
            body: trim_body(data.to_string()),
        })
    }
}

/// Pull the most specific message out of an error body: the first entry of
/// `errors`, then `msg`, then `message`.
fn error_message(body: &str, status: u16) -> String {
    let data: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    let from_errors = match &data["errors"] {
        Value::Array(list) => list.first().and_then(|v| v.as_str()).map(String::from),
        Value::Object(map) => map.values().next().and_then(|v| match v {
            Value::Array(list) => list.first().and_then(|e| e.as_str()).map(String::from),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }),
        Value::String(s) => Some(s.clone()),
        _ => None,
    };

    from_errors
        .or_else(|| data["msg"].as_str().map(String::from))
        .or_else(|| data["message"].as_str().map(String::from))
        .unwrap_or_else(|| format!("HTTP {status}"))
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
    fn template_composite_names() {
        let template = Template {
            id: 9,
            name: "Ubuntu".into(),
            version: Some("20.04".into()),
            variant: Some("LTS".into()),
        };

        assert_eq!(template.name_version(), "Ubuntu 20.04");
        assert_eq!(template.full_name(), "Ubuntu 20.04 LTS");
    }

    #[test]
    fn error_message_prefers_errors_then_msg() {
        let body = r#"{"errors":{"hostname":["The hostname field is required."]}}"#;
        assert_eq!(error_message(body, 422), "The hostname field is required.");

        let body = r#"{"msg":"Server is currently locked"}"#;
        assert_eq!(error_message(body, 409), "Server is currently locked");

        assert_eq!(error_message("", 500), "HTTP 500");
    }

    #[tokio::test]
    async fn get_server_unwraps_data() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("GET", "/api/v1/servers/7")
            .match_query(mockito::Matcher::UrlEncoded(
                "remoteState".into(),
                "true".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"id":7,"name":"web1","state":"complete"}}"#)
            .create_async()
            .await;

        let client = VirtfusionClient::with_base_url(server.url(), "token", None).unwrap();
        let data = client.get_server("7", true).await.unwrap();

        assert_eq!(data["id"], 7);
        assert_eq!(data["name"], "web1");
    }

    #[tokio::test]
    async fn list_packages_parses_catalog() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("GET", "/api/v1/packages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"id":1,"name":"2gb"},{"id":2,"name":"4gb"}]}"#)
            .create_async()
            .await;

        let client = VirtfusionClient::with_base_url(server.url(), "token", None).unwrap();
        let packages = client.list_packages().await.unwrap();

        assert_eq!(packages.len(), 2);
        assert_eq!(packages[1].name, "4gb");
    }
}
