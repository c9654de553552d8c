//! Client for the SolusVM v1 admin API.
//!
//! Every call is a form-encoded POST of an `action` plus API credentials to
//! `/api/admin/command.php`; responses are JSON with a `status` field.
//! Catalog listings come back as comma-joined `id|label` CSV strings.

mod types;

pub use types::*;

use std::time::Duration;

use futures_util::future::try_join_all;
use serde_json::Value;

const DEFAULT_PORT: u16 = 5656;

/// Placeholder entry the master injects into empty CSV catalogs.
const NO_VALUE: &str = "--none--";

/// Raw response bodies attached to errors are trimmed to this length.
const MAX_BODY_LEN: usize = 1000;

/// Every virtualization type the master can manage.
pub const VIRTUALIZATION_TYPES: &[&str] = &["openvz", "xen", "xen hvm", "kvm"];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("solusvm api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("solusvm api {action}: {message}")]
    Api {
        action: String,
        status: u16,
        message: String,
        body: String,
    },

    #[error("solusvm api {action} returned an undecodable body")]
    Unparseable { action: String, body: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Request(e) => e.status().map(|s| s.as_u16()),
            Error::Unparseable { .. } => None,
        }
    }
}

/// Client for the SolusVM v1 admin API.
#[derive(Clone)]
pub struct SolusVmClient {
    api_id: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl SolusVmClient {
    pub fn new(
        hostname: &str,
        port: Option<u16>,
        api_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let port = port.unwrap_or(DEFAULT_PORT);
        Self::with_base_url(format!("https://{hostname}:{port}"), api_id, api_key)
    }

    /// Client against a non-default endpoint (tests, reverse proxies).
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            api_id: api_id.into(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            http,
        })
    }

    /// Make an admin API call and return the decoded response data.
    pub async fn call(&self, action: &str, params: &[(&str, String)]) -> Result<Value> {
        let mut form: Vec<(&str, String)> = vec![
            ("id", self.api_id.clone()),
            ("key", self.api_key.clone()),
            ("action", action.to_string()),
            ("rdtype", "json".to_string()),
        ];
        form.extend(params.iter().cloned());

        let resp = self
            .http
            .post(format!("{}/api/admin/command.php", self.base_url))
            .form(&form)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await?;

        let data: Value = match serde_json::from_str(&body) {
            Ok(data) => data,
            Err(_) => {
                return Err(Error::Unparseable {
                    action: action.into(),
                    body: trim_body(body),
                });
            }
        };

        let response_status = data["status"].as_str().unwrap_or("unknown");
        if status == 200 && response_status == "success" {
            return Ok(data);
        }

        let mut message = format!("API Response {}", ucfirst(response_status));
        if let Some(status_msg) = data["statusmsg"].as_str() {
            if !status_msg.is_empty() {
                message = format!("{message}: {status_msg}");
            }
        }

        Err(Error::Api {
            action: action.into(),
            status,
            message,
            body: trim_body(body),
        })
    }

    // ── Clients ──────────────────────────────────────────────────────

    /// Create a customer account and return its username.
    pub async fn create_client(&self, email: &str, password: &str) -> Result<String> {
        let data = self
            .call(
                "client-create",
                &[
                    ("username", email.to_string()),
                    ("email", email.to_string()),
                    ("password", password.to_string()),
                ],
            )
            .await?;

        str_field(&data, "username", "client-create")
    }

    // ── Virtual servers ──────────────────────────────────────────────

    /// Create a virtual server and return its id.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_server(
        &self,
        virtualization_type: &str,
        username: &str,
        hostname: &str,
        plan: &str,
        template: &str,
        password: &str,
        node_group: Option<&str>,
        node: Option<&str>,
    ) -> Result<String> {
        let mut params = vec![
            ("type", virtualization_type.to_string()),
            ("username", username.to_string()),
            ("hostname", hostname.to_string()),
            ("plan", plan.to_string()),
            ("template", template.to_string()),
            ("password", password.to_string()),
            ("ips", "1".to_string()),
        ];

        if let Some(node_group) = node_group {
            params.push(("nodegroup", node_group.to_string()));
        }
        if let Some(node) = node {
            params.push(("node", node.to_string()));
        }

        let data = self.call("vserver-create", &params).await?;
        str_field(&data, "vserverid", "vserver-create")
    }

    pub async fn change_plan(&self, server_id: &str, plan: &str) -> Result<()> {
        self.call(
            "vserver-change",
            &[
                ("vserverid", server_id.to_string()),
                ("plan", plan.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn rebuild(&self, server_id: &str, template: &str) -> Result<()> {
        self.call(
            "vserver-rebuild",
            &[
                ("vserverid", server_id.to_string()),
                ("template", template.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn change_root_password(&self, server_id: &str, password: &str) -> Result<()> {
        self.call(
            "vserver-rootpassword",
            &[
                ("vserverid", server_id.to_string()),
                ("rootpassword", password.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn boot(&self, server_id: &str) -> Result<()> {
        self.call("vserver-boot", &[("vserverid", server_id.to_string())])
            .await?;
        Ok(())
    }

    pub async fn reboot(&self, server_id: &str) -> Result<()> {
        self.call("vserver-reboot", &[("vserverid", server_id.to_string())])
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self, server_id: &str) -> Result<()> {
        self.call("vserver-shutdown", &[("vserverid", server_id.to_string())])
            .await?;
        Ok(())
    }

    pub async fn terminate(&self, server_id: &str) -> Result<()> {
        self.call(
            "vserver-terminate",
            &[
                ("vserverid", server_id.to_string()),
                ("deleteclient", "false".to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Fetch full server details.
    ///
    /// `vserver-infoall` and `vserver-info` each return a subset; both are
    /// requested concurrently and merged, with `vserver-info` fields winning.
    pub async fn server_info(&self, server_id: &str) -> Result<ServerInfo> {
        let info_all_params = [
            ("vserverid", server_id.to_string()),
            ("nographs", "1".to_string()),
        ];
        let info_params = [("vserverid", server_id.to_string())];
        let (mut info_all, info) = tokio::try_join!(
            self.call("vserver-infoall", &info_all_params),
            self.call("vserver-info", &info_params),
        )?;

        if let (Some(base), Some(overlay)) = (info_all.as_object_mut(), info.as_object()) {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
        }

        serde_json::from_value(info_all.clone()).map_err(|_| Error::Unparseable {
            action: "vserver-info".into(),
            body: trim_body(info_all.to_string()),
        })
    }

    // ── Catalogs ─────────────────────────────────────────────────────

    /// List templates as `(id, label)` pairs, for one virtualization type or
    /// all of them. Listings for multiple types are fetched concurrently and
    /// concatenated in type order.
    pub async fn list_templates(
        &self,
        virtualization_type: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        let types: Vec<&str> = match virtualization_type {
            Some(t) if !t.is_empty() => vec![t],
            _ => VIRTUALIZATION_TYPES.to_vec(),
        };

        let responses = try_join_all(types.iter().map(|t| {
            let params = [
                ("type", t.to_string()),
                ("listpipefriendly", "1".to_string()),
            ];
            async move { self.call("listtemplates", &params).await }
        }))
        .await?;

        let mut templates = Vec::new();
        for data in responses {
            let csv = ["templates", "templateshvm", "templateskvm"]
                .iter()
                .filter_map(|key| data[*key].as_str())
                .collect::<Vec<_>>()
                .join(",");

            templates.extend(parse_pipe_list(&csv));
        }

        Ok(templates)
    }

    /// List plans for one virtualization type.
    ///
    /// The master answers "No plans found" for valid types with no plans
    /// configured; that is an empty list, not an error.
    pub async fn list_plans(&self, virtualization_type: &str) -> Result<Vec<Plan>> {
        let data = match self
            .call("list-plans", &[("type", virtualization_type.to_string())])
            .await
        {
            Ok(data) => data,
            Err(e) => {
                if e.to_string().contains("No plans found")
                    && VIRTUALIZATION_TYPES.contains(&virtualization_type)
                {
                    return Ok(Vec::new());
                }
                return Err(e);
            }
        };

        serde_json::from_value(data["plans"].clone()).map_err(|_| Error::Unparseable {
            action: "list-plans".into(),
            body: trim_body(data.to_string()),
        })
    }

    /// List node groups as `(id, name)` pairs.
    pub async fn list_node_groups(&self) -> Result<Vec<(String, String)>> {
        let data = self.call("listnodegroups", &[]).await?;
        Ok(parse_pipe_list(data["nodegroups"].as_str().unwrap_or_default()))
    }

    // ── Console ──────────────────────────────────────────────────────

    /// Enable a serial console session lasting `hours`.
    ///
    /// An existing session with less than a quarter of the requested time
    /// left is torn down and replaced.
    pub async fn console_session(&self, server_id: &str, hours: u32) -> Result<ConsoleSession> {
        let requested_seconds = i64::from(hours) * 60 * 60;

        let mut data = self.console_access(server_id, hours, "enable").await?;

        let expires_in = data.sessionexpire.unwrap_or(0);
        if expires_in < requested_seconds / 4 {
            self.call(
                "vserver-console",
                &[
                    ("vserverid", server_id.to_string()),
                    ("access", "disable".to_string()),
                ],
            )
            .await?;

            data = self.console_access(server_id, hours, "enable").await?;
        }

        Ok(data)
    }

    async fn console_access(
        &self,
        server_id: &str,
        hours: u32,
        access: &str,
    ) -> Result<ConsoleSession> {
        let data = self
            .call(
                "vserver-console",
                &[
                    ("vserverid", server_id.to_string()),
                    ("time", hours.to_string()),
                    ("access", access.to_string()),
                ],
            )
            .await?;

        serde_json::from_value(data.clone()).map_err(|_| Error::Unparseable {
            action: "vserver-console".into(),
            body: trim_body(data.to_string()),
        })
    }
}

/// Split a comma-joined `id|label` CSV catalog into pairs, dropping the
/// `--none--` placeholder. An entry without a label reuses its id.
pub fn parse_pipe_list(csv: &str) -> Vec<(String, String)> {
    csv.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && *entry != NO_VALUE)
        .map(|entry| match entry.split_once('|') {
            Some((id, label)) => (id.to_string(), label.to_string()),
            None => (entry.to_string(), entry.to_string()),
        })
        .collect()
}

fn str_field(data: &Value, field: &str, action: &str) -> Result<String> {
    match &data[field] {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(Error::Unparseable {
            action: action.into(),
            body: trim_body(data.to_string()),
        }),
    }
}

fn ucfirst(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
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
    use mockito::Matcher;

    #[test]
    fn parse_pipe_list_drops_placeholder() {
        let csv = "175|Ubuntu 20.04,--none--,176|Debian 11,,plain-id";
        let parsed = parse_pipe_list(csv);

        assert_eq!(
            parsed,
            vec![
                ("175".to_string(), "Ubuntu 20.04".to_string()),
                ("176".to_string(), "Debian 11".to_string()),
                ("plain-id".to_string(), "plain-id".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn call_rejects_unsuccessful_status() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::UrlEncoded("action".into(), "vserver-boot".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"error","statusmsg":"Virtual server does not exist"}"#)
            .create_async()
            .await;

        let client = SolusVmClient::with_base_url(server.url(), "id", "key").unwrap();
        let err = client.boot("99").await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("API Response Error"));
        assert!(message.contains("Virtual server does not exist"));
    }

    #[tokio::test]
    async fn list_templates_merges_all_types_in_order() {
        let mut server = mockito::Server::new_async().await;

        for (virt, csv) in [
            ("openvz", "1|OpenVZ Tpl"),
            ("xen", "--none--"),
            ("xen hvm", "2|HVM Tpl"),
            ("kvm", "3|KVM Tpl"),
        ] {
            server
                .mock("POST", "/api/admin/command.php")
                .match_body(Matcher::AllOf(vec![
                    Matcher::UrlEncoded("action".into(), "listtemplates".into()),
                    Matcher::UrlEncoded("type".into(), virt.into()),
                ]))
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(format!(r#"{{"status":"success","templates":"{csv}"}}"#))
                .create_async()
                .await;
        }

        let client = SolusVmClient::with_base_url(server.url(), "id", "key").unwrap();
        let templates = client.list_templates(None).await.unwrap();

        assert_eq!(
            templates,
            vec![
                ("1".to_string(), "OpenVZ Tpl".to_string()),
                ("2".to_string(), "HVM Tpl".to_string()),
                ("3".to_string(), "KVM Tpl".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn list_plans_treats_no_plans_found_as_empty() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::UrlEncoded("action".into(), "list-plans".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"error","statusmsg":"No plans found"}"#)
            .create_async()
            .await;

        let client = SolusVmClient::with_base_url(server.url(), "id", "key").unwrap();
        let plans = client.list_plans("xen").await.unwrap();

        assert!(plans.is_empty());
    }
}
