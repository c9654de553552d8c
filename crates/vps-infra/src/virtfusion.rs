//! VirtFusion adapter.
//!
//! Sizing is by named package; images are resolved within a package's (or,
//! for reinstalls, the server's own) template groups, matching ids or the
//! composite `name version` / `name version variant` labels. Connections
//! prefer a panel SSO redirect for owned servers and fall back to VNC.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::types::{
    format_timestamp, ChangeRootPasswordParams, ConnectionResult, CreateParams, EmptyResult,
    ReinstallParams, ResizeParams, ServerIdentifier, ServerInfoResult, ServerSpecs, VncConnection,
};
use crate::{Error, ProviderName, Result, ServerProvider};
use virtfusion_api::{Template, TemplateGroup, VirtfusionClient};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct VirtfusionConfig {
    pub hostname: String,
    pub api_token: String,
    /// Hypervisor group new servers are placed into.
    pub hypervisor_group_id: i64,
    pub timeout: Option<u64>,
}

/// VirtFusion adapter. Delegates to `virtfusion_api::VirtfusionClient`.
pub struct VirtfusionProvider {
    config: VirtfusionConfig,
    client: VirtfusionClient,
}

impl VirtfusionProvider {
    pub fn new(config: VirtfusionConfig) -> Result<Self> {
        let client = VirtfusionClient::new(&config.hostname, &config.api_token, config.timeout)
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Create from env vars: `VIRTFUSION_HOSTNAME`, `VIRTFUSION_API_TOKEN`,
    /// `VIRTFUSION_HYPERVISOR_GROUP_ID` (required), `VIRTFUSION_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let require = |var: &str| {
            std::env::var(var).map_err(|_| Error::Config(format!("{var} is not set")))
        };

        Self::new(VirtfusionConfig {
            hostname: require("VIRTFUSION_HOSTNAME")?,
            api_token: require("VIRTFUSION_API_TOKEN")?,
            hypervisor_group_id: require("VIRTFUSION_HYPERVISOR_GROUP_ID")?
                .parse()
                .map_err(|_| {
                    Error::Config("VIRTFUSION_HYPERVISOR_GROUP_ID must be an integer".into())
                })?,
            timeout: std::env::var("VIRTFUSION_TIMEOUT").ok().and_then(|t| t.parse().ok()),
        })
    }

    async fn find_package_id(&self, size: &str) -> Result<i64> {
        if let Ok(package_id) = size.parse::<i64>() {
            return Ok(package_id);
        }

        let packages = self.client.list_packages().await?;

        packages
            .into_iter()
            .find(|package| package.name == size)
            .map(|package| package.id)
            .ok_or_else(|| Error::not_found("package", size))
    }

    async fn server_info(&self, server_id: &str) -> Result<ServerInfoResult> {
        let data = self.client.get_server(server_id, true).await?;

        let state = data["remoteState"]["state"]
            .as_str()
            .or_else(|| data["state"].as_str())
            .unwrap_or("unknown");

        let image = match data["settings"]["osTemplateInstallId"].as_i64() {
            Some(install_id) => {
                let groups = self.client.server_templates(server_id).await?;
                match_template(&groups, &install_id.to_string()).map(|t| t.full_name())
            }
            None => None,
        };

        let resources = &data["settings"]["resources"];

        Ok(ServerInfoResult {
            instance_id: match data["id"].as_i64() {
                Some(id) => id.to_string(),
                None => "Unknown".into(),
            },
            state: ucfirst(state),
            label: non_empty(data["name"].as_str()).unwrap_or_else(|| "Unknown".into()),
            hostname: non_empty(data["hostname"].as_str()),
            ip_address: first_enabled_ipv4(&data["network"]["interfaces"]),
            image: image.unwrap_or_else(|| "Unknown".into()),
            specs: Some(ServerSpecs {
                memory_mb: resources["memory"].as_u64().unwrap_or(0) as u32,
                cpu_cores: resources["cpuCores"].as_u64().unwrap_or(0) as u32,
                disk_mb: (resources["storage"].as_u64().unwrap_or(0) * 1024) as u32,
            }),
            location: non_empty(data["hypervisor"]["name"].as_str())
                .unwrap_or_else(|| "Unknown".into()),
            virtualization_type: non_empty(
                data["settings"]["hyperv"]["vendorIdValue"].as_str(),
            ),
            customer_identifier: data["ownerId"].as_i64().map(|id| id.to_string()),
            suspended: data["suspended"].as_bool(),
            created_at: data["created"].as_str().and_then(format_timestamp),
            updated_at: data["updated"].as_str().and_then(format_timestamp),
            ..Default::default()
        })
    }

    /// Guard shared by the power operations: a failed server is not
    /// operational.
    fn assert_operational(info: &ServerInfoResult) -> Result<()> {
        if info.state.eq_ignore_ascii_case("failed") {
            return Err(Error::denied("Virtual server is not operational"));
        }
        Ok(())
    }
}

#[async_trait]
impl ServerProvider for VirtfusionProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Virtfusion
    }

    async fn create(&self, params: &CreateParams) -> Result<ServerInfoResult> {
        params.validate()?;

        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let package_id = self.find_package_id(size).await?;

        let groups = self.client.package_templates(package_id).await?;
        let template = match_template(&groups, &params.image)
            .ok_or_else(|| Error::not_found("image", &params.image))?;

        let user_id = match params
            .customer_identifier
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok())
        {
            Some(user_id) => user_id,
            None => self.client.create_user(&params.email, &params.email).await?,
        };

        let server_id = self
            .client
            .create_server(user_id, package_id, self.config.hypervisor_group_id)
            .await?;

        let ssh_keys = self.client.user_ssh_key_ids(user_id).await?;

        self.client
            .build_server(
                server_id,
                Some(&params.label),
                &hostname_slug(&params.label),
                template.id,
                &ssh_keys,
            )
            .await?;

        info!(server_id = %server_id, "virtfusion: server created");

        Ok(self
            .server_info(&server_id.to_string())
            .await?
            .with_message("Server created successfully!"))
    }

    async fn get_info(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server info obtained"))
    }

    async fn get_connection(&self, params: &ServerIdentifier) -> Result<ConnectionResult> {
        let data = self.client.get_server(&params.instance_id, false).await?;

        let owner_is_admin = data["owner"]["admin"].as_bool().unwrap_or(false);
        let ext_relation_id = data["owner"]["extRelationId"].as_i64();

        if !owner_is_admin {
            if let (Some(ext_id), Some(server_id)) = (ext_relation_id, data["id"].as_i64()) {
                let auth = self.client.authentication_tokens(ext_id, server_id).await?;

                return Ok(ConnectionResult::Redirect {
                    url: format!(
                        "https://{}/{}",
                        self.config.hostname,
                        auth.endpoint_complete.trim_start_matches('/')
                    ),
                    message: "Login URL generated".into(),
                });
            }
        }

        let vnc = self.client.vnc(&params.instance_id).await?;

        Ok(ConnectionResult::Vnc {
            connection: VncConnection {
                host: vnc.hostname.clone().or(vnc.ip.clone()),
                port: vnc.port,
                password: vnc.password.clone(),
                ..Default::default()
            },
            message: "VNC connection enabled".into(),
        })
    }

    async fn change_root_password(
        &self,
        params: &ChangeRootPasswordParams,
    ) -> Result<ServerInfoResult> {
        // the panel generates and mails the new password itself; a
        // caller-chosen password cannot be applied
        self.client.reset_password(&params.instance_id).await?;

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Root password has been updated"))
    }

    async fn resize(&self, params: &ResizeParams) -> Result<ServerInfoResult> {
        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let package_id = self.find_package_id(size).await?;

        self.client
            .change_package(&params.instance_id, package_id)
            .await?;

        info!(server_id = %params.instance_id, package_id, "virtfusion: package changed");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server is resizing"))
    }

    async fn reinstall(&self, params: &ReinstallParams) -> Result<ServerInfoResult> {
        // resolve within the server's own template catalog
        let groups = self.client.server_templates(&params.instance_id).await?;
        let template = match_template(&groups, &params.image)
            .ok_or_else(|| Error::not_found("image", &params.image))?;

        let info = self.server_info(&params.instance_id).await?;

        let user_id = info
            .customer_identifier
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok())
            .ok_or_else(|| Error::api("Server owner not found"))?;

        let server_id: i64 = params
            .instance_id
            .parse()
            .map_err(|_| Error::not_found("server", &params.instance_id))?;

        let ssh_keys = self.client.user_ssh_key_ids(user_id).await?;

        self.client
            .build_server(
                server_id,
                info.hostname.as_deref(),
                &hostname_slug(info.hostname.as_deref().unwrap_or("server")),
                template.id,
                &ssh_keys,
            )
            .await?;

        info!(server_id = %server_id, template_id = template.id, "virtfusion: rebuilding");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server rebuilding with fresh image/template"))
    }

    async fn reboot(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;
        Self::assert_operational(&info)?;

        self.client.power(&params.instance_id, "restart").await?;

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server is rebooting"))
    }

    async fn shutdown(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;
        Self::assert_operational(&info)?;

        if info.state.eq_ignore_ascii_case("stopped") {
            return Ok(info.with_message("Server already stopped"));
        }

        self.client.power(&params.instance_id, "shutdown").await?;

        Ok(info
            .with_state("Stopping")
            .with_message("Server is shutting down"))
    }

    async fn power_on(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;
        Self::assert_operational(&info)?;

        if info.state.eq_ignore_ascii_case("running") {
            return Ok(info.with_message("Server already running"));
        }

        self.client.power(&params.instance_id, "boot").await?;

        Ok(info
            .with_state("Starting")
            .with_message("Server is booting"))
    }

    async fn suspend(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;

        if info.suspended == Some(true) {
            return Ok(info.with_message("Virtual server already suspended"));
        }

        self.client.suspend(&params.instance_id).await?;

        info!(server_id = %params.instance_id, "virtfusion: server suspended");

        Ok(info
            .with_suspended(true)
            .with_message("Server suspending"))
    }

    async fn unsuspend(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;

        if info.suspended == Some(false) {
            return Ok(info.with_message("Virtual server already unsuspended"));
        }

        self.client.unsuspend(&params.instance_id).await?;

        info!(server_id = %params.instance_id, "virtfusion: server unsuspended");

        Ok(info
            .with_suspended(false)
            .with_message("Server un-suspending"))
    }

    async fn terminate(&self, params: &ServerIdentifier) -> Result<EmptyResult> {
        // verify the server exists before attempting destruction
        self.server_info(&params.instance_id).await?;

        self.client.destroy(&params.instance_id).await?;

        info!(server_id = %params.instance_id, "virtfusion: server deleting");

        Ok(EmptyResult::with_message("Server is deleting"))
    }
}

impl From<virtfusion_api::Error> for Error {
    fn from(e: virtfusion_api::Error) -> Self {
        match e {
            virtfusion_api::Error::Connect(e) => Error::connection(e.to_string()),
            virtfusion_api::Error::Api {
                status,
                message,
                body,
                ..
            } => Error::Api {
                message: format!("Provider API error: {}", ucfirst(&message)),
                status: Some(status),
                data: serde_json::json!({ "http_code": status }),
                debug: Some(body),
            },
            virtfusion_api::Error::Request(e) => Error::Api {
                message: format!("Provider API error: {e}"),
                status: e.status().map(|s| s.as_u16()),
                data: serde_json::Value::Null,
                debug: None,
            },
            virtfusion_api::Error::Unparseable { body, .. } => {
                Error::Unparseable { debug: Some(body) }
            }
        }
    }
}

/// Match a template by id or composite label within template groups.
fn match_template<'a>(groups: &'a [TemplateGroup], image: &str) -> Option<&'a Template> {
    for group in groups {
        for template in &group.templates {
            if template.id.to_string() == image
                || template.name_version() == image
                || template.full_name() == image
            {
                return Some(template);
            }
        }
    }
    None
}

/// Slug a label into a hostname, appending `.host` when undotted.
fn hostname_slug(label: &str) -> String {
    let mut slug = String::new();
    let mut last_was_separator = true;

    for c in label.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            slug.push(c.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            slug.push('.');
            last_was_separator = true;
        }
    }

    let slug = slug.trim_matches('.').to_string();

    if slug.contains('.') {
        slug
    } else {
        format!("{slug}.host")
    }
}

/// Pick the first enabled IPv4 from the interface list, preferring enabled
/// interfaces.
fn first_enabled_ipv4(interfaces: &Value) -> Option<String> {
    let list = interfaces.as_array()?;

    let mut sorted: Vec<&Value> = list.iter().collect();
    sorted.sort_by_key(|interface| !interface["enabled"].as_bool().unwrap_or(false));

    let interface = sorted.first()?;
    let ipv4 = interface["ipv4"].as_array()?;

    let mut addresses: Vec<&Value> = ipv4.iter().collect();
    addresses.sort_by_key(|address| !address["enabled"].as_bool().unwrap_or(false));

    addresses
        .first()
        .and_then(|address| address["address"].as_str())
        .map(str::to_string)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(str::to_string)
}

fn ucfirst(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(server: &mockito::ServerGuard) -> VirtfusionProvider {
        VirtfusionProvider {
            config: VirtfusionConfig {
                hostname: "panel.test".into(),
                api_token: "token".into(),
                hypervisor_group_id: 4,
                timeout: None,
            },
            client: VirtfusionClient::with_base_url(server.url(), "token", None).unwrap(),
        }
    }

    fn groups() -> Vec<TemplateGroup> {
        vec![TemplateGroup {
            templates: vec![
                Template {
                    id: 9,
                    name: "Ubuntu".into(),
                    version: Some("20.04".into()),
                    variant: Some("LTS".into()),
                },
                Template {
                    id: 12,
                    name: "Debian".into(),
                    version: Some("12".into()),
                    variant: None,
                },
            ],
        }]
    }

    #[test]
    fn templates_match_by_id_and_composite_labels() {
        let groups = groups();

        assert_eq!(match_template(&groups, "9").map(|t| t.id), Some(9));
        assert_eq!(
            match_template(&groups, "Ubuntu 20.04").map(|t| t.id),
            Some(9)
        );
        assert_eq!(
            match_template(&groups, "Ubuntu 20.04 LTS").map(|t| t.id),
            Some(9)
        );
        assert_eq!(match_template(&groups, "Debian 12").map(|t| t.id), Some(12));
        assert!(match_template(&groups, "Fedora 40").is_none());
    }

    #[test]
    fn hostname_slugs_are_dotted() {
        assert_eq!(hostname_slug("My Web Server"), "my.web.server");
        assert_eq!(hostname_slug("web1"), "web1.host");
        assert_eq!(hostname_slug("web1.example.com"), "web1.example.com");
    }

    #[test]
    fn enabled_interfaces_win() {
        let interfaces = serde_json::json!([
            {"enabled": false, "ipv4": [{"enabled": true, "address": "10.0.0.1"}]},
            {"enabled": true, "ipv4": [
                {"enabled": false, "address": "203.0.113.4"},
                {"enabled": true, "address": "203.0.113.5"}
            ]}
        ]);

        assert_eq!(
            first_enabled_ipv4(&interfaces).as_deref(),
            Some("203.0.113.5")
        );
    }

    #[tokio::test]
    async fn get_connection_prefers_sso_redirect() {
        let mut server = mockito::Server::new_async().await;

        let _server_mock = server
            .mock("GET", "/api/v1/servers/7")
            .match_query(mockito::Matcher::UrlEncoded(
                "remoteState".into(),
                "false".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":{"id":7,"owner":{"admin":false,"extRelationId":55}}}"#,
            )
            .create_async()
            .await;

        let _tokens_mock = server
            .mock("POST", "/api/v1/users/55/serverAuthenticationTokens/7")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":{"authentication":{"endpoint_complete":"/auth/tokens/xyz"}}}"#,
            )
            .create_async()
            .await;

        let connection = provider(&server)
            .get_connection(&ServerIdentifier::new("7"))
            .await
            .unwrap();

        match connection {
            ConnectionResult::Redirect { url, .. } => {
                assert_eq!(url, "https://panel.test/auth/tokens/xyz");
            }
            other => panic!("expected Redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_info_normalizes_remote_state_and_resources() {
        let mut server = mockito::Server::new_async().await;

        let _server_mock = server
            .mock("GET", "/api/v1/servers/7")
            .match_query(mockito::Matcher::UrlEncoded(
                "remoteState".into(),
                "true".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":{"id":7,"name":"web1","hostname":"web1.host","ownerId":55,"suspended":false,
                    "remoteState":{"state":"running"},
                    "settings":{"osTemplateInstallId":9,"resources":{"memory":2048,"cpuCores":2,"storage":20},
                                "hyperv":{"vendorIdValue":"kvm"}},
                    "network":{"interfaces":[{"enabled":true,"ipv4":[{"enabled":true,"address":"203.0.113.5"}]}]},
                    "hypervisor":{"name":"hv-lon-1"},
                    "created":"2024-03-01T12:30:45Z","updated":"2024-03-02T09:00:00Z"}}"#,
            )
            .create_async()
            .await;

        let _templates_mock = server
            .mock("GET", "/api/v1/servers/7/templates")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"templates":[{"id":9,"name":"Ubuntu","version":"20.04","variant":"LTS"}]}]}"#,
            )
            .create_async()
            .await;

        let info = provider(&server)
            .get_info(&ServerIdentifier::new("7"))
            .await
            .unwrap();

        assert_eq!(info.instance_id, "7");
        assert_eq!(info.state, "Running");
        assert_eq!(info.image, "Ubuntu 20.04 LTS");
        assert_eq!(info.ip_address.as_deref(), Some("203.0.113.5"));
        assert_eq!(info.location, "hv-lon-1");
        assert_eq!(info.customer_identifier.as_deref(), Some("55"));
        assert_eq!(info.suspended, Some(false));
        assert_eq!(
            info.specs,
            Some(ServerSpecs {
                memory_mb: 2048,
                cpu_cores: 2,
                disk_mb: 20480,
            })
        );
    }

    #[tokio::test]
    async fn suspend_short_circuits_when_already_suspended() {
        let mut server = mockito::Server::new_async().await;

        let _server_mock = server
            .mock("GET", "/api/v1/servers/7")
            .match_query(mockito::Matcher::UrlEncoded(
                "remoteState".into(),
                "true".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":{"id":7,"name":"web1","suspended":true,"state":"complete",
                    "settings":{"resources":{"memory":1024,"cpuCores":1,"storage":10}},
                    "network":{"interfaces":[]}}}"#,
            )
            .create_async()
            .await;

        let suspend_mock = server
            .mock("POST", "/api/v1/servers/7/suspend")
            .expect(0)
            .create_async()
            .await;

        let info = provider(&server)
            .suspend(&ServerIdentifier::new("7"))
            .await
            .unwrap();

        assert_eq!(info.message, "Virtual server already suspended");
        assert_eq!(info.suspended, Some(true));
        suspend_mock.assert_async().await;
    }
}
