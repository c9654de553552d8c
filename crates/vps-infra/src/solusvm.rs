//! SolusVM v1 adapter.
//!
//! Catalogs (templates, plans, node groups) arrive as CSV or per-type lists
//! and are memoized per operation call, so one operation resolving several
//! identifiers fetches each catalog at most once.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::types::{
    generate_password, ChangeRootPasswordParams, ConnectionResult, CreateParams, EmptyResult,
    ReinstallParams, ResizeParams, ServerIdentifier, ServerInfoResult, TIMESTAMP_FORMAT,
};
use crate::{Error, ProviderName, Result, ServerProvider};
use solusvm_api::{Plan, ServerInfo, SolusVmClient};

/// What the `location` create param refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolusVmLocationType {
    Node,
    NodeGroup,
}

impl FromStr for SolusVmLocationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" => Ok(Self::Node),
            "node_group" => Ok(Self::NodeGroup),
            other => Err(Error::Config(format!("unknown location type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SolusVmConfig {
    pub hostname: String,
    pub port: Option<u16>,
    pub api_id: String,
    pub api_key: String,
    pub location_type: SolusVmLocationType,
    pub default_virtualization_type: Option<String>,
    #[serde(default)]
    pub single_server_owner: bool,
    pub server_owner_username: Option<String>,
}

/// SolusVM v1 adapter. Delegates to `solusvm_api::SolusVmClient`.
pub struct SolusVmProvider {
    config: SolusVmConfig,
    client: SolusVmClient,
}

/// Request-scoped catalog memo; never shared across operation calls.
#[derive(Default)]
struct Catalogs {
    /// virtualization type ("" = all) → template id → label
    templates: HashMap<String, HashMap<String, String>>,
    /// virtualization type → plans
    plans: HashMap<String, Vec<Plan>>,
    node_groups: Option<Vec<(String, String)>>,
}

impl SolusVmProvider {
    pub fn new(config: SolusVmConfig) -> Result<Self> {
        let client = SolusVmClient::new(
            &config.hostname,
            config.port,
            config.api_id.clone(),
            config.api_key.clone(),
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Create from env vars: `SOLUSVM_HOSTNAME`, `SOLUSVM_API_ID`,
    /// `SOLUSVM_API_KEY` (required), `SOLUSVM_PORT`,
    /// `SOLUSVM_LOCATION_TYPE` (default `node`),
    /// `SOLUSVM_VIRTUALIZATION_TYPE`, `SOLUSVM_SINGLE_SERVER_OWNER`,
    /// `SOLUSVM_SERVER_OWNER_USERNAME`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let require = |var: &str| {
            std::env::var(var).map_err(|_| Error::Config(format!("{var} is not set")))
        };

        let config = SolusVmConfig {
            hostname: require("SOLUSVM_HOSTNAME")?,
            port: std::env::var("SOLUSVM_PORT").ok().and_then(|p| p.parse().ok()),
            api_id: require("SOLUSVM_API_ID")?,
            api_key: require("SOLUSVM_API_KEY")?,
            location_type: std::env::var("SOLUSVM_LOCATION_TYPE")
                .unwrap_or_else(|_| "node".into())
                .parse()?,
            default_virtualization_type: std::env::var("SOLUSVM_VIRTUALIZATION_TYPE").ok(),
            single_server_owner: std::env::var("SOLUSVM_SINGLE_SERVER_OWNER")
                .map(|v| v == "1" || v == "true")
                .unwrap_or(false),
            server_owner_username: std::env::var("SOLUSVM_SERVER_OWNER_USERNAME").ok(),
        };

        Self::new(config)
    }

    async fn templates<'a>(
        &self,
        cache: &'a mut Catalogs,
        virtualization_type: Option<&str>,
    ) -> Result<&'a HashMap<String, String>> {
        let key = virtualization_type.unwrap_or_default().to_string();

        if !cache.templates.contains_key(&key) {
            let list = self.client.list_templates(virtualization_type).await?;
            cache.templates.insert(key.clone(), list.into_iter().collect());
        }

        Ok(&cache.templates[&key])
    }

    async fn plans<'a>(
        &self,
        cache: &'a mut Catalogs,
        virtualization_type: &str,
    ) -> Result<&'a [Plan]> {
        if !cache.plans.contains_key(virtualization_type) {
            let plans = self.client.list_plans(virtualization_type).await?;
            cache.plans.insert(virtualization_type.to_string(), plans);
        }

        Ok(&cache.plans[virtualization_type])
    }

    /// Resolve a template id from an id or an exact label.
    async fn find_template_id(
        &self,
        cache: &mut Catalogs,
        virtualization_type: Option<&str>,
        template: &str,
    ) -> Result<String> {
        let templates = self.templates(cache, virtualization_type).await?;

        if templates.contains_key(template) {
            return Ok(template.to_string());
        }

        templates
            .iter()
            .find(|(_, label)| label.as_str() == template)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| Error::not_found("template", template))
    }

    /// Resolve a template label from an id or an exact label.
    async fn find_template_label(
        &self,
        cache: &mut Catalogs,
        virtualization_type: Option<&str>,
        template: &str,
    ) -> Option<String> {
        let templates = self.templates(cache, virtualization_type).await.ok()?;

        if let Some(label) = templates.get(template) {
            return Some(label.clone());
        }

        templates
            .values()
            .find(|label| label.as_str() == template)
            .cloned()
    }

    /// Find a plan by id first, then by exact name.
    async fn find_plan(
        &self,
        cache: &mut Catalogs,
        virtualization_type: &str,
        plan: &str,
    ) -> Result<Plan> {
        let plans = self.plans(cache, virtualization_type).await?;

        // match by id first, then by name
        let matchers: [fn(&Plan, &str) -> bool; 2] = [
            |p, wanted| p.id.as_deref() == Some(wanted),
            |p, wanted| p.name == wanted,
        ];

        for matches in matchers {
            if let Some(found) = plans.iter().find(|p| matches(p, plan)) {
                return Ok(found.clone());
            }
        }

        Err(Error::not_found("plan", plan))
    }

    /// Reverse-map a server's reported resources onto a plan name.
    async fn find_plan_by_specs(
        &self,
        cache: &mut Catalogs,
        virtualization_type: &str,
        info: &ServerInfo,
    ) -> Option<Plan> {
        let plans = self.plans(cache, virtualization_type).await.ok()?;

        plans
            .iter()
            .find(|plan| {
                plan.cpus == info.cpus && plan.ram == info.memory && plan.disk == info.hdd
            })
            .cloned()
    }

    async fn find_node_group_id(&self, cache: &mut Catalogs, group: &str) -> Result<String> {
        if cache.node_groups.is_none() {
            cache.node_groups = Some(self.client.list_node_groups().await?);
        }

        let groups = cache.node_groups.as_deref().unwrap_or_default();

        if let Some((id, _)) = groups.iter().find(|(id, _)| id == group) {
            return Ok(id.clone());
        }

        groups
            .iter()
            .find(|(_, name)| name == group)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| Error::not_found("node group", group))
    }

    async fn server_info(
        &self,
        cache: &mut Catalogs,
        server_id: &str,
    ) -> Result<ServerInfoResult> {
        let info = self.client.server_info(server_id).await?;
        let virtualization_type = info.virtualization_type.clone();

        let image = match &info.template {
            Some(template) => self
                .find_template_label(cache, virtualization_type.as_deref(), template)
                .await
                .unwrap_or_else(|| template.clone()),
            None => "Unknown".to_string(),
        };

        let size = match &virtualization_type {
            Some(virt) => self
                .find_plan_by_specs(cache, virt, &info)
                .await
                .map(|plan| plan.name),
            None => None,
        };

        Ok(ServerInfoResult {
            instance_id: info.vserverid.clone(),
            state: info.state.clone().unwrap_or_else(|| "unknown".into()),
            label: info.hostname.clone().unwrap_or_else(|| "Unknown".into()),
            hostname: info.hostname.clone(),
            ip_address: info.ipaddress.clone(),
            image,
            size: Some(size.unwrap_or_else(|| "Custom".into())),
            location: info.node.clone().unwrap_or_else(|| "Unknown".into()),
            node: info.node.clone(),
            virtualization_type,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ServerProvider for SolusVmProvider {
    fn name(&self) -> ProviderName {
        ProviderName::SolusVm
    }

    async fn create(&self, params: &CreateParams) -> Result<ServerInfoResult> {
        params.validate()?;

        let virtualization_type = params
            .virtualization_type
            .clone()
            .or_else(|| self.config.default_virtualization_type.clone())
            .ok_or_else(|| Error::denied("virtualization type is required"))?;

        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let mut cache = Catalogs::default();

        let template_id = self
            .find_template_id(&mut cache, Some(&virtualization_type), &params.image)
            .await?;
        let plan = self.find_plan(&mut cache, &virtualization_type, size).await?;

        let password = params
            .root_password
            .clone()
            .unwrap_or_else(|| generate_password(15));

        let mut node_group = None;
        let mut node = None;
        match self.config.location_type {
            SolusVmLocationType::NodeGroup => {
                node_group = Some(self.find_node_group_id(&mut cache, &params.location).await?);
            }
            SolusVmLocationType::Node => node = Some(params.location.clone()),
        }

        let username = if self.config.single_server_owner {
            self.config
                .server_owner_username
                .clone()
                .ok_or_else(|| Error::Config("server owner username is not set".into()))?
        } else {
            match &params.customer_identifier {
                Some(id) => id.clone(),
                None => {
                    self.client
                        .create_client(&params.email, &generate_password(15))
                        .await?
                }
            }
        };

        let server_id = self
            .client
            .create_server(
                &virtualization_type,
                &username,
                &params.label,
                &plan.name,
                &template_id,
                &password,
                node_group.as_deref(),
                node.as_deref(),
            )
            .await?;

        info!(server_id = %server_id, "solusvm: server created");

        Ok(self
            .server_info(&mut cache, &server_id)
            .await?
            .with_customer_identifier(username)
            .with_state("creating")
            .with_message("Server created"))
    }

    async fn get_info(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let mut cache = Catalogs::default();
        Ok(self
            .server_info(&mut cache, &params.instance_id)
            .await?
            .with_message("Server info obtained"))
    }

    async fn get_connection(&self, params: &ServerIdentifier) -> Result<ConnectionResult> {
        let session = self.client.console_session(&params.instance_id, 1).await?;

        let (Some(user), Some(ip), Some(port)) = (
            session.consoleusername.as_deref(),
            session.consoleip.as_deref(),
            session.consoleport.as_deref(),
        ) else {
            return Err(Error::api("Console session details missing"));
        };

        let expires_at = session.sessionexpire.map(|seconds| {
            (Utc::now() + chrono::Duration::seconds(seconds))
                .format(TIMESTAMP_FORMAT)
                .to_string()
        });

        Ok(ConnectionResult::Ssh {
            command: format!("ssh {user}@{ip} -p {port}"),
            password: session.consolepassword.clone(),
            expires_at,
            message: format!(
                "Serial console session {}",
                if session.created.as_deref() == Some("success") {
                    "started"
                } else {
                    "ongoing"
                }
            ),
        })
    }

    async fn change_root_password(
        &self,
        params: &ChangeRootPasswordParams,
    ) -> Result<ServerInfoResult> {
        self.client
            .change_root_password(&params.instance_id, &params.root_password)
            .await?;

        let mut cache = Catalogs::default();
        Ok(self
            .server_info(&mut cache, &params.instance_id)
            .await?
            .with_message("Root password changed"))
    }

    async fn resize(&self, params: &ResizeParams) -> Result<ServerInfoResult> {
        let mut cache = Catalogs::default();
        let info = self.server_info(&mut cache, &params.instance_id).await?;

        if !params.resize_running && info.state == "online" {
            return Err(Error::denied(
                "Resize not available while server is running",
            ));
        }

        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let virtualization_type = info
            .virtualization_type
            .clone()
            .unwrap_or_else(|| "kvm".into());
        let plan = self.find_plan(&mut cache, &virtualization_type, size).await?;

        self.client
            .change_plan(&params.instance_id, &plan.name)
            .await?;

        info!(server_id = %params.instance_id, plan = %plan.name, "solusvm: plan changed");

        Ok(info.with_size(plan.name).with_message("Server plan changed"))
    }

    async fn reinstall(&self, params: &ReinstallParams) -> Result<ServerInfoResult> {
        let mut cache = Catalogs::default();
        let info = self.server_info(&mut cache, &params.instance_id).await?;

        // templates are partitioned by virtualization type; resolve within
        // the server's own type, not a caller-supplied one
        let template_id = self
            .find_template_id(
                &mut cache,
                info.virtualization_type.as_deref(),
                &params.image,
            )
            .await?;

        self.client.rebuild(&params.instance_id, &template_id).await?;

        info!(server_id = %params.instance_id, template = %template_id, "solusvm: rebuilding");

        Ok(info
            .with_image(params.image.clone())
            .with_message("Server rebuilding with fresh image/template"))
    }

    async fn reboot(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        self.client.reboot(&params.instance_id).await?;

        let mut cache = Catalogs::default();
        Ok(self
            .server_info(&mut cache, &params.instance_id)
            .await?
            .with_state("rebooting")
            .with_message("Server rebooting"))
    }

    async fn shutdown(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let mut cache = Catalogs::default();
        let info = self.server_info(&mut cache, &params.instance_id).await?;

        if info.state == "offline" {
            return Ok(info.with_message("Server already offline"));
        }

        self.client.shutdown(&params.instance_id).await?;

        Ok(info
            .with_state("shutting_down")
            .with_message("Server shutting down"))
    }

    async fn power_on(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let mut cache = Catalogs::default();
        let info = self.server_info(&mut cache, &params.instance_id).await?;

        if info.state == "online" {
            return Ok(info.with_message("Server already online"));
        }

        self.client.boot(&params.instance_id).await?;

        Ok(info.with_state("booting").with_message("Server booting"))
    }

    async fn terminate(&self, params: &ServerIdentifier) -> Result<EmptyResult> {
        self.client.terminate(&params.instance_id).await?;

        info!(server_id = %params.instance_id, "solusvm: server terminating");

        Ok(EmptyResult::with_message("Server terminating"))
    }
}

impl From<solusvm_api::Error> for Error {
    fn from(e: solusvm_api::Error) -> Self {
        match e {
            solusvm_api::Error::Api {
                status,
                message,
                body,
                ..
            } => Error::Api {
                message,
                status: Some(status),
                data: serde_json::Value::Null,
                debug: Some(body),
            },
            solusvm_api::Error::Request(e) if e.is_connect() || e.is_timeout() => {
                Error::connection(e.to_string())
            }
            solusvm_api::Error::Request(e) => Error::Api {
                message: format!("API Request Failed: {e}"),
                status: e.status().map(|s| s.as_u16()),
                data: serde_json::Value::Null,
                debug: None,
            },
            solusvm_api::Error::Unparseable { body, .. } => Error::Unparseable { debug: Some(body) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(server: &mockito::ServerGuard) -> SolusVmProvider {
        SolusVmProvider {
            config: SolusVmConfig {
                hostname: "solusvm.test".into(),
                port: None,
                api_id: "id".into(),
                api_key: "key".into(),
                location_type: SolusVmLocationType::Node,
                default_virtualization_type: Some("kvm".into()),
                single_server_owner: false,
                server_owner_username: None,
            },
            client: SolusVmClient::with_base_url(server.url(), "id", "key").unwrap(),
        }
    }

    async fn mock_info(
        server: &mut mockito::ServerGuard,
        state: &str,
    ) -> (mockito::Mock, mockito::Mock) {
        let infoall = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::UrlEncoded("action".into(), "vserver-infoall".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"status":"success","vserverid":"101","state":"{state}","hostname":"web1.test","ipaddress":"203.0.113.5","template":"175","type":"kvm","node":"node1","cpus":"2","memory":"2048MB","hdd":"20GB"}}"#
            ))
            .create_async()
            .await;

        let info = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::UrlEncoded("action".into(), "vserver-info".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"success","vserverid":"101"}"#)
            .create_async()
            .await;

        (infoall, info)
    }

    async fn mock_catalogs(
        server: &mut mockito::ServerGuard,
    ) -> (mockito::Mock, mockito::Mock) {
        let templates = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("action".into(), "listtemplates".into()),
                Matcher::UrlEncoded("type".into(), "kvm".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":"success","templates":"175|Ubuntu 20.04,--none--,176|Debian 11"}"#,
            )
            .create_async()
            .await;

        let plans = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("action".into(), "list-plans".into()),
                Matcher::UrlEncoded("type".into(), "kvm".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":"success","plans":[{"id":"3","name":"2gb","cpus":"2","ram":"2048MB","disk":"20GB"}]}"#,
            )
            .create_async()
            .await;

        (templates, plans)
    }

    #[tokio::test]
    async fn shutdown_of_offline_server_short_circuits() {
        let mut server = mockito::Server::new_async().await;

        let _info = mock_info(&mut server, "offline").await;
        let _catalogs = mock_catalogs(&mut server).await;

        let shutdown_mock = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::UrlEncoded("action".into(), "vserver-shutdown".into()))
            .expect(0)
            .create_async()
            .await;

        let info = provider(&server)
            .shutdown(&ServerIdentifier::new("101"))
            .await
            .unwrap();

        assert_eq!(info.message, "Server already offline");
        assert_eq!(info.state, "offline");
        shutdown_mock.assert_async().await;
    }

    #[tokio::test]
    async fn power_on_running_server_short_circuits() {
        let mut server = mockito::Server::new_async().await;

        let _info = mock_info(&mut server, "online").await;
        let _catalogs = mock_catalogs(&mut server).await;

        let boot_mock = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::UrlEncoded("action".into(), "vserver-boot".into()))
            .expect(0)
            .create_async()
            .await;

        let info = provider(&server)
            .power_on(&ServerIdentifier::new("101"))
            .await
            .unwrap();

        assert_eq!(info.message, "Server already online");
        boot_mock.assert_async().await;
    }

    #[tokio::test]
    async fn resize_running_server_is_refused_without_override() {
        let mut server = mockito::Server::new_async().await;

        let _info = mock_info(&mut server, "online").await;
        let _catalogs = mock_catalogs(&mut server).await;

        let change_mock = server
            .mock("POST", "/api/admin/command.php")
            .match_body(Matcher::UrlEncoded("action".into(), "vserver-change".into()))
            .expect(0)
            .create_async()
            .await;

        let result = provider(&server)
            .resize(&ResizeParams {
                instance_id: "101".into(),
                size: Some("2gb".into()),
                resize_running: false,
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(Error::Denied(_))));
        change_mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_info_resolves_template_label_and_plan_name() {
        let mut server = mockito::Server::new_async().await;

        let _info = mock_info(&mut server, "online").await;
        let _catalogs = mock_catalogs(&mut server).await;

        let info = provider(&server)
            .get_info(&ServerIdentifier::new("101"))
            .await
            .unwrap();

        assert_eq!(info.instance_id, "101");
        assert_eq!(info.image, "Ubuntu 20.04");
        assert_eq!(info.size.as_deref(), Some("2gb"));
        assert_eq!(info.node.as_deref(), Some("node1"));
    }

    #[tokio::test]
    async fn template_resolution_falls_back_from_id_to_label() {
        let mut server = mockito::Server::new_async().await;

        let _catalogs = mock_catalogs(&mut server).await;

        let p = provider(&server);
        let mut cache = Catalogs::default();

        // an existing id passes straight through
        let by_id = p
            .find_template_id(&mut cache, Some("kvm"), "175")
            .await
            .unwrap();
        assert_eq!(by_id, "175");

        // a label resolves to its id, served from the memo (one fetch)
        let by_label = p
            .find_template_id(&mut cache, Some("kvm"), "Debian 11")
            .await
            .unwrap();
        assert_eq!(by_label, "176");

        let missing = p
            .find_template_id(&mut cache, Some("kvm"), "Windows 98")
            .await
            .unwrap_err();
        match missing {
            Error::NotFound { resource, lookup } => {
                assert_eq!(resource, "template");
                assert_eq!(lookup, "Windows 98");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
