//! Virtualizor adapter.
//!
//! The panel inlines plan and host-server catalogs into its `editvs`
//! response, so most lookups resolve locally; misses fall back to the
//! paginated catalog endpoints. What `location` means is configurable:
//! a host server, a server group, or a geographic location string.

use std::str::FromStr;

use async_trait::async_trait;
use tracing::info;

use crate::types::{
    generate_password, ChangeRootPasswordParams, ConnectionResult, CreateParams, EmptyResult,
    ReinstallParams, ResizeParams, ServerIdentifier, ServerInfoResult,
};
use crate::{Error, ProviderName, Result, ServerProvider};
use virtualizor_api::{
    location_json_to_string, status_label, AllServerInfo, CreateServerRequest, HostServer,
    OsTemplate, Plan, VirtualizorClient,
};

/// What the `location` create param refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualizorLocationType {
    Server,
    ServerGroup,
    Geographic,
}

impl FromStr for VirtualizorLocationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(Self::Server),
            "server_group" => Ok(Self::ServerGroup),
            "geographic" => Ok(Self::Geographic),
            other => Err(Error::Config(format!("unknown location type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct VirtualizorConfig {
    pub hostname: String,
    pub port: Option<u16>,
    pub api_key: String,
    pub api_password: String,
    pub location_type: VirtualizorLocationType,
    pub default_virtualization_type: Option<String>,
}

/// Virtualizor adapter. Delegates to `virtualizor_api::VirtualizorClient`.
pub struct VirtualizorProvider {
    config: VirtualizorConfig,
    client: VirtualizorClient,
}

impl VirtualizorProvider {
    pub fn new(config: VirtualizorConfig) -> Result<Self> {
        let client = VirtualizorClient::new(
            &config.hostname,
            config.port,
            config.api_key.clone(),
            config.api_password.clone(),
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Create from env vars: `VIRTUALIZOR_HOSTNAME`, `VIRTUALIZOR_API_KEY`,
    /// `VIRTUALIZOR_API_PASSWORD` (required), `VIRTUALIZOR_PORT`,
    /// `VIRTUALIZOR_LOCATION_TYPE` (default `geographic`),
    /// `VIRTUALIZOR_VIRTUALIZATION_TYPE`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let require = |var: &str| {
            std::env::var(var).map_err(|_| Error::Config(format!("{var} is not set")))
        };

        let config = VirtualizorConfig {
            hostname: require("VIRTUALIZOR_HOSTNAME")?,
            port: std::env::var("VIRTUALIZOR_PORT").ok().and_then(|p| p.parse().ok()),
            api_key: require("VIRTUALIZOR_API_KEY")?,
            api_password: require("VIRTUALIZOR_API_PASSWORD")?,
            location_type: std::env::var("VIRTUALIZOR_LOCATION_TYPE")
                .unwrap_or_else(|_| "geographic".into())
                .parse()?,
            default_virtualization_type: std::env::var("VIRTUALIZOR_VIRTUALIZATION_TYPE").ok(),
        };

        Self::new(config)
    }

    async fn find_plan(
        &self,
        plan: &str,
        virtualization_type: Option<&str>,
    ) -> Result<Plan> {
        let (plan_id, plan_name) = split_numeric(plan);

        self.client
            .find_plan(plan_id, plan_name, virtualization_type)
            .await?
            .ok_or_else(|| Error::not_found("plan", plan))
    }

    async fn find_os_template(&self, image: &str) -> Result<OsTemplate> {
        let (os_id, os_name) = split_numeric(image);

        let templates = self.client.list_os_templates().await?;

        templates
            .into_iter()
            .find(|template| match (os_id, os_name) {
                (Some(id), _) => template.osid.as_deref() == Some(id),
                (None, Some(name)) => template.name == name,
                (None, None) => false,
            })
            .ok_or_else(|| Error::not_found("os template", image))
    }

    async fn server_info_result(&self, all: &AllServerInfo) -> Result<ServerInfoResult> {
        let vps = &all.vps;

        let plan_name = vps.plid.as_deref().and_then(|plid| {
            all.plans[plid]["plan_name"]
                .as_str()
                .map(str::to_string)
        });

        let plan_name = match plan_name {
            Some(name) => Some(name),
            None => match vps.plid.as_deref() {
                Some(plid) => self
                    .client
                    .find_plan(Some(plid), None, None)
                    .await?
                    .map(|plan| plan.plan_name),
                None => None,
            },
        };

        let server = match vps.serid.as_deref() {
            Some(serid) => match serde_json::from_value::<HostServer>(all.servers[serid].clone()) {
                Ok(server) => Some(server),
                Err(_) => self.client.find_server(Some(serid), None, None).await?,
            },
            None => None,
        };

        let location = match (&self.config.location_type, &server) {
            (VirtualizorLocationType::Server, Some(server)) => server.server_name.clone(),
            (_, Some(server)) => location_json_to_string(server.location.as_deref()),
            (_, None) => "Unknown".to_string(),
        };

        let hostname = vps.hostname.clone().unwrap_or_else(|| "Unknown".into());

        Ok(ServerInfoResult {
            instance_id: vps.vpsid.clone(),
            state: status_label(
                vps.stats
                    .as_ref()
                    .and_then(|stats| stats.status.as_deref()),
            )
            .to_string(),
            label: format!(
                "{hostname} [{}]",
                vps.vps_name.as_deref().unwrap_or_default()
            ),
            hostname: Some(hostname),
            ip_address: vps.first_ip(),
            image: vps.os_name.clone().unwrap_or_else(|| "Unknown".into()),
            size: Some(plan_name.unwrap_or_else(|| "Custom".into())),
            location,
            node: server.as_ref().map(|s| s.server_name.clone()),
            virtualization_type: vps.virt.clone(),
            ..Default::default()
        })
    }

    async fn fresh_info(&self, instance_id: &str) -> Result<ServerInfoResult> {
        let all = self.client.get_all_info(instance_id).await?;
        self.server_info_result(&all).await
    }
}

#[async_trait]
impl ServerProvider for VirtualizorProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Virtualizor
    }

    async fn create(&self, params: &CreateParams) -> Result<ServerInfoResult> {
        params.validate()?;

        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let virtualization_type = params
            .virtualization_type
            .clone()
            .or_else(|| self.config.default_virtualization_type.clone())
            .unwrap_or_else(|| "kvm".into());

        let plan = self.find_plan(size, Some(&virtualization_type)).await?;
        let template = self.find_os_template(&params.image).await?;

        let mut server_group_id = None;
        let mut server_id = None;
        match self.config.location_type {
            VirtualizorLocationType::ServerGroup => {
                let (group_id, group_name) = split_numeric(&params.location);
                let group = self
                    .client
                    .find_server_group(group_id, group_name)
                    .await?
                    .ok_or_else(|| Error::not_found("server group", &params.location))?;
                server_group_id = Some(group.sgid);
            }
            VirtualizorLocationType::Server => {
                let (id, name) = split_numeric(&params.location);
                let server = self
                    .client
                    .find_server(id, name, None)
                    .await?
                    .ok_or_else(|| Error::not_found("host server", &params.location))?;
                server_id = Some(server.serid);
            }
            VirtualizorLocationType::Geographic => {
                let server = self
                    .client
                    .find_server(None, None, Some(&params.location))
                    .await?
                    .ok_or_else(|| Error::not_found("host server", &params.location))?;
                server_id = Some(server.serid);
            }
        }

        let os_id = template
            .osid
            .clone()
            .ok_or_else(|| Error::not_found("os template", &params.image))?;

        let password = params
            .root_password
            .clone()
            .unwrap_or_else(|| generate_password(16));

        let vps_id = self
            .client
            .create_server(&CreateServerRequest {
                virtualization_type: plan.virt.clone().unwrap_or(virtualization_type),
                plan_id: plan.plid.clone(),
                os_id,
                server_group_id,
                server_id,
                hostname: params.label.clone(),
                email: params.email.clone(),
                password,
            })
            .await?;

        info!(vps_id = %vps_id, "virtualizor: server creating");

        Ok(self
            .fresh_info(&vps_id)
            .await?
            .with_state("Creating")
            .with_message("Virtual server creating"))
    }

    async fn get_info(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        self.fresh_info(&params.instance_id).await
    }

    async fn get_connection(&self, params: &ServerIdentifier) -> Result<ConnectionResult> {
        let info = self.fresh_info(&params.instance_id).await?;

        let ip = info
            .ip_address
            .as_deref()
            .ok_or_else(|| Error::api("IP address not found"))?;

        Ok(ConnectionResult::Ssh {
            command: format!("ssh root@{ip}"),
            password: None,
            expires_at: None,
            message: "SSH command generated".into(),
        })
    }

    async fn change_root_password(
        &self,
        params: &ChangeRootPasswordParams,
    ) -> Result<ServerInfoResult> {
        let data = self
            .client
            .change_root_password(&params.instance_id, &params.root_password)
            .await?;

        let message = data["done_msg"]
            .as_str()
            .unwrap_or("Root password changed")
            .to_string();

        Ok(self.fresh_info(&params.instance_id).await?.with_message(message))
    }

    async fn resize(&self, params: &ResizeParams) -> Result<ServerInfoResult> {
        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let info = self.fresh_info(&params.instance_id).await?;

        if info.state == "On" && !params.resize_running {
            return Err(Error::denied(
                "Resize not available while server is running",
            ));
        }

        let plan = self
            .find_plan(size, info.virtualization_type.as_deref())
            .await?;

        let data = self
            .client
            .change_plan(&params.instance_id, &plan.plid)
            .await?;

        info!(vps_id = %params.instance_id, plan = %plan.plan_name, "virtualizor: plan changed");

        let message = data["done_msg"]
            .as_str()
            .unwrap_or("Virtual server plan updated")
            .to_string();

        Ok(info.with_size(plan.plan_name).with_message(message))
    }

    async fn reinstall(&self, params: &ReinstallParams) -> Result<ServerInfoResult> {
        let all = self.client.get_all_info(&params.instance_id).await?;
        let info = self.server_info_result(&all).await?;

        let template = self.find_os_template(&params.image).await?;
        let os_id = template
            .osid
            .clone()
            .ok_or_else(|| Error::not_found("os template", &params.image))?;

        let password = params
            .root_password
            .clone()
            .unwrap_or_else(|| generate_password(16));

        let data = self
            .client
            .rebuild(&params.instance_id, &os_id, &password)
            .await?;

        info!(vps_id = %params.instance_id, os_id, "virtualizor: rebuilding");

        let message = data["done_msg"]
            .as_str()
            .unwrap_or("Virtual server reinstalling")
            .to_string();

        Ok(info
            .with_image(template.name)
            .with_state("Rebuilding")
            .with_message(message))
    }

    async fn reboot(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.fresh_info(&params.instance_id).await?;

        let data = self
            .client
            .server_action(&params.instance_id, "restart")
            .await?;

        let message = data["done_msg"]
            .as_str()
            .unwrap_or("Virtual server restarting")
            .to_string();

        Ok(info.with_state("Restarting").with_message(message))
    }

    async fn shutdown(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.fresh_info(&params.instance_id).await?;

        if info.state == "Off" {
            return Ok(info.with_message("Virtual server already off"));
        }

        let data = self
            .client
            .server_action(&params.instance_id, "stop")
            .await?;

        let message = data["done_msg"]
            .as_str()
            .unwrap_or("Virtual server stopping")
            .to_string();

        Ok(info.with_state("Stopping").with_message(message))
    }

    async fn power_on(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.fresh_info(&params.instance_id).await?;

        if info.state == "On" {
            return Ok(info.with_message("Virtual server already on"));
        }

        let data = self
            .client
            .server_action(&params.instance_id, "start")
            .await?;

        let message = data["done_msg"]
            .as_str()
            .unwrap_or("Virtual server starting")
            .to_string();

        Ok(info.with_state("Starting").with_message(message))
    }

    async fn suspend(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Ok(self.shutdown(params).await?.with_suspended(true))
    }

    async fn unsuspend(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Ok(self.power_on(params).await?.with_suspended(false))
    }

    async fn terminate(&self, params: &ServerIdentifier) -> Result<EmptyResult> {
        self.client.delete_server(&params.instance_id).await?;

        info!(vps_id = %params.instance_id, "virtualizor: server deleted");

        Ok(EmptyResult::with_message("Virtual server deleted"))
    }
}

impl From<virtualizor_api::Error> for Error {
    fn from(e: virtualizor_api::Error) -> Self {
        match e {
            virtualizor_api::Error::Api {
                status,
                message,
                data,
                body,
                ..
            } => Error::Api {
                message,
                status: Some(status),
                data,
                debug: if body.is_empty() { None } else { Some(body) },
            },
            virtualizor_api::Error::Request(e) if e.is_connect() || e.is_timeout() => {
                Error::connection(e.to_string())
            }
            virtualizor_api::Error::Request(e) => Error::Api {
                message: format!("API Request Failed: {e}"),
                status: e.status().map(|s| s.as_u16()),
                data: serde_json::Value::Null,
                debug: None,
            },
            virtualizor_api::Error::Unparseable { body, .. } => {
                Error::Unparseable { debug: Some(body) }
            }
        }
    }
}

/// Numeric input is an id; anything else is a name.
fn split_numeric(input: &str) -> (Option<&str>, Option<&str>) {
    if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
        (Some(input), None)
    } else {
        (None, Some(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(server: &mockito::ServerGuard) -> VirtualizorProvider {
        VirtualizorProvider {
            config: VirtualizorConfig {
                hostname: "virtualizor.test".into(),
                port: None,
                api_key: "key".into(),
                api_password: "pass".into(),
                location_type: VirtualizorLocationType::Geographic,
                default_virtualization_type: Some("kvm".into()),
            },
            client: VirtualizorClient::with_base_url(server.url(), "key", "pass").unwrap(),
        }
    }

    /// `editvs` payload with the catalogs the panel inlines.
    fn all_info_body(status: u8) -> String {
        format!(
            r#"{{"vps":{{"vpsid":"12","hostname":"web1.test","vps_name":"v1001","plid":"3","serid":"1","os_name":"Ubuntu 20.04","virt":"kvm","ips":{{"55":"203.0.113.9"}},"stats":{{"status":{status}}}}},"plans":{{"3":{{"plid":3,"plan_name":"2gb","virt":"kvm"}}}},"servers":{{"1":{{"serid":1,"server_name":"node1","location":"{{\"city\":\"London\",\"country_code\":\"GB\"}}"}}}}}}"#
        )
    }

    #[test]
    fn numeric_inputs_split_into_ids() {
        assert_eq!(split_numeric("42"), (Some("42"), None));
        assert_eq!(split_numeric("2gb"), (None, Some("2gb")));
        assert_eq!(split_numeric(""), (None, Some("")));
    }

    #[tokio::test]
    async fn get_info_maps_status_and_location() {
        let mut server = mockito::Server::new_async().await;

        let _info = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "editvs".into()),
                Matcher::UrlEncoded("vpsid".into(), "12".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(all_info_body(1))
            .create_async()
            .await;

        let info = provider(&server)
            .get_info(&ServerIdentifier::new("12"))
            .await
            .unwrap();

        assert_eq!(info.instance_id, "12");
        assert_eq!(info.state, "On");
        assert_eq!(info.label, "web1.test [v1001]");
        assert_eq!(info.size.as_deref(), Some("2gb"));
        assert_eq!(info.location, "London, GB");
        assert_eq!(info.node.as_deref(), Some("node1"));
        assert_eq!(info.ip_address.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn resize_running_server_is_refused_without_override() {
        let mut server = mockito::Server::new_async().await;

        let _info = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "editvs".into()),
                Matcher::UrlEncoded("vpsid".into(), "12".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(all_info_body(1))
            .create_async()
            .await;

        let change_mock = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "editvs".into()),
                Matcher::UrlEncoded("vpsid".into(), "12".into()),
            ]))
            .match_body(Matcher::UrlEncoded("editvps".into(), "1".into()))
            .expect(0)
            .create_async()
            .await;

        let result = provider(&server)
            .resize(&ResizeParams {
                instance_id: "12".into(),
                size: Some("2gb".into()),
                resize_running: false,
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(Error::Denied(_))));
        change_mock.assert_async().await;
    }

    #[tokio::test]
    async fn shutdown_of_stopped_server_short_circuits() {
        let mut server = mockito::Server::new_async().await;

        let _info = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "editvs".into()),
                Matcher::UrlEncoded("vpsid".into(), "12".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(all_info_body(0))
            .create_async()
            .await;

        let action_mock = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "vs".into()),
                Matcher::UrlEncoded("action".into(), "stop".into()),
            ]))
            .expect(0)
            .create_async()
            .await;

        let info = provider(&server)
            .shutdown(&ServerIdentifier::new("12"))
            .await
            .unwrap();

        assert_eq!(info.message, "Virtual server already off");
        action_mock.assert_async().await;
    }
}
