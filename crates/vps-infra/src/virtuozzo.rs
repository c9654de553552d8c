//! Virtuozzo Hybrid Server 7 adapter.
//!
//! Sizing is always the explicit memory/cpu/disk triplet; the agent has no
//! named plans, so a `size` param is refused outright. Multi-step flows
//! (create → install tools → start, stop-before-resize) are small fixed
//! sequences of agent calls with no rollback.

use async_trait::async_trait;
use tracing::info;

use crate::types::{
    ChangeRootPasswordParams, ConnectionResult, CreateParams, EmptyResult, ReinstallParams,
    ResizeParams, ServerIdentifier, ServerInfoResult, ServerSpecs,
};
use crate::{Error, ProviderName, Result, ServerProvider};
use virtuozzo_api::{state_label, ServerInfo, VirtuozzoClient};

const OS_PLATFORM: &str = "Linux";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct VirtuozzoConfig {
    pub hostname: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub timeout: Option<u64>,
}

/// Virtuozzo adapter. Delegates to the agent socket client.
pub struct VirtuozzoProvider {
    client: VirtuozzoClient,
}

impl VirtuozzoProvider {
    pub fn new(config: VirtuozzoConfig) -> Self {
        Self {
            client: VirtuozzoClient::new(
                &config.hostname,
                config.port,
                config.username,
                config.password,
                config.timeout,
            ),
        }
    }

    /// Create from env vars: `VIRTUOZZO_HOSTNAME`, `VIRTUOZZO_USERNAME`,
    /// `VIRTUOZZO_PASSWORD` (required), `VIRTUOZZO_PORT`,
    /// `VIRTUOZZO_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let require = |var: &str| {
            std::env::var(var).map_err(|_| Error::Config(format!("{var} is not set")))
        };

        Ok(Self::new(VirtuozzoConfig {
            hostname: require("VIRTUOZZO_HOSTNAME")?,
            port: std::env::var("VIRTUOZZO_PORT").ok().and_then(|p| p.parse().ok()),
            username: require("VIRTUOZZO_USERNAME")?,
            password: require("VIRTUOZZO_PASSWORD")?,
            timeout: std::env::var("VIRTUOZZO_TIMEOUT").ok().and_then(|t| t.parse().ok()),
        }))
    }

    fn to_result(info: &ServerInfo) -> ServerInfoResult {
        ServerInfoResult {
            instance_id: info.eid.clone(),
            state: state_label(&info.state_code).to_string(),
            label: info.name.clone(),
            hostname: info.hostname.clone(),
            ip_address: info.ip_address.clone(),
            image: info.os_name.clone().unwrap_or_else(|| "Unknown".into()),
            specs: Some(ServerSpecs {
                memory_mb: info.memory_mb,
                cpu_cores: info.cpu_count,
                disk_mb: info.disk_mb,
            }),
            location: info.home_path.clone().unwrap_or_else(|| "Unknown".into()),
            node: info.hostname.clone(),
            virtualization_type: info.virtualization_type.clone(),
            ..Default::default()
        }
    }

    async fn server_info(&self, instance_id: &str) -> Result<ServerInfoResult> {
        match self.client.get_server_info(instance_id).await {
            Ok(info) => Ok(Self::to_result(&info)),
            Err(virtuozzo_api::Error::Empty) => Err(Error::not_found("server", instance_id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ServerProvider for VirtuozzoProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Virtuozzo
    }

    async fn create(&self, params: &CreateParams) -> Result<ServerInfoResult> {
        if params.size.is_some() {
            return Err(Error::denied("Size parameter not supported"));
        }

        let specs = params.specs().ok_or_else(|| {
            Error::denied("explicit memory_mb, cpu_cores and disk_mb are required")
        })?;

        let server_id = self
            .client
            .create(
                params.virtualization_type.as_deref(),
                &params.label,
                &params.location,
                &params.image,
                OS_PLATFORM,
                specs.memory_mb,
                specs.cpu_cores,
                specs.disk_mb,
            )
            .await?;

        self.client.install_tools(&server_id).await?;
        self.client.start(&server_id).await?;

        info!(server_id = %server_id, "virtuozzo: server created");

        Ok(self
            .server_info(&server_id)
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
        let info = self.server_info(&params.instance_id).await?;

        let target = info
            .ip_address
            .clone()
            .or_else(|| info.hostname.clone())
            .ok_or_else(|| Error::api("IP address not found"))?;

        Ok(ConnectionResult::Ssh {
            command: format!("ssh root@{target}"),
            password: None,
            expires_at: None,
            message: "SSH command generated".into(),
        })
    }

    async fn change_root_password(
        &self,
        params: &ChangeRootPasswordParams,
    ) -> Result<ServerInfoResult> {
        self.client
            .change_password(&params.instance_id, &params.root_password)
            .await?;

        info!(server_id = %params.instance_id, "virtuozzo: root password changed");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Root password changed"))
    }

    async fn resize(&self, params: &ResizeParams) -> Result<ServerInfoResult> {
        if params.size.is_some() {
            return Err(Error::denied("Size parameter not supported"));
        }

        let specs = params.specs().ok_or_else(|| {
            Error::denied("explicit memory_mb, cpu_cores and disk_mb are required")
        })?;

        let info = self.server_info(&params.instance_id).await?;

        if info.state == "running" && !params.resize_running {
            return Err(Error::denied(
                "Resize not available while server is running",
            ));
        }

        if info.state != "down" {
            self.client.stop(&params.instance_id).await?;
        }

        self.client
            .resize(
                &params.instance_id,
                specs.memory_mb,
                specs.cpu_cores,
                specs.disk_mb,
            )
            .await?;

        self.client.start(&params.instance_id).await?;

        info!(server_id = %params.instance_id, "virtuozzo: server resizing");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server is resizing"))
    }

    async fn reinstall(&self, params: &ReinstallParams) -> Result<ServerInfoResult> {
        self.client.stop(&params.instance_id).await?;
        self.client
            .set_image(&params.instance_id, &params.image, OS_PLATFORM)
            .await?;
        self.client.start(&params.instance_id).await?;

        info!(server_id = %params.instance_id, image = %params.image, "virtuozzo: rebuilding");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server rebuilding with fresh image/template"))
    }

    async fn reboot(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        self.client.restart(&params.instance_id).await?;

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server is rebooting"))
    }

    async fn shutdown(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;

        if info.state == "down" {
            return Ok(info.with_message("Virtual server already off"));
        }

        self.client.stop(&params.instance_id).await?;

        Ok(info
            .with_state("Stopping")
            .with_message("Server is shutting down"))
    }

    async fn power_on(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;

        if info.state == "running" {
            return Ok(info.with_message("Virtual server already on"));
        }

        self.client.start(&params.instance_id).await?;

        Ok(info
            .with_state("Starting")
            .with_message("Server is booting"))
    }

    async fn terminate(&self, params: &ServerIdentifier) -> Result<EmptyResult> {
        self.client.stop(&params.instance_id).await?;
        self.client.destroy(&params.instance_id).await?;

        info!(server_id = %params.instance_id, "virtuozzo: server destroyed");

        Ok(EmptyResult::with_message("Server permanently deleted"))
    }
}

impl From<virtuozzo_api::Error> for Error {
    fn from(e: virtuozzo_api::Error) -> Self {
        match e {
            virtuozzo_api::Error::Connect { message } => Error::connection(message),
            virtuozzo_api::Error::Io(e) => Error::connection(e.to_string()),
            virtuozzo_api::Error::Api { message, body } => Error::Api {
                message,
                status: None,
                data: serde_json::Value::Null,
                debug: Some(body),
            },
            virtuozzo_api::Error::Unparseable { body } => {
                Error::Unparseable { debug: Some(body) }
            }
            virtuozzo_api::Error::Empty => Error::Unparseable { debug: None },
        }
    }
}
