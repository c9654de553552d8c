//! OnApp adapter.
//!
//! Sizing is always the explicit memory/cpu/disk triplet; the panel has no
//! named plans. Location strings are matched against location groups as
//! `Country (City)`, and a server's own location is derived by walking
//! hypervisor → hypervisor zone → location group.

use async_trait::async_trait;
use tracing::info;

use crate::types::{
    format_timestamp, ChangeRootPasswordParams, ConnectionResult, CreateParams, EmptyResult,
    ReinstallParams, ResizeParams, ServerIdentifier, ServerInfoResult, ServerSpecs,
};
use crate::{Error, ProviderName, Result, ServerProvider};
use onapp_api::{CreateVirtualMachineRequest, LocationGroup, OnAppClient, Template, VirtualMachine};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct OnAppConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub timeout: Option<u64>,
}

/// OnApp adapter. Delegates to `onapp_api::OnAppClient`.
pub struct OnAppProvider {
    client: OnAppClient,
}

impl OnAppProvider {
    pub fn new(config: OnAppConfig) -> Result<Self> {
        let client = OnAppClient::new(
            &config.hostname,
            &config.username,
            &config.password,
            config.timeout,
        )
        .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self { client })
    }

    /// Create from env vars: `ONAPP_HOSTNAME`, `ONAPP_USERNAME`,
    /// `ONAPP_PASSWORD` (required), `ONAPP_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let require = |var: &str| {
            std::env::var(var).map_err(|_| Error::Config(format!("{var} is not set")))
        };

        Self::new(OnAppConfig {
            hostname: require("ONAPP_HOSTNAME")?,
            username: require("ONAPP_USERNAME")?,
            password: require("ONAPP_PASSWORD")?,
            timeout: std::env::var("ONAPP_TIMEOUT").ok().and_then(|t| t.parse().ok()),
        })
    }

    fn state(vm: &VirtualMachine) -> &'static str {
        if vm.locked == Some(true) {
            "Locked"
        } else if vm.booted == Some(true) {
            "On"
        } else {
            "Off"
        }
    }

    /// Prefer the single reported address, else the first public IPv4.
    fn ip_address(vm: &VirtualMachine) -> Option<String> {
        if vm.ip_addresses.len() == 1 {
            return vm
                .ip_addresses
                .first()
                .map(|entry| entry.ip_address.address.clone());
        }

        vm.ip_addresses
            .iter()
            .map(|entry| entry.ip_address.address.as_str())
            .find(|address| is_public_ipv4(address))
            .map(str::to_string)
    }

    async fn server_info(&self, server_id: &str) -> Result<ServerInfoResult> {
        let vm = self.client.get_virtual_machine(server_id).await?;

        let primary_disk = self.client.primary_disk(server_id).await?;

        let location = match vm.hypervisor_id {
            Some(hypervisor_id) => self
                .client
                .hypervisor_location(hypervisor_id)
                .await?
                .map(|group| group.display_name()),
            None => None,
        };

        Ok(ServerInfoResult {
            instance_id: vm.identifier.clone().unwrap_or_else(|| "Unknown".into()),
            state: Self::state(&vm).to_string(),
            label: vm.label.clone().unwrap_or_else(|| "Unknown".into()),
            hostname: vm.hostname.clone(),
            ip_address: Self::ip_address(&vm),
            image: vm
                .template_label
                .clone()
                .unwrap_or_else(|| "Unknown".into()),
            specs: Some(ServerSpecs {
                memory_mb: vm.memory.unwrap_or(0) as u32,
                cpu_cores: vm.cpus.unwrap_or(0) as u32,
                disk_mb: (primary_disk.disk_size.unwrap_or(0) * 1024) as u32,
            }),
            location: location.unwrap_or_else(|| "Unknown".into()),
            virtualization_type: vm.hypervisor_type.clone(),
            created_at: vm.created_at.as_deref().and_then(format_timestamp),
            updated_at: vm.updated_at.as_deref().and_then(format_timestamp),
            ..Default::default()
        })
    }

    async fn find_template(&self, name: &str) -> Result<Template> {
        if let Ok(template_id) = name.parse::<u64>() {
            return self
                .client
                .get_template(template_id)
                .await
                .map_err(Error::from);
        }

        let templates = self.client.list_templates().await?;

        templates
            .into_iter()
            .find(|template| template.label == name)
            .ok_or_else(|| Error::not_found("template", name))
    }

    async fn find_location(&self, name: &str) -> Result<LocationGroup> {
        if let Ok(location_id) = name.parse::<u64>() {
            return self
                .client
                .get_location_group(location_id)
                .await
                .map_err(Error::from);
        }

        let locations = self.client.list_location_groups().await?;

        locations
            .into_iter()
            .find(|location| location.display_name() == name)
            .ok_or_else(|| Error::not_found("location", name))
    }
}

#[async_trait]
impl ServerProvider for OnAppProvider {
    fn name(&self) -> ProviderName {
        ProviderName::OnApp
    }

    async fn create(&self, params: &CreateParams) -> Result<ServerInfoResult> {
        params.validate()?;

        let specs = params.specs().ok_or_else(|| {
            Error::denied("explicit memory_mb, cpu_cores and disk_mb are required")
        })?;

        let location = self.find_location(&params.location).await?;
        let template = self.find_template(&params.image).await?;

        let vm = self
            .client
            .create_virtual_machine(&CreateVirtualMachineRequest {
                cpu_shares: 1,
                hostname: params.label.clone(),
                label: params.label.clone(),
                template_id: template.id,
                memory: u64::from(specs.memory_mb),
                cpus: u64::from(specs.cpu_cores),
                primary_disk_size: u64::from(specs.disk_mb.div_ceil(1024)),
                required_virtual_machine_build: 1,
                required_virtual_machine_startup: 1,
                location_id: location.id,
                initial_root_password: params.root_password.clone(),
            })
            .await?;

        let server_id = vm
            .identifier
            .clone()
            .ok_or_else(|| Error::api("Server creation failed"))?;

        info!(server_id = %server_id, "onapp: server created");

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

        let ip = info
            .ip_address
            .as_deref()
            .ok_or_else(|| Error::api("IP address not found"))?;

        let vm = self.client.get_virtual_machine(&params.instance_id).await?;

        Ok(ConnectionResult::Ssh {
            command: format!("ssh root@{ip}"),
            password: vm.initial_root_password.clone(),
            expires_at: None,
            message: "SSH command generated".into(),
        })
    }

    async fn change_root_password(
        &self,
        params: &ChangeRootPasswordParams,
    ) -> Result<ServerInfoResult> {
        self.client
            .reset_password(&params.instance_id, &params.root_password)
            .await?;

        info!(server_id = %params.instance_id, "onapp: root password changed");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Root password changed"))
    }

    async fn resize(&self, params: &ResizeParams) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;

        // the panel cannot hot-resize; no override is honored here
        if info.state == "On" {
            return Err(Error::denied(
                "Resize not available while server is running",
            ));
        }

        let specs = params.specs().ok_or_else(|| {
            Error::denied("explicit memory_mb, cpu_cores and disk_mb are required")
        })?;

        let primary_disk = self.client.primary_disk(&params.instance_id).await?;

        self.client
            .update_resources(
                &params.instance_id,
                u64::from(specs.memory_mb),
                u64::from(specs.cpu_cores),
            )
            .await?;

        self.client
            .resize_disk(
                &params.instance_id,
                primary_disk.id,
                u64::from(specs.disk_mb.div_ceil(1024)),
            )
            .await?;

        info!(server_id = %params.instance_id, "onapp: server resizing");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server is resizing"))
    }

    async fn reinstall(&self, params: &ReinstallParams) -> Result<ServerInfoResult> {
        let template = self.find_template(&params.image).await?;

        self.client
            .rebuild(&params.instance_id, template.id)
            .await?;

        info!(server_id = %params.instance_id, template_id = template.id, "onapp: rebuilding");

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server rebuilding with fresh image/template"))
    }

    async fn reboot(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        self.client.reboot(&params.instance_id).await?;

        Ok(self
            .server_info(&params.instance_id)
            .await?
            .with_message("Server is rebooting"))
    }

    async fn shutdown(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;

        if info.state == "Off" {
            return Ok(info.with_message("Virtual server already off"));
        }

        self.client.shutdown(&params.instance_id).await?;

        Ok(info
            .with_state("Stopping")
            .with_message("Server is shutting down"))
    }

    async fn power_on(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let info = self.server_info(&params.instance_id).await?;

        if info.state == "On" {
            return Ok(info.with_message("Virtual server already on"));
        }

        self.client.startup(&params.instance_id).await?;

        Ok(info
            .with_state("Starting")
            .with_message("Server is booting"))
    }

    async fn suspend(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        self.shutdown(params).await
    }

    async fn unsuspend(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        self.power_on(params).await
    }

    async fn terminate(&self, params: &ServerIdentifier) -> Result<EmptyResult> {
        // verify the server exists before attempting destruction
        self.server_info(&params.instance_id).await?;

        self.client.destroy(&params.instance_id).await?;

        info!(server_id = %params.instance_id, "onapp: server deleting");

        Ok(EmptyResult::with_message("Server is deleting"))
    }
}

impl From<onapp_api::Error> for Error {
    fn from(e: onapp_api::Error) -> Self {
        match e {
            onapp_api::Error::Connect(e) => Error::connection(e.to_string()),
            onapp_api::Error::Api {
                status,
                message,
                body,
                ..
            } => Error::Api {
                message: format!("Provider API error: {message}"),
                status: Some(status),
                data: serde_json::json!({ "http_code": status }),
                debug: Some(body),
            },
            onapp_api::Error::Request(e) => Error::Api {
                message: format!("Provider API error: {e}"),
                status: e.status().map(|s| s.as_u16()),
                data: serde_json::Value::Null,
                debug: None,
            },
            onapp_api::Error::Unparseable { body, .. } => {
                Error::Unparseable { debug: Some(body) }
            }
        }
    }
}

fn is_public_ipv4(address: &str) -> bool {
    let Ok(ip) = address.parse::<std::net::Ipv4Addr>() else {
        return false;
    };

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(server: &mockito::ServerGuard) -> OnAppProvider {
        OnAppProvider {
            client: OnAppClient::with_base_url(server.url(), "admin", "secret", None).unwrap(),
        }
    }

    fn vm_body(booted: bool, locked: bool) -> String {
        format!(
            r#"{{"virtual_machine":{{"identifier":"abc123","label":"web1","hostname":"web1.test","booted":{booted},"locked":{locked},"memory":2048,"cpus":2,"template_label":"Ubuntu 20.04","hypervisor_id":7,"hypervisor_type":"kvm","ip_addresses":[{{"ip_address":{{"address":"203.0.113.10"}}}}],"created_at":"2024-03-01T12:30:45Z","updated_at":"2024-03-02T09:00:00Z"}}}}"#
        )
    }

    async fn mock_vm(server: &mut mockito::ServerGuard, booted: bool) -> mockito::Mock {
        server
            .mock("GET", "/virtual_machines/abc123.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(vm_body(booted, false))
            .create_async()
            .await
    }

    async fn mock_supporting(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
        vec![
            server
                .mock("GET", "/virtual_machines/abc123/disks.json")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(r#"[{"disk":{"id":5,"disk_size":20}}]"#)
                .create_async()
                .await,
            server
                .mock("GET", "/settings/hypervisors/7.json")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(r#"{"hypervisor":{"id":7,"hypervisor_group_id":3}}"#)
                .create_async()
                .await,
            server
                .mock("GET", "/settings/hypervisor_zones/3.json")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(r#"{"hypervisor_group":{"id":3,"location_group_id":9}}"#)
                .create_async()
                .await,
            server
                .mock("GET", "/settings/location_groups/9.json")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(r#"{"location_group":{"id":9,"city":"London","country":"UK"}}"#)
                .create_async()
                .await,
        ]
    }

    #[test]
    fn public_ipv4_detection() {
        assert!(!is_public_ipv4("203.0.113.10"), "documentation range");
        assert!(is_public_ipv4("8.8.8.8"));
        assert!(!is_public_ipv4("10.1.2.3"));
        assert!(!is_public_ipv4("127.0.0.1"));
        assert!(!is_public_ipv4("not-an-ip"));
    }

    #[tokio::test]
    async fn get_info_walks_the_location_chain() {
        let mut server = mockito::Server::new_async().await;

        let _vm = mock_vm(&mut server, true).await;
        let _support = mock_supporting(&mut server).await;

        let info = provider(&server)
            .get_info(&ServerIdentifier::new("abc123"))
            .await
            .unwrap();

        assert_eq!(info.instance_id, "abc123");
        assert_eq!(info.state, "On");
        assert_eq!(info.location, "UK (London)");
        assert_eq!(
            info.specs,
            Some(ServerSpecs {
                memory_mb: 2048,
                cpu_cores: 2,
                disk_mb: 20480,
            })
        );
        assert_eq!(info.created_at.as_deref(), Some("2024-03-01 12:30:45"));
    }

    #[tokio::test]
    async fn vendor_500_error_is_normalized_with_debug_payload() {
        let mut server = mockito::Server::new_async().await;

        let raw = r#"{"errors":{"field":["bad"]}}"#;
        let _vm = server
            .mock("GET", "/virtual_machines/abc123.json")
            .with_status(500)
            .with_header("content-type", "application/json")
            .with_body(raw)
            .create_async()
            .await;

        let err = provider(&server)
            .get_info(&ServerIdentifier::new("abc123"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("field: bad"));
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.debug(), Some(raw));
    }

    #[tokio::test]
    async fn resize_running_server_is_refused_before_any_mutation() {
        let mut server = mockito::Server::new_async().await;

        let _vm = mock_vm(&mut server, true).await;
        let _support = mock_supporting(&mut server).await;

        let update_mock = server
            .mock("PUT", "/virtual_machines/abc123.json")
            .expect(0)
            .create_async()
            .await;

        let result = provider(&server)
            .resize(&ResizeParams {
                instance_id: "abc123".into(),
                memory_mb: Some(4096),
                cpu_cores: Some(4),
                disk_mb: Some(40960),
                resize_running: true, // no override is honored by this vendor
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(Error::Denied(_))));
        update_mock.assert_async().await;
    }

    #[tokio::test]
    async fn shutdown_of_stopped_server_short_circuits() {
        let mut server = mockito::Server::new_async().await;

        let _vm = mock_vm(&mut server, false).await;
        let _support = mock_supporting(&mut server).await;

        let shutdown_mock = server
            .mock("POST", "/virtual_machines/abc123/shutdown.json")
            .expect(0)
            .create_async()
            .await;

        let info = provider(&server)
            .shutdown(&ServerIdentifier::new("abc123"))
            .await
            .unwrap();

        assert_eq!(info.message, "Virtual server already off");
        shutdown_mock.assert_async().await;
    }

    #[tokio::test]
    async fn location_resolution_matches_display_name() {
        let mut server = mockito::Server::new_async().await;

        let _locations = server
            .mock("GET", "/settings/location_groups.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"location_group":{"id":9,"city":"London","country":"UK"}},{"location_group":{"id":10,"city":"Dallas","country":"US"}}]"#,
            )
            .create_async()
            .await;

        let location = provider(&server).find_location("US (Dallas)").await.unwrap();
        assert_eq!(location.id, 10);

        let err = provider(&server)
            .find_location("FR (Paris)")
            .await
            .unwrap_err();
        match err {
            Error::NotFound { resource, lookup } => {
                assert_eq!(resource, "location");
                assert_eq!(lookup, "FR (Paris)");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
