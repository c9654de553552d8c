//! Linode adapter.
//!
//! Images, instance types and regions are resolved by id first when the
//! input looks like one, falling through to an exact label scan of the full
//! catalog on a vendor 404.

use async_trait::async_trait;
use tracing::info;

use crate::types::{
    format_timestamp, generate_password, ChangeRootPasswordParams, ConnectionResult, CreateParams,
    EmptyResult, ReinstallParams, ResizeParams, ServerIdentifier, ServerInfoResult,
};
use crate::{Error, ProviderName, Result, ServerProvider};
use linode_api::{CreateInstanceRequest, Image, Instance, InstanceType, LinodeClient, RebuildRequest, Region};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LinodeConfig {
    pub access_token: String,
}

/// Linode adapter. Delegates to `linode_api::LinodeClient` for all HTTP
/// calls.
pub struct LinodeProvider {
    client: LinodeClient,
}

impl LinodeProvider {
    pub fn new(config: LinodeConfig) -> Result<Self> {
        let client = LinodeClient::new(config.access_token)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { client })
    }

    /// Create from env vars: `LINODE_ACCESS_TOKEN` (required).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let access_token = std::env::var("LINODE_ACCESS_TOKEN")
            .map_err(|_| Error::Config("LINODE_ACCESS_TOKEN is not set".into()))?;

        Self::new(LinodeConfig { access_token })
    }

    fn server_info(server: &Instance) -> ServerInfoResult {
        ServerInfoResult {
            instance_id: server.id.to_string(),
            state: server.status.clone(),
            label: server.label.clone(),
            hostname: None,
            ip_address: server.ipv4.first().cloned(),
            image: server.image.clone().unwrap_or_else(|| "unknown".into()),
            size: server.type_id.clone(),
            location: server.region.clone(),
            virtualization_type: Some(
                server.hypervisor.clone().unwrap_or_else(|| "unknown".into()),
            ),
            created_at: server.created.as_deref().and_then(format_timestamp),
            updated_at: server.updated.as_deref().and_then(format_timestamp),
            message: format!("Server is {}", server.status.replace('_', " ")),
            ..Default::default()
        }
    }

    async fn find_server(&self, instance_id: &str) -> Result<Instance> {
        let id: u64 = instance_id
            .parse()
            .map_err(|_| Error::not_found("server", instance_id))?;

        self.client
            .get_instance(id)
            .await
            .map_err(|e| op_error("Get server info", e))
    }

    async fn find_image(&self, name: &str) -> Result<Image> {
        if looks_like_image_id(name) {
            match self.client.get_image(name).await {
                Ok(image) => return Ok(image),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(op_error("Find image", e)),
            }
        }

        let images = self
            .client
            .list_images()
            .await
            .map_err(|e| op_error("Find image", e))?;

        images
            .into_iter()
            .find(|image| image.label == name)
            .ok_or_else(|| Error::not_found("image", name))
    }

    async fn find_type(&self, name: &str) -> Result<InstanceType> {
        if name.is_empty() {
            return Err(Error::denied("Size parameter is required"));
        }

        if looks_like_type_id(name) {
            match self.client.get_type(name).await {
                Ok(instance_type) => return Ok(instance_type),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(op_error("Find type", e)),
            }
        }

        // filtering by label is not supported server-side; scan all types
        let types = self
            .client
            .list_types()
            .await
            .map_err(|e| op_error("Find type", e))?;

        types
            .into_iter()
            .find(|instance_type| instance_type.label == name)
            .ok_or_else(|| Error::not_found("type", name))
    }

    async fn find_region(&self, id: &str) -> Result<Region> {
        match self.client.get_region(id).await {
            Ok(region) => Ok(region),
            Err(e) if e.is_not_found() => Err(Error::not_found("region", id)),
            Err(e) => Err(op_error("Find region", e)),
        }
    }
}

#[async_trait]
impl ServerProvider for LinodeProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Linode
    }

    async fn create(&self, params: &CreateParams) -> Result<ServerInfoResult> {
        params.validate()?;

        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let image = self.find_image(&params.image).await?;
        let instance_type = self.find_type(size).await?;
        let region = self.find_region(&params.location).await?;

        let root_pass = params
            .root_password
            .clone()
            .unwrap_or_else(|| generate_password(16));

        let server = self
            .client
            .create_instance(&CreateInstanceRequest {
                image: image.id,
                type_id: instance_type.id,
                region: region.id,
                root_pass,
                label: params.label.clone(),
            })
            .await
            .map_err(|e| op_error("Create server", e))?;

        info!(server_id = server.id, "linode: server created");

        Ok(Self::server_info(&server).with_message("Server created"))
    }

    async fn get_info(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Ok(Self::server_info(&self.find_server(&params.instance_id).await?))
    }

    async fn get_connection(&self, params: &ServerIdentifier) -> Result<ConnectionResult> {
        let server = self.find_server(&params.instance_id).await?;

        let ip = server
            .ipv4
            .first()
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
        let server = self.find_server(&params.instance_id).await?;

        let disks = self
            .client
            .list_disks(server.id)
            .await
            .map_err(|e| op_error("List server disks", e))?;

        let disk = disks
            .into_iter()
            .find(|disk| disk.filesystem != "swap")
            .ok_or_else(|| Error::api("No disks available"))?;

        self.client
            .reset_disk_password(server.id, disk.id, &params.root_password)
            .await
            .map_err(|e| op_error("Update root password", e))?;

        info!(server_id = server.id, "linode: root password changed");

        Ok(Self::server_info(&self.find_server(&params.instance_id).await?)
            .with_message("Root password changed"))
    }

    async fn resize(&self, params: &ResizeParams) -> Result<ServerInfoResult> {
        let size = params
            .size
            .as_deref()
            .ok_or_else(|| Error::denied("Size parameter is required"))?;

        let instance_type = self.find_type(size).await?;

        let server = self.find_server(&params.instance_id).await?;
        if !params.resize_running && server.status == "running" {
            return Err(Error::denied(
                "Resize not available while server is running",
            ));
        }

        self.client
            .resize_instance(server.id, &instance_type.id)
            .await
            .map_err(|e| op_error("Resize server", e))?;

        info!(server_id = server.id, size = %size, "linode: server resizing");

        Ok(Self::server_info(&self.find_server(&params.instance_id).await?)
            .with_message("Server is resizing"))
    }

    async fn reinstall(&self, params: &ReinstallParams) -> Result<ServerInfoResult> {
        let server = self.find_server(&params.instance_id).await?;
        let image = self.find_image(&params.image).await?;

        let root_pass = params
            .root_password
            .clone()
            .unwrap_or_else(|| generate_password(16));

        self.client
            .rebuild_instance(
                server.id,
                &RebuildRequest {
                    image: image.id,
                    root_pass,
                },
            )
            .await
            .map_err(|e| op_error("Rebuild server", e))?;

        info!(server_id = server.id, "linode: server rebuilding");

        Ok(Self::server_info(&self.find_server(&params.instance_id).await?)
            .with_message("Server is rebuilding"))
    }

    async fn reboot(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let server = self.find_server(&params.instance_id).await?;

        self.client
            .reboot_instance(server.id)
            .await
            .map_err(|e| op_error("Reboot server", e))?;

        Ok(Self::server_info(&self.find_server(&params.instance_id).await?)
            .with_message("Server is rebooting"))
    }

    async fn shutdown(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let server = self.find_server(&params.instance_id).await?;

        self.client
            .shutdown_instance(server.id)
            .await
            .map_err(|e| op_error("Shutdown server", e))?;

        Ok(Self::server_info(&self.find_server(&params.instance_id).await?)
            .with_message("Server is shutting down"))
    }

    async fn power_on(&self, params: &ServerIdentifier) -> Result<ServerInfoResult> {
        let server = self.find_server(&params.instance_id).await?;

        // "already booted" is success as far as callers are concerned
        let message = match self.client.boot_instance(server.id).await {
            Ok(()) => "Server is booting",
            Err(e) if e.to_string().contains("already booted") => "Server already running",
            Err(e) => return Err(op_error("Boot server", e)),
        };

        Ok(Self::server_info(&self.find_server(&params.instance_id).await?).with_message(message))
    }

    async fn terminate(&self, params: &ServerIdentifier) -> Result<EmptyResult> {
        let server = self.find_server(&params.instance_id).await?;

        self.client
            .delete_instance(server.id)
            .await
            .map_err(|e| op_error("Delete server", e))?;

        info!(server_id = server.id, "linode: server deleted");

        Ok(EmptyResult::with_message("Server permanently deleted"))
    }
}

fn op_error(operation: &str, e: linode_api::Error) -> Error {
    match e {
        linode_api::Error::Api {
            status,
            message,
            body,
            ..
        } => Error::Api {
            message: format!(
                "{operation} failed: [API Error] {}",
                neutralize_vendor_terms(&message)
            ),
            status: Some(status),
            data: serde_json::json!({ "error_code": status }),
            debug: Some(body),
        },
        linode_api::Error::Request(e) if e.is_connect() || e.is_timeout() => {
            Error::connection(e.to_string())
        }
        linode_api::Error::Request(e) => Error::Api {
            message: format!("{operation} failed: {e}"),
            status: e.status().map(|s| s.as_u16()),
            data: serde_json::Value::Null,
            debug: None,
        },
    }
}

/// Vendor error text names "linode <id>"; results should stay
/// vendor-neutral, so rewrite those references to "server".
fn neutralize_vendor_terms(message: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut skip_number = false;

    for word in message.split_whitespace() {
        if skip_number {
            skip_number = false;
            let stripped = word.trim_end_matches(['.', ',']);
            if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
        }

        if word.eq_ignore_ascii_case("linode") {
            words.push("server".into());
            skip_number = true;
        } else {
            words.push(word.to_string());
        }
    }

    let joined = words.join(" ");
    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => joined,
    }
}

/// Image ids look like `linux/alpine3.19`.
fn looks_like_image_id(name: &str) -> bool {
    match name.split_once('/') {
        Some((vendor, rest)) => {
            !vendor.is_empty()
                && vendor.chars().all(|c| c.is_ascii_lowercase())
                && !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        }
        None => false,
    }
}

/// Type ids look like `g6-standard-2`.
fn looks_like_type_id(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(server: &mockito::ServerGuard) -> LinodeProvider {
        LinodeProvider {
            client: LinodeClient::with_base_url("test-token", server.url()).unwrap(),
        }
    }

    #[test]
    fn vendor_terms_are_neutralized() {
        assert_eq!(
            neutralize_vendor_terms("Linode 123 already booted."),
            "Server already booted."
        );
        assert_eq!(
            neutralize_vendor_terms("linode busy, try later"),
            "Server busy, try later"
        );
    }

    #[test]
    fn id_shapes_are_recognized() {
        assert!(looks_like_image_id("linux/alpine3.19"));
        assert!(!looks_like_image_id("Ubuntu 20.04"));
        assert!(!looks_like_image_id("ubuntu-20.04"));

        assert!(looks_like_type_id("g6-standard-2"));
        assert!(!looks_like_type_id("Linode 4GB"));
    }

    #[tokio::test]
    async fn create_without_size_or_specs_is_rejected_before_any_call() {
        let mut server = mockito::Server::new_async().await;

        let catchall = server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let result = provider(&server)
            .create(&CreateParams {
                email: "a@b.com".into(),
                label: "web1".into(),
                location: "lon1".into(),
                image: "ubuntu-20.04".into(),
                memory_mb: Some(1024), // partial triplet only
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(Error::Denied(_))));
        catchall.assert_async().await;
    }

    #[tokio::test]
    async fn resize_running_server_is_refused_before_any_mutation() {
        let mut server = mockito::Server::new_async().await;

        let _type_mock = server
            .mock("GET", "/linode/types/g6-standard-2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"g6-standard-2","label":"Linode 4GB"}"#)
            .create_async()
            .await;

        let _instance_mock = server
            .mock("GET", "/linode/instances/123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":123,"label":"web1","status":"running","region":"eu-west","type":"g6-nanode-1","image":"linode/ubuntu20.04","ipv4":["1.2.3.4"]}"#,
            )
            .create_async()
            .await;

        let resize_mock = server
            .mock("POST", "/linode/instances/123/resize")
            .expect(0)
            .create_async()
            .await;

        let result = provider(&server)
            .resize(&ResizeParams {
                instance_id: "123".into(),
                size: Some("g6-standard-2".into()),
                resize_running: false,
                ..Default::default()
            })
            .await;

        match result {
            Err(Error::Denied(message)) => {
                assert!(message.contains("while server is running"));
            }
            other => panic!("expected Denied, got {other:?}"),
        }
        resize_mock.assert_async().await;
    }

    #[tokio::test]
    async fn power_on_already_booted_is_benign() {
        let mut server = mockito::Server::new_async().await;

        let _instance_mock = server
            .mock("GET", "/linode/instances/123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":123,"label":"web1","status":"running","region":"eu-west","type":"g6-nanode-1","image":"linode/ubuntu20.04","ipv4":["1.2.3.4"]}"#,
            )
            .create_async()
            .await;

        let _boot_mock = server
            .mock("POST", "/linode/instances/123/boot")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"errors":[{"reason":"Linode 123 already booted."}]}"#)
            .create_async()
            .await;

        let info = provider(&server)
            .power_on(&ServerIdentifier::new("123"))
            .await
            .unwrap();

        assert_eq!(info.message, "Server already running");
        assert_eq!(info.state, "running");
    }

    #[tokio::test]
    async fn create_resolves_catalogs_and_normalizes_the_result() {
        let mut server = mockito::Server::new_async().await;

        // image label is not id-shaped, so the full catalog is scanned
        let _images_mock = server
            .mock("GET", "/images")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"id":"linode/ubuntu20.04","label":"ubuntu-20.04"}],"page":1,"pages":1,"results":1}"#,
            )
            .create_async()
            .await;

        // "2gb" is id-shaped; the direct lookup 404s and falls through
        let _type_miss = server
            .mock("GET", "/linode/types/2gb")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"errors":[{"reason":"Not found"}]}"#)
            .create_async()
            .await;

        let _types_mock = server
            .mock("GET", "/linode/types")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"id":"g6-standard-1","label":"2gb"}],"page":1,"pages":1,"results":1}"#,
            )
            .create_async()
            .await;

        let _region_mock = server
            .mock("GET", "/regions/lon1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"lon1"}"#)
            .create_async()
            .await;

        let _create_mock = server
            .mock("POST", "/linode/instances")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":123,"label":"web1","status":"new","region":"lon1","type":"g6-standard-1","image":"linode/ubuntu20.04","ipv4":["1.2.3.4"],"created":"2024-03-01T12:30:45","updated":"2024-03-01T12:30:45"}"#,
            )
            .create_async()
            .await;

        let info = provider(&server)
            .create(&CreateParams {
                email: "a@b.com".into(),
                label: "web1".into(),
                location: "lon1".into(),
                image: "ubuntu-20.04".into(),
                size: Some("2gb".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(info.instance_id, "123");
        assert_eq!(info.state, "new");
        assert_eq!(info.size.as_deref(), Some("g6-standard-1"));
        assert_eq!(info.ip_address.as_deref(), Some("1.2.3.4"));
        assert_eq!(info.created_at.as_deref(), Some("2024-03-01 12:30:45"));
        assert!(info.message.contains("created"));
    }

    #[tokio::test]
    async fn unknown_image_resolution_carries_the_lookup() {
        let mut server = mockito::Server::new_async().await;

        let _images_mock = server
            .mock("GET", "/images")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[],"page":1,"pages":1,"results":0}"#)
            .create_async()
            .await;

        let err = provider(&server).find_image("no-such-image").await.unwrap_err();

        match err {
            Error::NotFound { resource, lookup } => {
                assert_eq!(resource, "image");
                assert_eq!(lookup, "no-such-image");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
