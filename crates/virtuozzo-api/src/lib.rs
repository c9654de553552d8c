//! Client for the Virtuozzo Hybrid Server 7 agent protocol.
//!
//! The agent listens on a raw TCP socket and exchanges null-byte-terminated,
//! namespaced XML packets. Each API call is one connection carrying a login
//! envelope followed by a single command. Responses are parsed with a
//! namespace-aware parser and addressed by local element name, since the
//! agent varies its namespace prefixes between interfaces.

mod socket;
mod xml;

pub use socket::SocketClient;
pub use xml::XmlCommand;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub const DEFAULT_PORT: u16 = 4433;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("agent connection error: {message}")]
    Connect { message: String },

    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent api error: {message}")]
    Api { message: String, body: String },

    #[error("unparseable agent response")]
    Unparseable { body: String },

    #[error("empty agent response")]
    Empty,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Normalized server details from a `get_info` exchange.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub eid: String,
    /// Raw numeric state code; see [`state_label`].
    pub state_code: String,
    pub name: String,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub os_name: Option<String>,
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub disk_mb: u32,
    pub home_path: Option<String>,
    /// The interface that answered, e.g. `vzpenvm`.
    pub virtualization_type: Option<String>,
}

/// Translate a numeric environment state to its label. Undefined codes are
/// reported as `unknown`.
pub fn state_label(code: &str) -> &'static str {
    match code {
        "0" => "unknown",
        "1" => "non-existent",
        "2" => "config",
        "3" => "down",
        "4" => "mounted",
        "5" => "suspended",
        "6" => "running",
        "7" => "repairing",
        "8" => "license violation",
        _ => "unknown",
    }
}

/// Client for one Virtuozzo agent endpoint.
pub struct VirtuozzoClient {
    username: String,
    password: String,
    interface: String,
    socket: SocketClient,
}

impl VirtuozzoClient {
    pub fn new(
        hostname: &str,
        port: Option<u16>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Option<u64>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            interface: "vzpenvm".to_string(),
            socket: SocketClient::new(
                hostname,
                port.unwrap_or(DEFAULT_PORT),
                Duration::from_secs(timeout.unwrap_or(120)),
            ),
        }
    }

    /// Use another target interface (virtualization type) for commands.
    pub fn set_interface(&mut self, interface: impl Into<String>) {
        self.interface = interface.into();
    }

    fn command(&self) -> XmlCommand {
        XmlCommand::with_interface(self.interface.clone())
    }

    fn login_packet(&self) -> String {
        self.command().login(
            &BASE64.encode(&self.username),
            &BASE64.encode(&self.password),
        )
    }

    /// Run one command exchange and return the checked response body.
    async fn roundtrip(&self, command: &str) -> Result<String> {
        let exchange = self.socket.exchange(&self.login_packet(), command).await?;

        check_packet(&exchange.login_ack)?;
        check_packet(&exchange.response)?;

        Ok(exchange.response)
    }

    /// Create an environment and return its eid. An explicit `interface`
    /// overrides the client default (the agent partitions environments by
    /// virtualization interface).
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        interface: Option<&str>,
        label: &str,
        home_path: &str,
        image: &str,
        platform: &str,
        memory_mb: u32,
        cpu_count: u32,
        disk_mb: u32,
    ) -> Result<String> {
        let command = match interface {
            Some(interface) => XmlCommand::with_interface(interface),
            None => self.command(),
        };
        let request =
            command.create_server(label, home_path, image, platform, memory_mb, cpu_count, disk_mb);
        let response = self.roundtrip(&request).await?;

        let doc = parse(&response)?;
        find_text(doc.root_element(), "eid")
            .map(str::to_string)
            .ok_or(Error::Empty)
    }

    pub async fn install_tools(&self, server_id: &str) -> Result<()> {
        let request = self.command().install_tools(server_id);
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub async fn get_server_info(&self, server_id: &str) -> Result<ServerInfo> {
        let request = self.command().server_info(server_id);
        let response = self.roundtrip(&request).await?;

        let doc = parse(&response)?;
        let root = doc.root_element();

        let origin = find_text(root, "origin").map(str::to_string);

        let Some(env) = root
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "env")
        else {
            return Err(Error::Empty);
        };

        let state_code = env
            .children()
            .find(|n| n.tag_name().name() == "status")
            .and_then(|status| child_text(status, "state"))
            .unwrap_or("0")
            .to_string();

        let Some(config) = env
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "virtual_config")
        else {
            return Err(Error::Empty);
        };

        let os_name = config
            .children()
            .find(|n| n.tag_name().name() == "os_template")
            .and_then(|os| child_text(os, "name"))
            .map(str::to_string);

        let ip_address = config
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "ip")
            .and_then(|n| n.text())
            .map(str::to_string);

        let disk_mb = config
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "device")
            .find_map(|device| child_text(device, "size"))
            .and_then(|size| size.parse().ok())
            .unwrap_or(0);

        Ok(ServerInfo {
            eid: child_text(env, "eid").unwrap_or("Unknown").to_string(),
            state_code,
            name: child_text(config, "name").unwrap_or("Unknown").to_string(),
            hostname: child_text(config, "hostname").map(str::to_string),
            ip_address,
            os_name,
            memory_mb: parse_number(child_text(config, "memory_size")),
            cpu_count: parse_number(child_text(config, "cpu_count")),
            disk_mb,
            home_path: child_text(config, "home_path").map(str::to_string),
            virtualization_type: origin,
        })
    }

    pub async fn change_password(&self, server_id: &str, password: &str) -> Result<()> {
        let request = self
            .command()
            .set_root_password(server_id, &BASE64.encode(password));
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub async fn resize(
        &self,
        server_id: &str,
        memory_mb: u32,
        cpu_count: u32,
        disk_mb: u32,
    ) -> Result<()> {
        let request = self
            .command()
            .set_server_config(server_id, memory_mb, cpu_count, disk_mb);
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub async fn set_image(&self, server_id: &str, image: &str, platform: &str) -> Result<()> {
        let request = self.command().set_server_image(server_id, image, platform);
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub async fn restart(&self, server_id: &str) -> Result<()> {
        let request = self.command().restart_server(server_id);
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub async fn stop(&self, server_id: &str) -> Result<()> {
        let request = self.command().stop_server(server_id);
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub async fn start(&self, server_id: &str) -> Result<()> {
        let request = self.command().start_server(server_id);
        self.roundtrip(&request).await?;
        Ok(())
    }

    pub async fn destroy(&self, server_id: &str) -> Result<()> {
        let request = self.command().destroy_server(server_id);
        self.roundtrip(&request).await?;
        Ok(())
    }
}

fn parse(body: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(body).map_err(|_| Error::Unparseable {
        body: body.to_string(),
    })
}

/// Reject packets carrying system error messages or an env-level error.
fn check_packet(body: &str) -> Result<()> {
    let doc = parse(body)?;
    let root = doc.root_element();

    let system_errors: Vec<String> = root
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "message")
        .filter_map(|n| n.text())
        .filter(|text| text.contains("System errors"))
        .map(str::to_string)
        .collect();

    if !system_errors.is_empty() {
        return Err(Error::Api {
            message: format!("Provider API Error: {}", system_errors.join(", ")),
            body: body.to_string(),
        });
    }

    if let Some(error) = root
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "error")
    {
        let message = child_text(error, "message")
            .or_else(|| error.text())
            .unwrap_or("Unknown agent error");
        return Err(Error::Api {
            message: message.to_string(),
            body: body.to_string(),
        });
    }

    Ok(())
}

fn find_text<'a>(root: roxmltree::Node<'a, 'a>, name: &str) -> Option<&'a str> {
    root.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
}

fn child_text<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
}

fn parse_number(text: Option<&str>) -> u32 {
    text.and_then(|t| t.trim().parse().ok()).unwrap_or(0)
}
