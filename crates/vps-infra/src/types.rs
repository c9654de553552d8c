//! Canonical request/result shapes shared by every provider adapter.
//!
//! All records are built fresh per call; nothing here persists. Vendors
//! disagree on almost every field, so optional data stays `Option` rather
//! than being defaulted away.

use chrono::{DateTime, NaiveDateTime};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Canonical timestamp format for `created_at`/`updated_at`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Explicit resource triplet, used where a vendor has no named sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpecs {
    pub memory_mb: u32,
    pub cpu_cores: u32,
    pub disk_mb: u32,
}

/// Parameters for provisioning a new server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateParams {
    pub customer_identifier: Option<String>,
    pub email: String,
    pub label: String,
    /// DC/region/node/server-group, depending on the provider.
    pub location: String,
    /// Image/template name or id.
    pub image: String,
    /// Named size/plan; alternative to the explicit triplet.
    pub size: Option<String>,
    pub memory_mb: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub disk_mb: Option<u32>,
    pub root_password: Option<String>,
    pub virtualization_type: Option<String>,
}

impl CreateParams {
    /// Either a named size or the full explicit triplet is required.
    pub fn validate(&self) -> Result<()> {
        if self.size.is_none() && self.specs().is_none() {
            return Err(Error::denied(
                "either size or all of memory_mb, cpu_cores and disk_mb are required",
            ));
        }
        Ok(())
    }

    pub fn specs(&self) -> Option<ServerSpecs> {
        Some(ServerSpecs {
            memory_mb: self.memory_mb?,
            cpu_cores: self.cpu_cores?,
            disk_mb: self.disk_mb?,
        })
    }
}

/// Canonical description of a server, as last observed at the vendor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerInfoResult {
    /// Vendor-opaque instance identifier.
    pub instance_id: String,
    /// Vendor state vocabulary, passed through after normalization.
    pub state: String,
    pub label: String,
    pub hostname: Option<String>,
    /// May be absent until the vendor has provisioned networking.
    pub ip_address: Option<String>,
    pub image: String,
    pub size: Option<String>,
    pub specs: Option<ServerSpecs>,
    pub location: String,
    pub node: Option<String>,
    pub virtualization_type: Option<String>,
    pub customer_identifier: Option<String>,
    pub suspended: Option<bool>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    /// Human-readable outcome, e.g. "Server is resizing".
    pub message: String,
}

impl ServerInfoResult {
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_suspended(mut self, suspended: bool) -> Self {
        self.suspended = Some(suspended);
        self
    }

    pub fn with_customer_identifier(mut self, id: impl Into<String>) -> Self {
        self.customer_identifier = Some(id.into());
        self
    }
}

/// VNC endpoint details; either a websocket URL or host/port/password.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VncConnection {
    pub websocket_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// How a caller connects to a provisioned server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionResult {
    /// An `ssh user@host` command, optionally with a transient password.
    Ssh {
        command: String,
        password: Option<String>,
        expires_at: Option<String>,
        message: String,
    },
    Vnc {
        connection: VncConnection,
        message: String,
    },
    /// In-browser access via a redirect URL (e.g. panel SSO).
    Redirect { url: String, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResizeParams {
    pub instance_id: String,
    /// Named size/plan; alternative to the explicit triplet.
    pub size: Option<String>,
    pub memory_mb: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub disk_mb: Option<u32>,
    /// Allow resizing a running server. Off by default.
    #[serde(default)]
    pub resize_running: bool,
}

impl ResizeParams {
    pub fn specs(&self) -> Option<ServerSpecs> {
        Some(ServerSpecs {
            memory_mb: self.memory_mb?,
            cpu_cores: self.cpu_cores?,
            disk_mb: self.disk_mb?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinstallParams {
    pub instance_id: String,
    pub image: String,
    pub root_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRootPasswordParams {
    pub instance_id: String,
    pub root_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentifier {
    pub instance_id: String,
}

impl ServerIdentifier {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }
}

/// Result of operations with no payload beyond their outcome message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmptyResult {
    pub message: String,
}

impl EmptyResult {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Normalize a vendor timestamp to [`TIMESTAMP_FORMAT`], if parseable.
pub fn format_timestamp(raw: &str) -> Option<String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.format(TIMESTAMP_FORMAT).to_string());
    }

    for pattern in ["%Y-%m-%dT%H:%M:%S", TIMESTAMP_FORMAT] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(parsed.format(TIMESTAMP_FORMAT).to_string());
        }
    }

    None
}

/// Random root password for vendors that require one at create time.
/// Guaranteed to contain an upper, a lower and a digit.
pub fn generate_password(length: usize) -> String {
    const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
    const LOWER: &[u8] = b"abcdefghjkmnpqrstuvwxyz";
    const DIGITS: &[u8] = b"23456789";

    let length = length.max(8);
    let mut rng = rand::thread_rng();
    let all: Vec<u8> = [UPPER, LOWER, DIGITS].concat();

    let mut password: Vec<u8> = vec![
        UPPER[rng.gen_range(0..UPPER.len())],
        LOWER[rng.gen_range(0..LOWER.len())],
        DIGITS[rng.gen_range(0..DIGITS.len())],
    ];
    while password.len() < length {
        password.push(all[rng.gen_range(0..all.len())]);
    }
    password.shuffle(&mut rng);

    String::from_utf8_lossy(&password).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_params_require_size_or_full_triplet() {
        let mut params = CreateParams {
            email: "a@b.com".into(),
            label: "web1".into(),
            location: "lon1".into(),
            image: "ubuntu-20.04".into(),
            ..Default::default()
        };
        assert!(params.validate().is_err());

        params.memory_mb = Some(1024);
        params.cpu_cores = Some(2);
        assert!(params.validate().is_err(), "partial triplet is not enough");

        params.disk_mb = Some(10240);
        assert!(params.validate().is_ok());

        params.memory_mb = None;
        params.size = Some("2gb".into());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn timestamps_normalize_to_one_format() {
        assert_eq!(
            format_timestamp("2024-03-01T12:30:45").as_deref(),
            Some("2024-03-01 12:30:45")
        );
        assert_eq!(
            format_timestamp("2024-03-01T12:30:45+02:00").as_deref(),
            Some("2024-03-01 12:30:45")
        );
        assert_eq!(
            format_timestamp("2024-03-01 12:30:45").as_deref(),
            Some("2024-03-01 12:30:45")
        );
        assert_eq!(format_timestamp("yesterday"), None);
    }

    #[test]
    fn generated_passwords_cover_required_classes() {
        for _ in 0..16 {
            let password = generate_password(16);
            assert_eq!(password.len(), 16);
            assert!(password.chars().any(|c| c.is_ascii_uppercase()));
            assert!(password.chars().any(|c| c.is_ascii_lowercase()));
            assert!(password.chars().any(|c| c.is_ascii_digit()));
        }
    }
}
