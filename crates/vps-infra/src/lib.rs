//! Vendor-agnostic interface for provisioning and managing virtual servers.
//!
//! Each supported control plane (Linode, SolusVM, Virtualizor, OnApp,
//! Virtuozzo, VirtFusion) implements [`ServerProvider`] by composing its
//! typed API client with resolver logic that maps human-supplied names or
//! ids onto vendor catalog entries. Every operation is a single best-effort
//! call against one external system; results and failures are normalized
//! into the shared shapes in [`types`] and [`error`].

pub mod error;
pub mod types;

pub mod linode;
pub mod onapp;
pub mod solusvm;
pub mod virtfusion;
pub mod virtualizor;
pub mod virtuozzo;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

pub use error::{Error, Result};
use types::{
    ChangeRootPasswordParams, ConnectionResult, CreateParams, EmptyResult, ReinstallParams,
    ResizeParams, ServerIdentifier, ServerInfoResult,
};

/// Known provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Linode,
    SolusVm,
    Virtualizor,
    OnApp,
    Virtuozzo,
    Virtfusion,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linode => "linode",
            Self::SolusVm => "solusvm",
            Self::Virtualizor => "virtualizor",
            Self::OnApp => "onapp",
            Self::Virtuozzo => "virtuozzo",
            Self::Virtfusion => "virtfusion",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linode" => Ok(Self::Linode),
            "solusvm" => Ok(Self::SolusVm),
            "virtualizor" => Ok(Self::Virtualizor),
            "onapp" => Ok(Self::OnApp),
            "virtuozzo" => Ok(Self::Virtuozzo),
            "virtfusion" => Ok(Self::Virtfusion),
            other => Err(Error::Config(format!("unknown provider: {other}"))),
        }
    }
}

/// The canonical server-operation contract every vendor adapter implements.
///
/// Adapters hold no state beyond their configuration and composed API
/// client; state decisions are made against a fresh vendor fetch on every
/// call. Operations a vendor cannot express return [`Error::Unsupported`]
/// without any vendor call being made.
#[async_trait]
pub trait ServerProvider: Send + Sync {
    /// Provider identifier.
    fn name(&self) -> ProviderName;

    /// Provision a new server and report its initial state.
    async fn create(&self, params: &CreateParams) -> Result<ServerInfoResult>;

    /// Fetch fresh state and metadata for a server.
    async fn get_info(&self, params: &ServerIdentifier) -> Result<ServerInfoResult>;

    /// Obtain connection details (SSH command, VNC or a login URL).
    async fn get_connection(&self, params: &ServerIdentifier) -> Result<ConnectionResult>;

    async fn change_root_password(
        &self,
        params: &ChangeRootPasswordParams,
    ) -> Result<ServerInfoResult>;

    /// Change a server's size. Refused for running servers unless
    /// `resize_running` is set, before any vendor mutation is attempted.
    async fn resize(&self, params: &ResizeParams) -> Result<ServerInfoResult>;

    /// Rebuild with a fresh image, resolved within the server's current
    /// virtualization type.
    async fn reinstall(&self, params: &ReinstallParams) -> Result<ServerInfoResult>;

    async fn reboot(&self, params: &ServerIdentifier) -> Result<ServerInfoResult>;

    /// Power off. Already-stopped servers return success without a vendor
    /// call.
    async fn shutdown(&self, params: &ServerIdentifier) -> Result<ServerInfoResult>;

    /// Power on. Already-running servers return success without a vendor
    /// call.
    async fn power_on(&self, params: &ServerIdentifier) -> Result<ServerInfoResult>;

    /// Permanently delete the server.
    async fn terminate(&self, params: &ServerIdentifier) -> Result<EmptyResult>;

    async fn suspend(&self, _params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Err(Error::Unsupported)
    }

    async fn unsuspend(&self, _params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Err(Error::Unsupported)
    }

    async fn attach_recovery_iso(&self, _params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Err(Error::Unsupported)
    }

    async fn detach_recovery_iso(&self, _params: &ServerIdentifier) -> Result<ServerInfoResult> {
        Err(Error::Unsupported)
    }
}

/// Registry of all configured providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn ServerProvider>>,
}

impl ProviderRegistry {
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn ServerProvider>> {
        self.providers.get(&name)
    }

    pub fn available(&self) -> Vec<ProviderName> {
        self.providers.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn insert(&mut self, provider: Arc<dyn ServerProvider>) {
        self.providers.insert(provider.name(), provider);
    }
}

/// Build every provider whose environment configuration is present.
///
/// Providers with missing configuration are skipped with a debug log.
/// Errors only if no provider could be constructed at all.
pub fn build_providers() -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let mut registry = ProviderRegistry::default();

    match linode::LinodeProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered Linode provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Linode provider: {e}"),
    }

    match solusvm::SolusVmProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered SolusVM provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping SolusVM provider: {e}"),
    }

    match virtualizor::VirtualizorProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered Virtualizor provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Virtualizor provider: {e}"),
    }

    match onapp::OnAppProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered OnApp provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping OnApp provider: {e}"),
    }

    match virtuozzo::VirtuozzoProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered Virtuozzo provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Virtuozzo provider: {e}"),
    }

    match virtfusion::VirtfusionProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered VirtFusion provider");
            registry.insert(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping VirtFusion provider: {e}"),
    }

    if registry.is_empty() {
        return Err(Error::Config(
            "no providers configured (set LINODE_ACCESS_TOKEN, SOLUSVM_HOSTNAME, \
             VIRTUALIZOR_HOSTNAME, ONAPP_HOSTNAME, VIRTUOZZO_HOSTNAME and/or \
             VIRTFUSION_HOSTNAME)"
                .into(),
        ));
    }

    Ok(registry)
}
