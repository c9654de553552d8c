use serde::{Deserialize, Serialize};

/// A virtual machine record, unwrapped from `{"virtual_machine": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachine {
    pub identifier: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub booted: Option<bool>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub memory: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub cpus: Option<u64>,
    #[serde(default)]
    pub template_label: Option<String>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub hypervisor_id: Option<u64>,
    #[serde(default)]
    pub hypervisor_type: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressEntry>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub initial_root_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpAddressEntry {
    pub ip_address: IpAddress,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpAddress {
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Disk {
    pub id: u64,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub disk_size: Option<u64>,
    #[serde(default)]
    pub is_swap: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    pub id: u64,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationGroup {
    pub id: u64,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl LocationGroup {
    /// The display name locations are matched against: `Country (City)`.
    pub fn display_name(&self) -> String {
        format!(
            "{} ({})",
            self.country.as_deref().unwrap_or_default(),
            self.city.as_deref().unwrap_or_default()
        )
    }
}

/// Body for `POST /virtual_machines.json`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateVirtualMachineRequest {
    pub cpu_shares: u32,
    pub hostname: String,
    pub label: String,
    pub template_id: u64,
    pub memory: u64,
    pub cpus: u64,
    pub primary_disk_size: u64,
    pub required_virtual_machine_build: u8,
    pub required_virtual_machine_startup: u8,
    pub location_id: u64,
    pub initial_root_password: Option<String>,
}

pub(crate) mod de {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Numeric fields sometimes arrive as strings; accept both.
    pub fn opt_u64<'de, D>(d: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }))
    }
}
