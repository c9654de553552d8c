use serde::{Deserialize, Serialize};

// ── Instances ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub label: String,
    pub status: String,
    pub region: String,
    #[serde(rename = "type")]
    pub type_id: Option<String>,
    pub image: Option<String>,
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub ipv4: Vec<String>,
    pub created: Option<String>,
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateInstanceRequest {
    pub image: String,
    #[serde(rename = "type")]
    pub type_id: String,
    pub region: String,
    pub root_pass: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildRequest {
    pub image: String,
    pub root_pass: String,
}

// ── Catalogs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceType {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Disk {
    pub id: u64,
    pub label: String,
    pub filesystem: String,
}

/// Envelope for paginated list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub pages: u32,
}
