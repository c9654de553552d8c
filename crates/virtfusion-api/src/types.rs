use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Package {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateGroup {
    #[serde(default)]
    pub templates: Vec<Template>,
}

/// An OS template. Callers may refer to one by id, `name version` or
/// `name version variant`.
#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Template {
    pub fn name_version(&self) -> String {
        format!("{} {}", self.name, self.version.as_deref().unwrap_or_default())
    }

    pub fn full_name(&self) -> String {
        format!(
            "{} {} {}",
            self.name,
            self.version.as_deref().unwrap_or_default(),
            self.variant.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshKey {
    pub id: i64,
    #[serde(default)]
    pub enabled: bool,
}

/// VNC endpoint details from `POST /servers/{id}/vnc`.
#[derive(Debug, Clone, Deserialize)]
pub struct VncDetails {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Login tokens from the server authentication tokens endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticationTokens {
    pub endpoint_complete: String,
}
