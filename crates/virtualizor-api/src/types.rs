use serde::Deserialize;
use serde_json::Value;

/// A virtual server record from `act=editvs`.
#[derive(Debug, Clone, Deserialize)]
pub struct Vps {
    #[serde(deserialize_with = "de::string")]
    pub vpsid: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub vps_name: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub plid: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub serid: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub virt: Option<String>,
    #[serde(default)]
    pub ips: Value,
    #[serde(default)]
    pub stats: Option<VpsStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VpsStats {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub status: Option<String>,
}

impl Vps {
    /// The panel reports IPs either as an `ipid => ip` map or a plain list.
    pub fn first_ip(&self) -> Option<String> {
        match &self.ips {
            Value::Object(map) => map.values().next().and_then(|v| v.as_str()).map(String::from),
            Value::Array(list) => list.first().and_then(|v| v.as_str()).map(String::from),
            _ => None,
        }
    }
}

/// Full `act=editvs` payload: the server plus the catalogs the panel inlines.
#[derive(Debug, Clone, Deserialize)]
pub struct AllServerInfo {
    pub vps: Vps,
    #[serde(default)]
    pub plans: Value,
    #[serde(default)]
    pub servers: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    #[serde(deserialize_with = "de::string")]
    pub plid: String,
    pub plan_name: String,
    #[serde(default)]
    pub virt: Option<String>,
}

/// A slave/host server record from `act=servers`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostServer {
    #[serde(deserialize_with = "de::string")]
    pub serid: String,
    pub server_name: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerGroup {
    #[serde(deserialize_with = "de::string")]
    pub sgid: String,
    pub sg_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsTemplate {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub osid: Option<String>,
    pub name: String,
}

/// VNC details from `act=vnc`.
#[derive(Debug, Clone, Deserialize)]
pub struct VncInfo {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub port: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// New virtual server parameters for `act=addvs`.
#[derive(Debug, Clone)]
pub struct CreateServerRequest {
    pub virtualization_type: String,
    pub plan_id: String,
    pub os_id: String,
    pub server_group_id: Option<String>,
    pub server_id: Option<String>,
    pub hostname: String,
    pub email: String,
    pub password: String,
}

pub(crate) mod de {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// The panel is inconsistent about numbers vs strings; accept both.
    pub fn string<'de, D>(d: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(d)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "expected string or number, got {other}"
            ))),
        }
    }

    pub fn opt_string<'de, D>(d: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.and_then(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }))
    }
}
