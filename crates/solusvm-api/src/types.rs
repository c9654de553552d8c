use serde::Deserialize;

/// A plan object as returned by `list-plans`.
#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub cpus: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub ram: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub disk: Option<String>,
}

/// Merged `vserver-infoall` + `vserver-info` response.
///
/// The master reports numbers and sizes as strings; they are kept raw so the
/// plan reverse-lookup can compare them exactly as reported.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    #[serde(deserialize_with = "de::string")]
    pub vserverid: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ipaddress: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default, rename = "type")]
    pub virtualization_type: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub cpus: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub memory: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub hdd: Option<String>,
}

/// Serial console session details from `vserver-console`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSession {
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub consoleusername: Option<String>,
    #[serde(default)]
    pub consoleip: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub consoleport: Option<String>,
    #[serde(default)]
    pub consolepassword: Option<String>,
    #[serde(default, deserialize_with = "de::opt_i64")]
    pub sessionexpire: Option<i64>,
}

pub(crate) mod de {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// The master is inconsistent about numbers vs strings; accept both.
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

    pub fn opt_i64<'de, D>(d: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }))
    }
}
