//! Client for the Virtualizor admin API.
//!
//! Calls are POSTs to `index.php` with the action and credentials in the
//! query string, including a rotating auth hash derived from a random nonce
//! and the API password, plus form-encoded mutation params in the body.
//! Catalog endpoints paginate with `page`/`reslen` until an empty page.

mod types;

pub use types::*;

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

const DEFAULT_PORT: u16 = 4085;
const PAGE_SIZE: u32 = 100;

/// Raw response bodies attached to errors are trimmed to this length.
const MAX_BODY_LEN: usize = 1000;

/// Response keys whose values are huge catalogs, redacted from error data.
const CONDENSED_KEYS: &[&str] = &[
    "vs",
    "vpses",
    "ostemplates",
    "scripts",
    "plans",
    "servers",
    "users",
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("virtualizor api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("virtualizor api {action}: {message}")]
    Api {
        action: String,
        status: u16,
        message: String,
        data: Value,
        body: String,
    },

    #[error("virtualizor api {action} returned an undecodable body")]
    Unparseable { action: String, body: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Request(e) => e.status().map(|s| s.as_u16()),
            Error::Unparseable { .. } => None,
        }
    }
}

/// Client for the Virtualizor admin API.
#[derive(Clone)]
pub struct VirtualizorClient {
    api_key: String,
    api_password: String,
    base_url: String,
    http: reqwest::Client,
}

impl VirtualizorClient {
    pub fn new(
        hostname: &str,
        port: Option<u16>,
        api_key: impl Into<String>,
        api_password: impl Into<String>,
    ) -> Result<Self> {
        let port = port.unwrap_or(DEFAULT_PORT);
        Self::with_base_url(format!("https://{hostname}:{port}"), api_key, api_password)
    }

    /// Client against a non-default endpoint (tests, reverse proxies).
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_password: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(15))
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            api_key: api_key.into(),
            api_password: api_password.into(),
            base_url: base_url.into(),
            http,
        })
    }

    /// Rotating request auth hash: an 8-char nonce concatenated with the
    /// md5 of the API password followed by that nonce.
    fn api_key_hash(&self) -> String {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();

        let digest = md5::compute(format!("{}{nonce}", self.api_password));
        format!("{nonce}{digest:x}")
    }

    /// Make an admin API call and return the decoded response data.
    pub async fn call(
        &self,
        act: &str,
        query: &[(&str, String)],
        post: &[(&str, String)],
    ) -> Result<Value> {
        let mut full_query: Vec<(&str, String)> = vec![
            ("api", "json".to_string()),
            ("act", act.to_string()),
            ("adminapikey", self.api_key.clone()),
            ("adminapipass", self.api_password.clone()),
            ("apikey", self.api_key_hash()),
        ];
        full_query.extend(query.iter().cloned());

        let resp = self
            .http
            .post(format!("{}/index.php", self.base_url))
            .query(&full_query)
            .form(&post)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await?;

        let data: Value = match serde_json::from_str(&body) {
            Ok(data) => data,
            Err(_) => {
                return Err(Error::Unparseable {
                    action: act.into(),
                    body: trim_body(body),
                });
            }
        };

        check_response(act, status, &data, &body)?;

        Ok(data)
    }

    // ── Virtual servers ──────────────────────────────────────────────

    /// Create a virtual server and return its id.
    pub async fn create_server(&self, req: &CreateServerRequest) -> Result<String> {
        let mut post = vec![
            ("virt", req.virtualization_type.clone()),
            ("plid", req.plan_id.clone()),
            ("osid", req.os_id.clone()),
            ("hostname", req.hostname.clone()),
            ("user_email", req.email.clone()),
            ("user_pass", req.password.clone()),
            ("rootpass", req.password.clone()),
            ("control_panel", "0".to_string()),
            ("addvps", "1".to_string()),
        ];

        match (&req.server_group_id, &req.server_id) {
            (Some(group_id), _) => {
                post.push(("node_select", "1".to_string()));
                post.push(("sgid", group_id.clone()));
            }
            (None, Some(server_id)) => {
                post.push(("node_select", "0".to_string()));
                post.push(("slave_server", server_id.clone()));
            }
            (None, None) => {
                post.push(("node_select", "0".to_string()));
            }
        }

        let data = self.call("addvs", &[], &post).await?;

        if !truthy(&data["done"]) {
            return Err(api_error(
                "addvs",
                "Virtual server creation unsuccessful",
                &data,
            ));
        }

        value_to_string(&data["vpsid"])
            .or_else(|| value_to_string(&data["done"]))
            .ok_or_else(|| Error::Unparseable {
                action: "addvs".into(),
                body: trim_body(data.to_string()),
            })
    }

    /// Run a power action: `start`, `stop`, `restart` or `poweroff`.
    pub async fn server_action(&self, vps_id: &str, action: &str) -> Result<Value> {
        let data = self
            .call(
                "vs",
                &[
                    ("vpsid", vps_id.to_string()),
                    ("action", action.to_string()),
                ],
                &[],
            )
            .await?;

        if !truthy(&data["done"]) {
            return Err(api_error(
                "vs",
                &format!("Virtual server {action} unsuccessful"),
                &data,
            ));
        }

        Ok(data)
    }

    /// Fetch the full record for a virtual server, including the plan and
    /// host server catalogs the panel inlines into the response.
    pub async fn get_all_info(&self, vps_id: &str) -> Result<AllServerInfo> {
        let data = self
            .call("editvs", &[("vpsid", vps_id.to_string())], &[])
            .await?;

        if data["vps"].is_null() || data["vps"] == Value::Bool(false) {
            return Err(api_error("editvs", "Virtual server not found", &data));
        }

        serde_json::from_value(data.clone()).map_err(|_| Error::Unparseable {
            action: "editvs".into(),
            body: trim_body(data.to_string()),
        })
    }

    pub async fn change_root_password(&self, vps_id: &str, password: &str) -> Result<Value> {
        let data = self
            .call(
                "managevps",
                &[("vpsid", vps_id.to_string())],
                &[
                    ("rootpass", password.to_string()),
                    ("enable_guest_agent", "1".to_string()),
                    ("editvps", "1".to_string()),
                ],
            )
            .await?;

        if data["done"]["change_pass_msg"].is_null() {
            return Err(api_error(
                "managevps",
                "Virtual server password change unsuccessful",
                &data,
            ));
        }

        Ok(data)
    }

    pub async fn change_plan(&self, vps_id: &str, plan_id: &str) -> Result<Value> {
        let data = self
            .call(
                "editvs",
                &[("vpsid", vps_id.to_string())],
                &[
                    ("plid", plan_id.to_string()),
                    ("editvps", "1".to_string()),
                ],
            )
            .await?;

        if !truthy(&data["done"]) {
            return Err(api_error(
                "editvs",
                "Virtual server plan change unsuccessful",
                &data,
            ));
        }

        Ok(data)
    }

    pub async fn rebuild(&self, vps_id: &str, os_id: &str, password: &str) -> Result<Value> {
        let data = self
            .call(
                "rebuild",
                &[("vpsid", vps_id.to_string())],
                &[
                    ("vpsid", vps_id.to_string()),
                    ("osid", os_id.to_string()),
                    ("newos", os_id.to_string()),
                    ("newpass", password.to_string()),
                    ("conf", password.to_string()),
                    ("control_panel", "0".to_string()),
                    ("reos", "1".to_string()),
                ],
            )
            .await?;

        if !truthy(&data["done"]) {
            return Err(api_error(
                "rebuild",
                "Virtual server rebuild unsuccessful",
                &data,
            ));
        }

        Ok(data)
    }

    pub async fn delete_server(&self, vps_id: &str) -> Result<Value> {
        let data = self
            .call("vs", &[("delete", vps_id.to_string())], &[])
            .await?;

        if !truthy(&data["done"]) {
            return Err(api_error(
                "vs",
                "Virtual server delete unsuccessful",
                &data,
            ));
        }

        Ok(data)
    }

    pub async fn vnc_info(&self, vps_id: &str) -> Result<VncInfo> {
        let data = self
            .call("vnc", &[("novnc", vps_id.to_string())], &[])
            .await?;

        serde_json::from_value(data["info"].clone()).map_err(|_| Error::Unparseable {
            action: "vnc".into(),
            body: trim_body(data.to_string()),
        })
    }

    // ── Catalogs ─────────────────────────────────────────────────────

    /// Find a plan by id or exact name, optionally pinned to a
    /// virtualization type. Pages through the catalog until an empty page.
    pub async fn find_plan(
        &self,
        plan_id: Option<&str>,
        plan_name: Option<&str>,
        virtualization_type: Option<&str>,
    ) -> Result<Option<Plan>> {
        if plan_id.is_none() && plan_name.is_none() {
            return Ok(None);
        }

        let mut post: Vec<(&str, String)> = Vec::new();
        if let Some(name) = plan_name {
            post.push(("planname", name.to_string()));
        }
        if let Some(virt) = virtualization_type {
            post.push(("ptype", virt.to_string()));
        }

        let mut page = 1u32;
        loop {
            let data = self
                .call(
                    "plans",
                    &[
                        ("page", page.to_string()),
                        ("reslen", PAGE_SIZE.to_string()),
                    ],
                    &post,
                )
                .await?;

            let plans = collect_values(&data["plans"]);
            if plans.is_empty() {
                return Ok(None);
            }

            for raw in plans {
                let Ok(plan) = serde_json::from_value::<Plan>(raw.clone()) else {
                    continue;
                };

                if let Some(id) = plan_id {
                    if plan.plid == id {
                        return Ok(Some(plan));
                    }
                } else if let Some(name) = plan_name {
                    if plan.plan_name == name {
                        return Ok(Some(plan));
                    }
                }
            }

            page += 1;
        }
    }

    /// Find a host server by id, exact name or formatted location string.
    pub async fn find_server(
        &self,
        server_id: Option<&str>,
        server_name: Option<&str>,
        location: Option<&str>,
    ) -> Result<Option<HostServer>> {
        if server_id.is_none() && server_name.is_none() && location.is_none() {
            return Ok(None);
        }

        let mut post: Vec<(&str, String)> = Vec::new();
        if let Some(name) = server_name {
            post.push(("servername", name.to_string()));
        }

        let mut page = 1u32;
        loop {
            let data = self
                .call(
                    "servers",
                    &[
                        ("page", page.to_string()),
                        ("reslen", PAGE_SIZE.to_string()),
                    ],
                    &post,
                )
                .await?;

            let servers = collect_values(&data["servs"]);
            if servers.is_empty() {
                return Ok(None);
            }

            for raw in servers {
                let Ok(server) = serde_json::from_value::<HostServer>(raw.clone()) else {
                    continue;
                };

                if let Some(id) = server_id {
                    if server.serid == id {
                        return Ok(Some(server));
                    }
                } else if let Some(name) = server_name {
                    if server.server_name == name {
                        return Ok(Some(server));
                    }
                } else if let Some(location) = location {
                    if location == location_json_to_string(server.location.as_deref()) {
                        return Ok(Some(server));
                    }
                }
            }

            page += 1;
        }
    }

    /// Find a server group by id or exact name.
    pub async fn find_server_group(
        &self,
        group_id: Option<&str>,
        group_name: Option<&str>,
    ) -> Result<Option<ServerGroup>> {
        let data = self.call("servergroups", &[], &[]).await?;

        for raw in collect_values(&data["servergroups"]) {
            let Ok(group) = serde_json::from_value::<ServerGroup>(raw.clone()) else {
                continue;
            };

            if let Some(id) = group_id {
                if group.sgid == id {
                    return Ok(Some(group));
                }
            } else if let Some(name) = group_name {
                if group.sg_name == name {
                    return Ok(Some(group));
                }
            }
        }

        Ok(None)
    }

    /// List OS templates. The panel keys the map by template id.
    pub async fn list_os_templates(&self) -> Result<Vec<OsTemplate>> {
        let data = self.call("ostemplates", &[], &[]).await?;

        let mut templates = Vec::new();
        if let Some(map) = data["ostemplates"].as_object() {
            for (osid, raw) in map {
                let Ok(mut template) = serde_json::from_value::<OsTemplate>(raw.clone()) else {
                    continue;
                };
                template.osid.get_or_insert_with(|| osid.clone());
                templates.push(template);
            }
        }

        Ok(templates)
    }
}

/// Translate a numeric status to a state string.
pub fn status_label(status: Option<&str>) -> &'static str {
    match status {
        Some("0") => "Off",
        Some("1") => "On",
        Some("2") => "Suspended",
        _ => "Unknown",
    }
}

/// Transform a host server location JSON string into `City, State, CC`.
pub fn location_json_to_string(location_json: Option<&str>) -> String {
    let Some(raw) = location_json.filter(|s| !s.is_empty()) else {
        return "Unknown".to_string();
    };

    let Ok(data) = serde_json::from_str::<Value>(raw) else {
        // maybe it was already a formatted string
        return raw.to_string();
    };

    let mut parts = Vec::new();
    for key in ["city", "state", "country_code"] {
        if let Some(value) = data[key].as_str() {
            if !value.is_empty() {
                parts.push(value.to_string());
            }
        }
    }

    if parts.is_empty() {
        "Unknown".to_string()
    } else {
        parts.join(", ")
    }
}

/// Condense gigantic catalog payloads before attaching a response to error
/// data, so logs stay readable.
pub fn condense_response_data(data: &Value) -> Value {
    let mut condensed = data.clone();

    if let Some(map) = condensed.as_object_mut() {
        for key in CONDENSED_KEYS {
            let count = match map.get(*key) {
                Some(Value::Array(list)) => list.len(),
                Some(Value::Object(inner)) => inner.len(),
                _ => 0,
            };

            if count > 1 {
                map.insert(
                    key.to_string(),
                    Value::String(format!("[redacted {count} {key}]")),
                );
            }
        }
    }

    condensed
}

fn check_response(act: &str, status: u16, data: &Value, body: &str) -> Result<()> {
    // mirror the panel's own notion of "empty": a bare `error: []` is fine
    let has_error = truthy(&data["fatal_error_text"])
        || truthy(&data["error_heading"])
        || truthy(&data["error"]);

    if has_error {
        let mut message = String::from("API Error");

        if let Some(title) = data["title"].as_str() {
            message.push_str(&format!(" [{title}]"));
        }
        if let Some(heading) = data["fatal_error_heading"].as_str() {
            message.push_str(&format!(": {heading}"));
        }
        if let Some(text) = data["fatal_error_text"].as_str() {
            message.push_str(&format!(": {text}"));
        }

        let errors: Vec<String> = match &data["error"] {
            Value::String(s) => vec![s.clone()],
            Value::Array(list) => list
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Value::Object(map) => map
                .values()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };
        if !errors.is_empty() {
            message.push_str(&format!(": {}", errors.join(", ")));
        }

        return Err(Error::Api {
            action: act.into(),
            status,
            message,
            data: condense_response_data(data),
            body: trim_body(body.to_string()),
        });
    }

    if status != 200 {
        return Err(Error::Api {
            action: act.into(),
            status,
            message: format!("API {status} Error"),
            data: condense_response_data(data),
            body: trim_body(body.to_string()),
        });
    }

    Ok(())
}

fn api_error(act: &str, message: &str, data: &Value) -> Error {
    Error::Api {
        action: act.into(),
        status: 200,
        message: message.into(),
        data: condense_response_data(data),
        body: String::new(),
    }
}

/// Iterate a collection the panel serves either as a map or a list.
fn collect_values(data: &Value) -> Vec<&Value> {
    match data {
        Value::Object(map) => map.values().collect(),
        Value::Array(list) => list.iter().collect(),
        _ => Vec::new(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() != Some(0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(list) => !list.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn trim_body(mut body: String) -> String {
    if body.len() > MAX_BODY_LEN {
        let mut end = MAX_BODY_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn api_key_hash_is_nonce_plus_md5() {
        let client =
            VirtualizorClient::with_base_url("http://localhost", "key", "secret").unwrap();

        let hash = client.api_key_hash();
        assert_eq!(hash.len(), 8 + 32);

        let (nonce, digest) = hash.split_at(8);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(digest, format!("{:x}", md5::compute(format!("secret{nonce}"))));
    }

    #[test]
    fn status_label_maps_known_codes() {
        assert_eq!(status_label(Some("0")), "Off");
        assert_eq!(status_label(Some("1")), "On");
        assert_eq!(status_label(Some("2")), "Suspended");
        assert_eq!(status_label(Some("7")), "Unknown");
        assert_eq!(status_label(None), "Unknown");
    }

    #[test]
    fn location_json_formats_parts() {
        let raw = r#"{"city":"London","state":"","country_code":"GB"}"#;
        assert_eq!(location_json_to_string(Some(raw)), "London, GB");
        assert_eq!(location_json_to_string(Some("Paris, FR")), "Paris, FR");
        assert_eq!(location_json_to_string(None), "Unknown");
    }

    #[test]
    fn condense_redacts_large_catalogs() {
        let data = serde_json::json!({
            "done": 1,
            "plans": {"1": {"plid": 1}, "2": {"plid": 2}},
        });

        let condensed = condense_response_data(&data);
        assert_eq!(condensed["plans"], "[redacted 2 plans]");
        assert_eq!(condensed["done"], 1);
    }

    #[tokio::test]
    async fn find_plan_pages_until_match() {
        let mut server = mockito::Server::new_async().await;

        let _page1 = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "plans".into()),
                Matcher::UrlEncoded("page".into(), "1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"plans":{"1":{"plid":1,"plan_name":"tiny","virt":"kvm"}}}"#)
            .create_async()
            .await;

        let _page2 = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "plans".into()),
                Matcher::UrlEncoded("page".into(), "2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"plans":{"7":{"plid":7,"plan_name":"big-kvm","virt":"kvm"}}}"#)
            .create_async()
            .await;

        let _page3 = server
            .mock("POST", "/index.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("act".into(), "plans".into()),
                Matcher::UrlEncoded("page".into(), "3".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"plans":{}}"#)
            .create_async()
            .await;

        let client =
            VirtualizorClient::with_base_url(server.url(), "key", "pass").unwrap();

        let plan = client
            .find_plan(None, Some("big-kvm"), Some("kvm"))
            .await
            .unwrap()
            .expect("plan should be found on page 2");
        assert_eq!(plan.plid, "7");

        let missing = client
            .find_plan(None, Some("no-such-plan"), None)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn fatal_error_body_is_rejected() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("POST", "/index.php")
            .match_query(Matcher::UrlEncoded("act".into(), "vs".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"title":"Power","fatal_error_heading":"Failure","fatal_error_text":"VPS is locked"}"#,
            )
            .create_async()
            .await;

        let client =
            VirtualizorClient::with_base_url(server.url(), "key", "pass").unwrap();
        let err = client.server_action("12", "start").await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("API Error [Power]"));
        assert!(message.contains("VPS is locked"));
    }
}
