use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeout {
    #[serde(default = "default_connect")]
    pub connect: f64,
    #[serde(default = "default_read")]
    pub read: f64,
    #[serde(default = "default_write")]
    pub write: f64,
}

impl Default for Timeout {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            read: default_read(),
            write: default_write(),
        }
    }
}

fn default_connect() -> f64 {
    5.0
}
fn default_read() -> f64 {
    30.0
}
fn default_write() -> f64 {
    30.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyPolicy {
    #[serde(default)]
    pub timeout: Timeout,
    #[serde(default = "default_max_response_size")]
    pub max_response_size: u64,
    #[serde(default = "default_strip_headers")]
    pub strip_headers: Vec<String>,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            timeout: Timeout::default(),
            max_response_size: default_max_response_size(),
            strip_headers: default_strip_headers(),
        }
    }
}

fn default_max_response_size() -> u64 {
    10 * 1024 * 1024
}

fn default_strip_headers() -> Vec<String> {
    [
        "Host",
        "Connection",
        "Transfer-Encoding",
        "Upgrade",
        "Proxy-Connection",
        "Proxy-Authenticate",
        "Proxy-Authorization",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerBinding {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub admin_host: String,
}

impl Default for ServerBinding {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_host: default_host(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRules {
    #[serde(default)]
    pub add_params: BTreeMap<String, String>,
    #[serde(default)]
    pub add_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub del_params: Vec<String>,
}

const MAX_MASK_PATTERN_LEN: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskRule {
    pub pattern: String,
    pub replacement: String,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl MaskRule {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
            compiled: None,
        }
    }

    /// Compiles `pattern`, rejecting it if it exceeds the length guard or
    /// fails to compile. Must run once at config-validation time so the
    /// masking engine never recompiles per request.
    fn validate_and_compile(&mut self) -> Result<()> {
        if self.pattern.len() > MAX_MASK_PATTERN_LEN {
            return Err(GatewayError::config(format!(
                "mask pattern exceeds {MAX_MASK_PATTERN_LEN} characters"
            )));
        }
        let regex = Regex::new(&self.pattern)
            .map_err(|err| GatewayError::config(format!("invalid regex '{}': {err}", self.pattern)))?;
        self.compiled = Some(regex);
        Ok(())
    }

    pub fn regex(&self) -> &Regex {
        self.compiled
            .as_ref()
            .expect("MaskRule used before validate_and_compile")
    }
}

impl PartialEq for MaskRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.replacement == other.replacement
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseRules {
    #[serde(default)]
    pub mask_regex: Vec<MaskRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub path: String,
    pub target: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub request_rules: RequestRules,
    #[serde(default)]
    pub response_rules: ResponseRules,
}

fn default_method() -> String {
    "*".to_string()
}

impl Route {
    /// Canonicalises `path` (must start with `/`; trailing `/` stripped
    /// except for the root) and uppercases `method`, in place.
    fn normalize(&mut self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(GatewayError::config(format!(
                "route '{}' path must start with '/'",
                self.name
            )));
        }
        let trimmed = self.path.trim_end_matches('/');
        self.path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        self.method = self.method.to_ascii_uppercase();
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub server: ServerBinding,
    #[serde(default)]
    pub proxy: ProxyPolicy,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl SystemConfig {
    /// Normalises route paths/methods, compiles every mask regex, and
    /// checks that route names are unique. A single bad regex fails
    /// validation wholesale.
    pub fn validate(&mut self) -> Result<()> {
        let mut seen_names = std::collections::HashSet::new();
        for route in &mut self.routes {
            route.normalize()?;
            if !seen_names.insert(route.name.clone()) {
                return Err(GatewayError::config(format!(
                    "duplicate route name '{}'",
                    route.name
                )));
            }
            for rule in &mut route.response_rules.mask_regex {
                rule.validate_and_compile()?;
            }
        }
        Ok(())
    }

    /// Serializes to a JSON value, optionally dropping default-valued and
    /// nil fields when the admin API's minimal-output mode is requested.
    pub fn to_json_value(&self, minimal: bool) -> Value {
        if !minimal {
            return serde_json::to_value(self).expect("SystemConfig always serializes");
        }

        let mut root = Map::new();
        if self.server != ServerBinding::default() {
            root.insert("server".into(), json!(self.server));
        }
        if self.proxy != ProxyPolicy::default() {
            root.insert("proxy".into(), json!(self.proxy));
        }
        let routes: Vec<Value> = self.routes.iter().map(route_to_minimal_value).collect();
        if !routes.is_empty() {
            root.insert("routes".into(), Value::Array(routes));
        }
        Value::Object(root)
    }
}

fn route_to_minimal_value(route: &Route) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), json!(route.name));
    obj.insert("path".into(), json!(route.path));
    obj.insert("target".into(), json!(route.target));
    if route.method != "*" {
        obj.insert("method".into(), json!(route.method));
    }
    if let Some(description) = &route.description {
        obj.insert("description".into(), json!(description));
    }
    if route.request_rules != RequestRules::default() {
        obj.insert("request_rules".into(), json!(route.request_rules));
    }
    if route.response_rules != ResponseRules::default() {
        obj.insert("response_rules".into(), json!(route.response_rules));
    }
    Value::Object(obj)
}
