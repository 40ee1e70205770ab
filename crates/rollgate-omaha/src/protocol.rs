//! Omaha v3 wire types.
//!
//! Attributes are mapped with quick-xml's `@` prefix. Unknown attributes and
//! elements in requests are ignored.

use serde::{Deserialize, Serialize};

use crate::error::OmahaError;

pub const PROTOCOL_VERSION: &str = "3.0";
pub const SERVER_NAME: &str = "rollgate";

/// Per-app status when the entry itself was accepted.
pub const APP_OK: &str = "ok";
const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

// ── Request ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    #[serde(rename = "@protocol", default)]
    pub protocol: String,
    #[serde(rename = "@version", default)]
    pub version: String,
    #[serde(default)]
    pub os: Option<Os>,
    #[serde(rename = "app", default)]
    pub apps: Vec<AppRequest>,
}

impl Request {
    pub fn from_xml(body: &str) -> Result<Self, OmahaError> {
        Ok(quick_xml::de::from_str(body)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Os {
    #[serde(rename = "@platform", default)]
    pub platform: String,
    #[serde(rename = "@version", default)]
    pub version: String,
    #[serde(rename = "@sp", default)]
    pub service_pack: String,
    #[serde(rename = "@arch", default)]
    pub arch: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppRequest {
    #[serde(rename = "@appid")]
    pub id: String,
    #[serde(rename = "@version", default)]
    pub version: String,
    #[serde(rename = "@track", default)]
    pub track: String,
    #[serde(rename = "@machineid", default)]
    pub machine_id: String,
    #[serde(rename = "@bootid", default)]
    pub boot_id: String,
    #[serde(rename = "@board", default)]
    pub board: String,
    #[serde(rename = "@oem", default)]
    pub oem: String,
    #[serde(rename = "@lang", default)]
    pub lang: String,
    #[serde(default)]
    pub ping: Option<PingRequest>,
    #[serde(rename = "updatecheck", default)]
    pub update_check: Option<UpdateCheckRequest>,
    #[serde(rename = "event", default)]
    pub events: Vec<EventRequest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PingRequest {
    #[serde(rename = "@active", default)]
    pub active: Option<String>,
    #[serde(rename = "@r", default)]
    pub rollcall_days: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCheckRequest {
    #[serde(rename = "@targetversionprefix", default)]
    pub target_version_prefix: Option<String>,
}

/// Event codes stay raw text so one malformed event cannot fail the
/// whole request; [`EventRequest::codes`] parses them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventRequest {
    #[serde(rename = "@eventtype", default)]
    pub event_type: String,
    #[serde(rename = "@eventresult", default)]
    pub event_result: String,
    #[serde(rename = "@previousversion", default)]
    pub previous_version: String,
    #[serde(rename = "@errorcode", default)]
    pub error_code: String,
}

impl EventRequest {
    /// `(eventtype, eventresult)`, or `None` when either is not a number.
    pub fn codes(&self) -> Option<(u32, u32)> {
        let event_type = self.event_type.trim().parse().ok()?;
        let event_result = self.event_result.trim().parse().ok()?;
        Some((event_type, event_result))
    }
}

// ── Response ──────────────────────────────────────────────────────
//
// Attribute fields must precede child elements for the serializer.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@server")]
    pub server: String,
    pub daystart: DayStart,
    #[serde(rename = "app", default)]
    pub apps: Vec<AppResponse>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            server: SERVER_NAME.to_string(),
            daystart: DayStart { elapsed_seconds: 0 },
            apps: Vec::new(),
        }
    }

    pub fn to_xml(&self) -> Result<String, OmahaError> {
        let body = quick_xml::se::to_string_with_root("response", self)?;
        Ok(format!("{XML_DECLARATION}\n{body}"))
    }

    pub fn from_xml(body: &str) -> Result<Self, OmahaError> {
        Ok(quick_xml::de::from_str(body)?)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayStart {
    #[serde(rename = "@elapsed_seconds")]
    pub elapsed_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppResponse {
    #[serde(rename = "@appid")]
    pub id: String,
    #[serde(rename = "@status")]
    pub status: String,
    #[serde(rename = "event", default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<StatusAck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<StatusAck>,
    #[serde(rename = "updatecheck", default, skip_serializing_if = "Option::is_none")]
    pub update_check: Option<UpdateCheckResponse>,
}

impl AppResponse {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: APP_OK.to_string(),
            events: Vec::new(),
            ping: None,
            update_check: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusAck {
    #[serde(rename = "@status")]
    pub status: String,
}

impl StatusAck {
    pub fn ok() -> Self {
        Self {
            status: APP_OK.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateCheckResponse {
    #[serde(rename = "@status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Urls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
}

impl UpdateCheckResponse {
    pub fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            urls: None,
            manifest: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Urls {
    #[serde(rename = "url", default)]
    pub urls: Vec<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Url {
    #[serde(rename = "@codebase")]
    pub codebase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(rename = "@version")]
    pub version: String,
    pub packages: Packages,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Actions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packages {
    #[serde(rename = "package", default)]
    pub packages: Vec<PackageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageEntry {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@hash", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(rename = "@size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "@required")]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Actions {
    #[serde(rename = "action", default)]
    pub actions: Vec<Action>,
}

/// Install-action descriptor carried by platform update packages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    #[serde(rename = "@event")]
    pub event: String,
    #[serde(rename = "@ChromeOSVersion", default)]
    pub chromeos_version: String,
    #[serde(rename = "@sha256")]
    pub sha256: String,
    #[serde(rename = "@needsadmin")]
    pub needs_admin: bool,
    #[serde(rename = "@IsDelta")]
    pub is_delta: bool,
    #[serde(rename = "@DisablePayloadBackoff")]
    pub disable_payload_backoff: bool,
    #[serde(rename = "@MetadataSignatureRsa", default, skip_serializing_if = "String::is_empty")]
    pub metadata_signature_rsa: String,
    #[serde(rename = "@MetadataSize", default, skip_serializing_if = "String::is_empty")]
    pub metadata_size: String,
    #[serde(rename = "@Deadline", default, skip_serializing_if = "String::is_empty")]
    pub deadline: String,
}
