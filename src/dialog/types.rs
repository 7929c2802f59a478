//! Dialog backend JSON bodies

use serde::{Deserialize, Serialize};

use crate::settings::DialogSettings;

use super::DialogIdentity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub lng: f64,
    pub lat: f64,
    pub coords_type: String,
}

impl Location {
    pub fn from_settings(settings: &DialogSettings) -> Self {
        Self {
            lng: settings.longitude,
            lat: settings.latitude,
            coords_type: settings.coords_type.clone(),
        }
    }
}

/// `clientinfo` block sent on login
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(rename = "deviceid")]
    pub device_id: String,
    pub uid: String,
    pub timezone: String,
    pub os_family: String,
    pub os_type: String,
    pub os_version: String,
    pub app_version: String,
    pub location: Location,
}

impl ClientInfo {
    pub fn new(identity: &DialogIdentity, settings: &DialogSettings) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            uid: identity.user_id.clone(),
            timezone: settings.timezone.clone(),
            os_family: settings.os_family.clone(),
            os_type: settings.os_type.clone(),
            os_version: settings.os_version.clone(),
            app_version: settings.app_version.clone(),
            location: Location::from_settings(settings),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub clientinfo: ClientInfo,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TalkClientInfo {
    pub location: Location,
}

#[derive(Debug, Clone, Serialize)]
pub struct TalkRequest {
    pub clientinfo: TalkClientInfo,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub q: String,
    pub source: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutClientInfo {
    #[serde(rename = "deviceid")]
    pub device_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogoutRequest {
    pub clientinfo: LogoutClientInfo,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// The parts of a fetched NLU document the relay inspects. The rest of the
/// document is passed to the client verbatim.
#[derive(Debug, Deserialize)]
pub struct NluReply {
    #[serde(default)]
    pub domain: Option<String>,
}

impl NluReply {
    pub fn has_classification(&self) -> bool {
        self.domain.as_deref().is_some_and(|d| !d.trim().is_empty())
    }
}
