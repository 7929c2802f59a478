//! Dialog backend client
//!
//! Four calls, each with its own request timeout:
//! login → talk → fetch → logout.

use futures_util::future::BoxFuture;
use reqwest::Client;

use super::types::{
    ClientInfo, Location, LoginRequest, LoginResponse, LogoutClientInfo, LogoutRequest,
    TalkClientInfo, TalkRequest,
};
use super::{DialogError, DialogIdentity};
use crate::settings::DialogSettings;

/// The dialog backend's four logical operations
pub trait DialogBackend: Send + Sync {
    /// Returns an access token
    fn login<'a>(&'a self, identity: &'a DialogIdentity) -> BoxFuture<'a, Result<String, DialogError>>;

    fn talk<'a>(&'a self, token: &'a str, text: &'a str) -> BoxFuture<'a, Result<(), DialogError>>;

    /// Returns the raw NLU result document
    fn fetch<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<String, DialogError>>;

    fn logout<'a>(
        &'a self,
        token: &'a str,
        identity: &'a DialogIdentity,
    ) -> BoxFuture<'a, Result<(), DialogError>>;
}

/// reqwest-backed [`DialogBackend`]
pub struct HttpDialogBackend {
    client: Client,
    settings: DialogSettings,
}

impl HttpDialogBackend {
    pub fn new(settings: DialogSettings) -> Result<Self, DialogError> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| DialogError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, settings })
    }

    fn login_url(&self) -> String {
        format!(
            "{}login?protocol={}&version={}",
            self.settings.url, self.settings.protocol, self.settings.version
        )
    }

    fn talk_url(&self, token: &str) -> String {
        format!(
            "{}talk?protocol={}&version={}&ak={}",
            self.settings.url, self.settings.protocol, self.settings.version, token
        )
    }

    fn fetch_url(&self, token: &str) -> String {
        format!(
            "{}fetch?protocol={}&version={}&ak={}",
            self.settings.url, self.settings.protocol, self.settings.version, token
        )
    }

    fn logout_url(&self, token: &str) -> String {
        format!("{}logout?ak={}", self.settings.url, token)
    }
}

/// Send a request and return its body, mapping failures the same way for
/// every endpoint.
async fn send_for_text(request: reqwest::RequestBuilder, what: &str) -> Result<String, DialogError> {
    let response = request
        .send()
        .await
        .map_err(|e| DialogError::Network(format!("{} request failed: {}", what, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DialogError::Api {
            status: status.as_u16(),
            message: format!("{}: {}", what, body),
        });
    }

    response
        .text()
        .await
        .map_err(|e| DialogError::Network(format!("{} body read failed: {}", what, e)))
}

impl DialogBackend for HttpDialogBackend {
    fn login<'a>(&'a self, identity: &'a DialogIdentity) -> BoxFuture<'a, Result<String, DialogError>> {
        Box::pin(async move {
            let body = LoginRequest {
                clientinfo: ClientInfo::new(identity, &self.settings),
                kind: "login",
            };
            let text = send_for_text(self.client.post(self.login_url()).json(&body), "login").await?;
            let parsed: LoginResponse =
                serde_json::from_str(&text).map_err(|e| DialogError::Parse(e.to_string()))?;
            parsed
                .access_token
                .filter(|t| !t.is_empty())
                .ok_or(DialogError::MissingToken)
        })
    }

    fn talk<'a>(&'a self, token: &'a str, text: &'a str) -> BoxFuture<'a, Result<(), DialogError>> {
        Box::pin(async move {
            let body = TalkRequest {
                clientinfo: TalkClientInfo {
                    location: Location::from_settings(&self.settings),
                },
                kind: "talk",
                q: text.to_string(),
                source: 1,
            };
            let reply = send_for_text(self.client.post(self.talk_url(token)).json(&body), "talk").await?;
            log::debug!("Dialog: talk reply: {}", reply);
            Ok(())
        })
    }

    fn fetch<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<String, DialogError>> {
        Box::pin(async move { send_for_text(self.client.get(self.fetch_url(token)), "fetch").await })
    }

    fn logout<'a>(
        &'a self,
        token: &'a str,
        identity: &'a DialogIdentity,
    ) -> BoxFuture<'a, Result<(), DialogError>> {
        Box::pin(async move {
            let body = LogoutRequest {
                clientinfo: LogoutClientInfo {
                    device_id: identity.device_id.clone(),
                    access_token: token.to_string(),
                },
                kind: "logout",
            };
            send_for_text(self.client.post(self.logout_url(token)).json(&body), "logout").await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HttpDialogBackend {
        HttpDialogBackend::new(DialogSettings {
            url: "http://nlu.local/ai/".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_urls() {
        let backend = backend();
        assert_eq!(
            backend.login_url(),
            "http://nlu.local/ai/login?protocol=cellphone&version=1.0"
        );
        assert_eq!(
            backend.talk_url("tok"),
            "http://nlu.local/ai/talk?protocol=cellphone&version=1.0&ak=tok"
        );
        assert_eq!(
            backend.fetch_url("tok"),
            "http://nlu.local/ai/fetch?protocol=cellphone&version=1.0&ak=tok"
        );
        assert_eq!(backend.logout_url("tok"), "http://nlu.local/ai/logout?ak=tok");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let backend = HttpDialogBackend::new(DialogSettings {
            url: "http://127.0.0.1:1/".to_string(),
            timeout_ms: 500,
            ..Default::default()
        })
        .unwrap();

        let result = backend.login(&DialogIdentity::new("d", "u")).await;
        assert!(matches!(result, Err(DialogError::Network(_))));
    }
}
