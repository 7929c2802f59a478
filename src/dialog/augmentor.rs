//! Dialog round trip with bounded retry

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::client::DialogBackend;
use super::types::NluReply;
use super::{AugmentRequest, Augmentor, DialogError, DialogIdentity};
use crate::settings::DialogSettings;

/// How often, and how patiently, to repeat a round trip that came back
/// without a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &DialogSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.retry_base_delay(),
        }
    }

    /// Backoff before the given zero-based attempt
    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.saturating_pow(attempt - 1)
        }
    }
}

/// Runs login → talk → fetch → logout and returns the fetched NLU document.
pub struct DialogAugmentor<B> {
    backend: Arc<B>,
    retry: RetryPolicy,
    /// Used for whichever identity field a request leaves empty
    fallback: DialogIdentity,
}

impl<B> Clone for DialogAugmentor<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            retry: self.retry,
            fallback: self.fallback.clone(),
        }
    }
}

impl<B: DialogBackend + 'static> DialogAugmentor<B> {
    pub fn new(backend: B, retry: RetryPolicy) -> Self {
        Self {
            backend: Arc::new(backend),
            retry,
            fallback: DialogIdentity::default(),
        }
    }

    pub fn with_fallback_identity(mut self, identity: DialogIdentity) -> Self {
        self.fallback = identity;
        self
    }

    fn resolve_identity(&self, identity: &DialogIdentity) -> DialogIdentity {
        let pick = |own: &str, fallback: &str| {
            if own.is_empty() {
                fallback.to_string()
            } else {
                own.to_string()
            }
        };
        DialogIdentity {
            device_id: pick(&identity.device_id, &self.fallback.device_id),
            user_id: pick(&identity.user_id, &self.fallback.user_id),
        }
    }

    /// Full augmentation with retry. Only an empty classification is
    /// retried; any other error ends the attempt immediately.
    pub async fn dialog(&self, request: &AugmentRequest) -> Result<String, DialogError> {
        let identity = self.resolve_identity(&request.identity);
        let mut last_error = DialogError::EmptyClassification;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_before(attempt);
                log::info!(
                    "Dialog[{}]: retrying in {:?} (attempt {}/{})",
                    request.session_id,
                    delay,
                    attempt + 1,
                    self.retry.max_attempts
                );
                tokio::time::sleep(delay).await;
            }

            match self.round_trip(&identity, &request.utterance).await {
                Ok(nlu) => return Ok(nlu),
                Err(DialogError::EmptyClassification) => {
                    log::warn!(
                        "Dialog[{}]: attempt {} returned no classification",
                        request.session_id,
                        attempt + 1
                    );
                    last_error = DialogError::EmptyClassification;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn round_trip(&self, identity: &DialogIdentity, utterance: &str) -> Result<String, DialogError> {
        let token = self.backend.login(identity).await?;
        log::debug!("Dialog: logged in as device {}", identity.device_id);
        let login = LoginGuard {
            backend: Arc::clone(&self.backend),
            token,
            identity: identity.clone(),
            released: false,
        };

        let result = self.talk_and_fetch(&login.token, utterance).await;

        // Release the backend session whether or not talk/fetch succeeded
        login.release().await;

        let nlu = result?;
        let reply: NluReply =
            serde_json::from_str(&nlu).map_err(|e| DialogError::Parse(e.to_string()))?;
        if !reply.has_classification() {
            return Err(DialogError::EmptyClassification);
        }
        Ok(nlu)
    }

    async fn talk_and_fetch(&self, token: &str, utterance: &str) -> Result<String, DialogError> {
        self.backend.talk(token, utterance).await?;
        self.backend.fetch(token).await
    }
}

/// A logged-in backend session. If the round trip is dropped before
/// [`LoginGuard::release`] finishes (an aborted augmentation, say), the
/// logout is handed to the runtime instead.
struct LoginGuard<B: DialogBackend + 'static> {
    backend: Arc<B>,
    token: String,
    identity: DialogIdentity,
    released: bool,
}

impl<B: DialogBackend + 'static> LoginGuard<B> {
    async fn release(mut self) {
        if let Err(e) = self.backend.logout(&self.token, &self.identity).await {
            log::warn!("Dialog: logout failed: {}", e);
        }
        self.released = true;
    }
}

impl<B: DialogBackend + 'static> Drop for LoginGuard<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let token = std::mem::take(&mut self.token);
        let identity = std::mem::take(&mut self.identity);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::debug!("Dialog: round trip dropped, logging out in the background");
                handle.spawn(async move {
                    if let Err(e) = backend.logout(&token, &identity).await {
                        log::warn!("Dialog: background logout failed: {}", e);
                    }
                });
            }
            Err(_) => log::warn!(
                "Dialog: round trip dropped outside a runtime, device {} stays logged in",
                identity.device_id
            ),
        }
    }
}

impl<B: DialogBackend + 'static> Augmentor for DialogAugmentor<B> {
    fn augment(&self, request: AugmentRequest) -> BoxFuture<'static, Option<String>> {
        let this = self.clone();
        Box::pin(async move {
            match this.dialog(&request).await {
                Ok(nlu) => {
                    log::info!("Dialog[{}]: augmentation ready", request.session_id);
                    Some(nlu)
                }
                Err(e) => {
                    log::warn!(
                        "Dialog[{}]: augmentation unavailable: {}",
                        request.session_id,
                        e
                    );
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend whose fetch results are scripted in order
    #[derive(Default)]
    struct ScriptedBackend {
        fetches: Mutex<VecDeque<Result<String, DialogError>>>,
        login_error: Option<DialogError>,
        fetch_delay: Option<Duration>,
        logins: Mutex<Vec<DialogIdentity>>,
        talks: Mutex<Vec<String>>,
        logouts: AtomicUsize,
    }

    impl ScriptedBackend {
        fn with_fetches(fetches: Vec<Result<String, DialogError>>) -> Self {
            Self {
                fetches: Mutex::new(fetches.into()),
                ..Default::default()
            }
        }
    }

    impl DialogBackend for ScriptedBackend {
        fn login<'a>(
            &'a self,
            identity: &'a DialogIdentity,
        ) -> BoxFuture<'a, Result<String, DialogError>> {
            Box::pin(async move {
                self.logins.lock().unwrap().push(identity.clone());
                match &self.login_error {
                    Some(e) => Err(e.clone()),
                    None => Ok("token".to_string()),
                }
            })
        }

        fn talk<'a>(&'a self, _token: &'a str, text: &'a str) -> BoxFuture<'a, Result<(), DialogError>> {
            Box::pin(async move {
                self.talks.lock().unwrap().push(text.to_string());
                Ok(())
            })
        }

        fn fetch<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, Result<String, DialogError>> {
            Box::pin(async move {
                if let Some(delay) = self.fetch_delay {
                    tokio::time::sleep(delay).await;
                }
                self.fetches
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Ok("{}".to_string()))
            })
        }

        fn logout<'a>(
            &'a self,
            _token: &'a str,
            _identity: &'a DialogIdentity,
        ) -> BoxFuture<'a, Result<(), DialogError>> {
            Box::pin(async move {
                self.logouts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn request(identity: DialogIdentity) -> AugmentRequest {
        AugmentRequest {
            session_id: "s1".to_string(),
            identity,
            utterance: "turnonlights".to_string(),
        }
    }

    #[tokio::test]
    async fn test_classified_result_is_returned_verbatim() {
        let nlu = r#"{"domain":"vehicle","intent":"lights_on"}"#;
        let augmentor = DialogAugmentor::new(
            ScriptedBackend::with_fetches(vec![Ok(nlu.to_string())]),
            RetryPolicy::default(),
        );

        let result = augmentor.augment(request(DialogIdentity::new("d", "u"))).await;

        assert_eq!(result.as_deref(), Some(nlu));
        assert_eq!(*augmentor.backend.talks.lock().unwrap(), vec!["turnonlights"]);
        assert_eq!(augmentor.backend.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_classification_is_retried_then_succeeds() {
        let augmentor = DialogAugmentor::new(
            ScriptedBackend::with_fetches(vec![
                Ok(r#"{"domain":""}"#.to_string()),
                Ok(r#"{"domain":"music"}"#.to_string()),
            ]),
            RetryPolicy::default(),
        );

        let result = augmentor.dialog(&request(DialogIdentity::new("d", "u"))).await;

        assert_eq!(result, Ok(r#"{"domain":"music"}"#.to_string()));
        assert_eq!(augmentor.backend.logins.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let augmentor = DialogAugmentor::new(
            ScriptedBackend::default(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
        );

        let result = augmentor.augment(request(DialogIdentity::new("d", "u"))).await;

        assert_eq!(result, None);
        assert_eq!(augmentor.backend.logins.lock().unwrap().len(), 3);
        assert_eq!(augmentor.backend.logouts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_retried() {
        let backend = ScriptedBackend {
            login_error: Some(DialogError::Network("refused".to_string())),
            ..Default::default()
        };
        let augmentor = DialogAugmentor::new(backend, RetryPolicy::default());

        let result = augmentor.dialog(&request(DialogIdentity::new("d", "u"))).await;

        assert!(matches!(result, Err(DialogError::Network(_))));
        assert_eq!(augmentor.backend.logins.lock().unwrap().len(), 1);
        // Never logged in, so nothing to release
        assert_eq!(augmentor.backend.logouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_still_logs_out() {
        let augmentor = DialogAugmentor::new(
            ScriptedBackend::with_fetches(vec![Err(DialogError::Api {
                status: 500,
                message: "boom".to_string(),
            })]),
            RetryPolicy::default(),
        );

        let result = augmentor.augment(request(DialogIdentity::new("d", "u"))).await;

        assert_eq!(result, None);
        assert_eq!(augmentor.backend.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_round_trip_still_logs_out() {
        let augmentor = DialogAugmentor::new(
            ScriptedBackend {
                fetch_delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            RetryPolicy::default(),
        );

        let running = tokio::spawn(augmentor.augment(request(DialogIdentity::new("d", "u"))));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(augmentor.backend.logins.lock().unwrap().len(), 1);

        // What the dispatcher does when the augment timeout runs out
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(augmentor.backend.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unparseable_result_is_unavailable() {
        let augmentor = DialogAugmentor::new(
            ScriptedBackend::with_fetches(vec![Ok("not json".to_string())]),
            RetryPolicy::default(),
        );
        let result = augmentor.dialog(&request(DialogIdentity::new("d", "u"))).await;
        assert!(matches!(result, Err(DialogError::Parse(_))));
    }

    #[tokio::test]
    async fn test_device_and_user_stay_distinct_with_fallback() {
        let augmentor = DialogAugmentor::new(
            ScriptedBackend::with_fetches(vec![Ok(r#"{"domain":"x"}"#.to_string())]),
            RetryPolicy::default(),
        )
        .with_fallback_identity(DialogIdentity::new("fallback-dev", "fallback-user"));

        augmentor
            .dialog(&request(DialogIdentity::new("", "user-7")))
            .await
            .unwrap();

        assert_eq!(
            augmentor.backend.logins.lock().unwrap()[0],
            DialogIdentity::new("fallback-dev", "user-7")
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(400));
    }
}
