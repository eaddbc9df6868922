use std::sync::Arc;
use std::time::Duration;

use keepsake_contracts::events::{EventPayload, EventWriter};
use keepsake_contracts::generation::GenerationOutcome;
use keepsake_contracts::jobs::TrainingStatusReport;
use keepsake_contracts::providers::RouteCapabilities;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::blob::BlobStore;
use crate::config::EngineConfig;
use crate::error::{error_chain_text, EngineError, EngineResult};
use crate::provider::{
    GenerationProvider, HostedProvider, LegacyProvider, ProviderGenerateRequest,
    ProviderTrainingRequest, StubProvider,
};

const ERROR_TEXT_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    pub primary_enabled: bool,
    pub legacy_fallback_enabled: bool,
    pub health_timeout: Duration,
}

impl RouterSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            primary_enabled: config.primary_enabled,
            legacy_fallback_enabled: config.legacy_fallback_enabled,
            health_timeout: Duration::from_secs_f64(config.health_timeout_seconds),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            primary_enabled: true,
            legacy_fallback_enabled: false,
            health_timeout: Duration::from_secs(2),
        }
    }
}

/// Picks the backend for each call. The primary serves everything; the legacy
/// backend may take over a failed synchronous generation, once.
pub struct ProviderRouter {
    primary: Arc<dyn GenerationProvider>,
    legacy: Option<Arc<dyn GenerationProvider>>,
    settings: RouterSettings,
    events: EventWriter,
}

impl ProviderRouter {
    pub fn new(
        primary: Arc<dyn GenerationProvider>,
        legacy: Option<Arc<dyn GenerationProvider>>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            primary,
            legacy,
            settings,
            events: EventWriter::disabled("router"),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    /// Stub mode keeps everything offline, so no legacy backend is wired.
    pub fn from_config(
        config: &EngineConfig,
        blobs: Arc<dyn BlobStore>,
        events: EventWriter,
    ) -> Self {
        let settings = RouterSettings::from_config(config);
        if config.stub_mode {
            let stub = StubProvider::new(blobs, config.stub_polls_until_complete);
            return Self::new(Arc::new(stub), None, settings).with_events(events);
        }
        let primary: Arc<dyn GenerationProvider> =
            Arc::new(HostedProvider::new(config, Arc::clone(&blobs)));
        let legacy: Option<Arc<dyn GenerationProvider>> = if config.legacy_fallback_enabled {
            Some(Arc::new(LegacyProvider::new(config, blobs)))
        } else {
            None
        };
        Self::new(primary, legacy, settings).with_events(events)
    }

    pub fn capabilities(&self) -> RouteCapabilities {
        RouteCapabilities {
            primary: self.primary.kind(),
            primary_enabled: self.settings.primary_enabled,
            fallback: self.active_fallback().map(|legacy| legacy.kind()),
            features: self.primary.capabilities(),
        }
    }

    pub fn health_check(&self) -> bool {
        if !self.settings.primary_enabled {
            return false;
        }
        self.primary.health(self.settings.health_timeout)
    }

    pub fn generate(&self, request: &ProviderGenerateRequest) -> EngineResult<GenerationOutcome> {
        self.ensure_primary_enabled()?;
        let primary_err = match self.primary.generate(request) {
            Ok(image_uri) => {
                return Ok(GenerationOutcome {
                    image_uri,
                    provider: self.primary.name().to_string(),
                    fallback_reason: None,
                })
            }
            Err(err) => error_chain_text(&err, ERROR_TEXT_LIMIT),
        };
        warn!(provider = self.primary.name(), error = %primary_err, "primary generation failed");

        let Some(legacy) = self.active_fallback() else {
            return Err(EngineError::GenerationFailed {
                primary: primary_err,
                fallback: None,
            });
        };
        if request.panels > 1 && !legacy.capabilities().multi_angle {
            return Err(EngineError::GenerationFailed {
                primary: primary_err,
                fallback: Some(format!(
                    "{} cannot render {} panels",
                    legacy.name(),
                    request.panels
                )),
            });
        }

        match legacy.generate(request) {
            Ok(image_uri) => {
                let fallback_reason = append_fallback_reason(
                    None,
                    format!("{} failed: {primary_err}.", self.primary.name()),
                );
                let fallback_reason = append_fallback_reason(
                    fallback_reason,
                    format!("Served by {}.", legacy.name()),
                );
                self.emit_fallback(request, legacy.name(), fallback_reason.as_deref());
                Ok(GenerationOutcome {
                    image_uri,
                    provider: legacy.name().to_string(),
                    fallback_reason,
                })
            }
            Err(err) => {
                let fallback_err = error_chain_text(&err, ERROR_TEXT_LIMIT);
                warn!(provider = legacy.name(), error = %fallback_err, "fallback generation failed");
                Err(EngineError::GenerationFailed {
                    primary: primary_err,
                    fallback: Some(fallback_err),
                })
            }
        }
    }

    pub fn start_training(&self, request: &ProviderTrainingRequest) -> EngineResult<String> {
        self.ensure_primary_enabled()?;
        if !self.primary.capabilities().training {
            return Err(EngineError::Unsupported(format!(
                "{} does not train adapters",
                self.primary.name()
            )));
        }
        self.primary.start_training(request).map_err(|err| {
            EngineError::ProviderUnavailable(error_chain_text(&err, ERROR_TEXT_LIMIT))
        })
    }

    pub fn poll_training(&self, job_id: &str) -> EngineResult<TrainingStatusReport> {
        self.ensure_primary_enabled()?;
        let report = self.primary.poll_training(job_id).map_err(|err| {
            EngineError::PollingTransient(error_chain_text(&err, ERROR_TEXT_LIMIT))
        })?;
        debug!(job_id, status = %report.status(), "training poll");
        Ok(report)
    }

    fn ensure_primary_enabled(&self) -> EngineResult<()> {
        if self.settings.primary_enabled {
            return Ok(());
        }
        Err(EngineError::ProviderDisabled(format!(
            "{} backend is disabled",
            self.primary.name()
        )))
    }

    fn active_fallback(&self) -> Option<&Arc<dyn GenerationProvider>> {
        if !self.settings.legacy_fallback_enabled {
            return None;
        }
        self.legacy.as_ref()
    }

    fn emit_fallback(&self, request: &ProviderGenerateRequest, served_by: &str, reason: Option<&str>) {
        let mut payload = EventPayload::new();
        payload.insert("owner_id".to_string(), json!(request.owner_id));
        payload.insert("kind".to_string(), json!(request.kind.as_str()));
        payload.insert("primary".to_string(), json!(self.primary.name()));
        payload.insert("served_by".to_string(), json!(served_by));
        payload.insert(
            "reason".to_string(),
            reason.map(|text| json!(text)).unwrap_or(Value::Null),
        );
        if let Err(err) = self.events.emit("generation_fallback", payload) {
            warn!(error = %err, "failed to record generation_fallback event");
        }
    }
}

fn append_fallback_reason(existing: Option<String>, reason: String) -> Option<String> {
    if reason.trim().is_empty() {
        return existing;
    }
    match existing {
        Some(previous) if !previous.trim().is_empty() => Some(format!("{previous} {reason}")),
        _ => Some(reason),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{anyhow, bail, Result};
    use keepsake_contracts::events::{read_events, EventWriter};
    use keepsake_contracts::generation::{GenerationKind, StyleParams};
    use keepsake_contracts::jobs::TrainingStatusReport;
    use keepsake_contracts::providers::{ProviderCapabilities, ProviderKind};
    use serde_json::Map;

    use super::{append_fallback_reason, ProviderRouter, RouterSettings};
    use crate::error::EngineError;
    use crate::provider::{GenerationProvider, ProviderGenerateRequest, ProviderTrainingRequest};

    /// In-process provider whose answers are scripted per test.
    pub(crate) struct ScriptedProvider {
        pub name: &'static str,
        pub kind: ProviderKind,
        pub capabilities: ProviderCapabilities,
        pub generate_ok: bool,
        pub healthy: bool,
        pub poll_script: Mutex<VecDeque<Result<TrainingStatusReport, String>>>,
        pub poll_fallback: TrainingStatusReport,
        pub generate_calls: AtomicUsize,
        pub start_calls: AtomicUsize,
        pub poll_calls: AtomicUsize,
        pub start_fails: bool,
        pub last_generate: Mutex<Option<ProviderGenerateRequest>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(name: &'static str) -> Self {
            Self {
                name,
                kind: ProviderKind::Hosted,
                capabilities: ProviderCapabilities::full(),
                generate_ok: true,
                healthy: true,
                poll_script: Mutex::new(VecDeque::new()),
                poll_fallback: TrainingStatusReport::Training,
                generate_calls: AtomicUsize::new(0),
                start_calls: AtomicUsize::new(0),
                poll_calls: AtomicUsize::new(0),
                start_fails: false,
                last_generate: Mutex::new(None),
            }
        }

        pub(crate) fn failing(name: &'static str) -> Self {
            Self {
                generate_ok: false,
                healthy: false,
                ..Self::new(name)
            }
        }

        pub(crate) fn last_generate(&self) -> Option<ProviderGenerateRequest> {
            self.last_generate.lock().ok().and_then(|last| last.clone())
        }

        pub(crate) fn with_polls(
            self,
            script: Vec<Result<TrainingStatusReport, String>>,
            then: TrainingStatusReport,
        ) -> Self {
            Self {
                poll_script: Mutex::new(script.into()),
                poll_fallback: then,
                ..self
            }
        }
    }

    impl GenerationProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn capabilities(&self) -> ProviderCapabilities {
            self.capabilities
        }

        fn generate(&self, request: &ProviderGenerateRequest) -> Result<String> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_generate.lock() {
                *last = Some(request.clone());
            }
            if !self.generate_ok {
                bail!("{} is down", self.name);
            }
            Ok(format!(
                "mem://test/generated/{}/{}_{}.png",
                request.owner_id,
                request.kind.as_str(),
                self.name
            ))
        }

        fn start_training(&self, request: &ProviderTrainingRequest) -> Result<String> {
            let call = self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.start_fails {
                bail!("{} refused the training job", self.name);
            }
            Ok(format!("job-{}-{call}", request.adapter_id))
        }

        fn poll_training(&self, _job_id: &str) -> Result<TrainingStatusReport> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .poll_script
                .lock()
                .map_err(|_| anyhow!("poll script poisoned"))?
                .pop_front();
            match next {
                Some(Ok(report)) => Ok(report),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Ok(self.poll_fallback.clone()),
            }
        }

        fn health(&self, _timeout: Duration) -> bool {
            self.healthy
        }
    }

    pub(crate) fn generate_request(kind: GenerationKind) -> ProviderGenerateRequest {
        ProviderGenerateRequest {
            owner_id: "u1".to_string(),
            kind,
            prompt: "birthday party".to_string(),
            style: StyleParams::default(),
            reference_images: Vec::new(),
            reference_labels: Vec::new(),
            adapter_uri: None,
            panels: kind.panels(),
            metadata: Map::new(),
        }
    }

    fn settings(primary_enabled: bool, legacy_fallback_enabled: bool) -> RouterSettings {
        RouterSettings {
            primary_enabled,
            legacy_fallback_enabled,
            health_timeout: Duration::from_millis(10),
        }
    }

    fn legacy(provider: ScriptedProvider) -> ScriptedProvider {
        ScriptedProvider {
            kind: ProviderKind::Legacy,
            capabilities: ProviderCapabilities::generation_only(),
            ..provider
        }
    }

    #[test]
    fn healthy_primary_serves_without_touching_legacy() -> anyhow::Result<()> {
        let primary = Arc::new(ScriptedProvider::new("hosted"));
        let fallback = Arc::new(legacy(ScriptedProvider::new("legacy")));
        let router = ProviderRouter::new(primary.clone(), Some(fallback.clone()), settings(true, true));

        let outcome = router.generate(&generate_request(GenerationKind::Subject))?;
        assert_eq!(outcome.provider, "hosted");
        assert!(outcome.fallback_reason.is_none());
        assert_eq!(fallback.generate_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn failed_primary_gets_exactly_one_legacy_attempt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let primary = Arc::new(ScriptedProvider::failing("hosted"));
        let fallback = Arc::new(legacy(ScriptedProvider::new("legacy")));
        let router = ProviderRouter::new(primary.clone(), Some(fallback.clone()), settings(true, true))
            .with_events(EventWriter::new(&events_path, "router"));

        let outcome = router.generate(&generate_request(GenerationKind::Memory))?;
        assert_eq!(outcome.provider, "legacy");
        let reason = outcome.fallback_reason.unwrap_or_default();
        assert!(reason.contains("hosted failed"));
        assert!(reason.contains("Served by legacy."));
        assert_eq!(primary.generate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.generate_calls.load(Ordering::SeqCst), 1);

        let events = read_events(&events_path);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "generation_fallback");
        assert_eq!(events[0]["served_by"], "legacy");
        Ok(())
    }

    #[test]
    fn both_failing_reports_both_errors() {
        let primary = Arc::new(ScriptedProvider::failing("hosted"));
        let fallback = Arc::new(legacy(ScriptedProvider::failing("legacy")));
        let router = ProviderRouter::new(primary, Some(fallback.clone()), settings(true, true));

        let err = router
            .generate(&generate_request(GenerationKind::Subject))
            .err();
        assert!(matches!(
            err,
            Some(EngineError::GenerationFailed { fallback: Some(_), .. })
        ));
        assert_eq!(fallback.generate_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fallback_disabled_fails_after_primary() {
        let primary = Arc::new(ScriptedProvider::failing("hosted"));
        let fallback = Arc::new(legacy(ScriptedProvider::new("legacy")));
        let router = ProviderRouter::new(primary, Some(fallback.clone()), settings(true, false));

        let err = router
            .generate(&generate_request(GenerationKind::Subject))
            .err();
        assert!(matches!(
            err,
            Some(EngineError::GenerationFailed { fallback: None, .. })
        ));
        assert_eq!(fallback.generate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.capabilities().fallback, None);
    }

    #[test]
    fn disabled_primary_fails_fast_everywhere() {
        let primary = Arc::new(ScriptedProvider::new("hosted"));
        let fallback = Arc::new(legacy(ScriptedProvider::new("legacy")));
        let router = ProviderRouter::new(primary.clone(), Some(fallback.clone()), settings(false, true));

        assert!(matches!(
            router.generate(&generate_request(GenerationKind::Subject)),
            Err(EngineError::ProviderDisabled(_))
        ));
        assert!(matches!(
            router.poll_training("job-1"),
            Err(EngineError::ProviderDisabled(_))
        ));
        assert!(!router.health_check());
        assert!(!router.capabilities().supports_training());
        assert_eq!(primary.generate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fallback.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn multi_panel_requests_do_not_fall_back_to_single_panel_backend() {
        let primary = Arc::new(ScriptedProvider::failing("hosted"));
        let fallback = Arc::new(legacy(ScriptedProvider::new("legacy")));
        let router = ProviderRouter::new(primary, Some(fallback.clone()), settings(true, true));

        let err = router
            .generate(&generate_request(GenerationKind::MultiAngle))
            .err();
        assert!(matches!(err, Some(EngineError::GenerationFailed { .. })));
        assert_eq!(fallback.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn training_calls_map_provider_errors() {
        let primary = Arc::new(ScriptedProvider {
            start_fails: true,
            ..ScriptedProvider::new("hosted")
        }
        .with_polls(vec![Err("gateway timeout".to_string())], TrainingStatusReport::Pending));
        let router = ProviderRouter::new(primary, None, settings(true, false));

        let request = ProviderTrainingRequest {
            owner_id: "u1".to_string(),
            adapter_id: "a1".to_string(),
            training_images_uri: "mem://b/train.zip".to_string(),
            params: Map::new(),
        };
        assert!(matches!(
            router.start_training(&request),
            Err(EngineError::ProviderUnavailable(_))
        ));
        assert!(matches!(
            router.poll_training("job-1"),
            Err(EngineError::PollingTransient(message)) if message.contains("gateway timeout")
        ));
    }

    #[test]
    fn fallback_reasons_accumulate() {
        let reason = append_fallback_reason(None, "first.".to_string());
        let reason = append_fallback_reason(reason, " ".to_string());
        assert_eq!(
            append_fallback_reason(reason, "second.".to_string()).as_deref(),
            Some("first. second.")
        );
    }
}
