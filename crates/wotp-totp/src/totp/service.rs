//! High-level orchestrator: owns the registry and the time source and
//! exposes the operations a UI or CLI calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wotp_time_ntp::time_ntp::{NtpStatus, PeriodicSync, ReferenceTimeProvider, TimeSource};

use crate::totp::core;
use crate::totp::export;
use crate::totp::import;
use crate::totp::registry::TokenRegistry;
use crate::totp::store::SecretStore;
use crate::totp::types::*;
use crate::totp::uri;

/// Central token service.
pub struct TokenService {
    registry: TokenRegistry,
    time: Arc<TimeSource>,
    provider: Arc<dyn ReferenceTimeProvider>,
    periodic: Mutex<Option<PeriodicSync>>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("time", &self.time.status())
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Load the registry from `store` and wire up the time source.
    pub async fn open(
        store: Arc<dyn SecretStore>,
        time: Arc<TimeSource>,
        provider: Arc<dyn ReferenceTimeProvider>,
    ) -> TotpResult<Self> {
        Ok(Self {
            registry: TokenRegistry::open(store).await?,
            time,
            provider,
            periodic: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn time_source(&self) -> &Arc<TimeSource> {
        &self.time
    }

    /// Corrected epoch seconds used for every code.
    pub fn now(&self) -> f64 {
        self.time.now()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Token CRUD
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Add a token with default parameters (6 digits, 30 s, SHA1).
    pub async fn add_token(&self, issuer: &str, name: &str, secret: &str) -> TotpResult<TokenSummary> {
        let token = NewToken::from_base32(issuer.trim(), name.trim(), secret)?;
        self.add_token_with(token).await
    }

    pub async fn add_token_with(&self, token: NewToken) -> TotpResult<TokenSummary> {
        Ok(self.registry.add(token).await?.summary())
    }

    pub async fn add_token_from_uri(&self, uri: &str) -> TotpResult<TokenSummary> {
        let token = uri::parse_otpauth_uri(uri.trim())?;
        self.add_token_with(token).await
    }

    pub async fn update_token(
        &self,
        id: &str,
        issuer: Option<&str>,
        name: Option<&str>,
    ) -> TotpResult<()> {
        self.registry
            .update_metadata(id, issuer.map(str::to_string), name.map(str::to_string))
            .await
    }

    pub async fn delete_token(&self, id: &str) -> TotpResult<()> {
        self.registry.delete(id).await
    }

    /// Filtered, sorted tokens with their current code.
    pub async fn list_tokens(&self, search_term: &str, sort_ascending: bool) -> TotpResult<Vec<TokenView>> {
        let at = self.time.now();
        self.registry
            .list(search_term, sort_ascending)
            .await
            .iter()
            .map(|record| -> TotpResult<TokenView> {
                let code = core::code_at(record, at, false)?;
                Ok(TokenView {
                    id: record.id.clone(),
                    issuer: record.issuer.clone(),
                    name: record.name.clone(),
                    code: code.code,
                    time_remaining: code.time_remaining,
                })
            })
            .collect()
    }

    pub async fn set_sort_ascending(&self, ascending: bool) -> TotpResult<()> {
        self.registry.set_sort_ascending(ascending).await
    }

    pub async fn find_duplicates(&self) -> Vec<Vec<TokenSummary>> {
        self.registry.find_duplicates().await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Codes
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn get_code(&self, id: &str) -> TotpResult<ComputedCode> {
        self.registry.get_code(id, self.time.now()).await
    }

    pub async fn get_next_code(&self, id: &str) -> TotpResult<NextCode> {
        self.registry.get_next_code(id, self.time.now()).await
    }

    pub async fn batch_get_codes(&self, ids: &[String]) -> HashMap<String, TotpResult<ComputedCode>> {
        self.registry.compute_codes(ids, self.time.now()).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Import / export
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn export_tokens(&self, format: ExportFormat) -> TotpResult<Vec<String>> {
        let records = self.registry.records().await;
        log::info!("Exporting {} tokens as {:?}", records.len(), format);
        export::export(&records, format)
    }

    /// Parse `payload` and add every usable entry. Fails only when the
    /// payload as a whole is unreadable or the store write fails.
    pub async fn import_tokens(&self, format: ImportFormat, payload: &str) -> TotpResult<ImportOutcome> {
        let (format, parsed) = import::parse(format, payload)?;
        self.registry.import(format, parsed).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Time
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn get_ntp_status(&self) -> NtpStatus {
        self.time.status()
    }

    pub async fn sync_ntp(&self) -> TotpResult<()> {
        let offset = self.time.sync(self.provider.as_ref()).await?;
        log::info!("Clock offset now {:.3} s", offset);
        Ok(())
    }

    /// Start background re-sync; replaces any running loop.
    pub fn start_periodic_sync(&self, interval: Duration) {
        let handle = self.time.spawn_periodic_sync(self.provider.clone(), interval);
        let mut slot = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.stop();
        }
    }

    pub fn stop_periodic_sync(&self) {
        let mut slot = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.stop();
        }
    }

    pub fn periodic_sync_running(&self) -> bool {
        self.periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, PeriodicSync::is_running)
    }

    /// Persist the registry again.
    pub async fn flush(&self) -> TotpResult<()> {
        self.registry.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::totp::store::MemoryStore;
    use async_trait::async_trait;
    use wotp_time_ntp::time_ntp::{
        ManualClock, ReferenceSample, SyncError, SyncOptions, SyncState,
    };

    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    /// Answers with a reference clock `skew` seconds ahead of `clock`.
    #[derive(Debug)]
    struct SkewedProvider {
        clock: Arc<ManualClock>,
        skew: Option<f64>,
    }

    #[async_trait]
    impl ReferenceTimeProvider for SkewedProvider {
        async fn query(&self) -> Result<ReferenceSample, SyncError> {
            use wotp_time_ntp::time_ntp::Clock;
            let skew = self
                .skew
                .ok_or_else(|| SyncError::Failed("unreachable".into()))?;
            let now = self.clock.now();
            Ok(ReferenceSample {
                reference_time: now + skew,
                round_trip: 0.0,
                received_at: now,
                server: Some("ref.test".into()),
            })
        }
    }

    async fn service_at(epoch: f64, skew: Option<f64>) -> (Arc<MemoryStore>, TokenService) {
        let clock = Arc::new(ManualClock::new(epoch));
        let time = Arc::new(TimeSource::new(
            clock.clone(),
            SyncOptions {
                timeout: Duration::from_secs(1),
                samples: 1,
                smoothing: false,
            },
        ));
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(SkewedProvider { clock, skew });
        let svc = TokenService::open(store.clone(), time, provider).await.unwrap();
        (store, svc)
    }

    // ── CRUD ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn add_list_and_codes() {
        let (_, svc) = service_at(59.0, None).await;
        let added = svc.add_token(" GitHub ", "alice", RFC_SECRET).await.unwrap();
        assert_eq!(added.issuer, "GitHub");

        let views = svc.list_tokens("", true).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].code, "287082");
        assert_eq!(views[0].time_remaining, 1.0);

        assert_eq!(svc.get_next_code(&added.id).await.unwrap().code, "359152");
    }

    #[tokio::test]
    async fn invalid_secret_inserts_nothing() {
        let (store, svc) = service_at(59.0, None).await;
        let err = svc.add_token("X", "y", "not*base32").await.unwrap_err();
        assert_eq!(err.kind, TotpErrorKind::InvalidSecret);
        assert!(svc.list_tokens("", true).await.unwrap().is_empty());
        assert_eq!(store.persist_count(), 0);
    }

    #[tokio::test]
    async fn add_from_uri_and_update() {
        let (_, svc) = service_at(0.0, None).await;
        let added = svc
            .add_token_from_uri("otpauth://totp/ACME%20Co:john@example.com?secret=JBSWY3DPEHPK3PXP&digits=8")
            .await
            .unwrap();
        assert_eq!(added.issuer, "ACME Co");
        assert_eq!(added.digits, 8);

        svc.update_token(&added.id, None, Some("jane")).await.unwrap();
        let views = svc.list_tokens("jane", true).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].code.len(), 8);

        svc.delete_token(&added.id).await.unwrap();
        assert_eq!(
            svc.delete_token(&added.id).await.unwrap_err().kind,
            TotpErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn batch_reports_each_id() {
        let (_, svc) = service_at(59.0, None).await;
        let a = svc.add_token("A", "a", RFC_SECRET).await.unwrap();
        let out = svc.batch_get_codes(&[a.id.clone(), "gone".into()]).await;
        assert_eq!(out[&a.id].as_ref().unwrap().next_code.as_deref(), Some("359152"));
        assert!(out["gone"].is_err());
    }

    // ── Import / export ──────────────────────────────────────────

    #[tokio::test]
    async fn ten_line_import_with_one_bad_secret() {
        let (_, svc) = service_at(0.0, None).await;
        let payload: Vec<String> = (0..10)
            .map(|i| {
                let secret = if i == 3 { "SHORT" } else { "JBSWY3DPEHPK3PXPJBSWY3DP" };
                format!("otpauth://totp/Svc{}:user?secret={}", i, secret)
            })
            .collect();

        let outcome = svc
            .import_tokens(ImportFormat::Auto, &payload.join("\n"))
            .await
            .unwrap();
        assert_eq!(outcome.format, ImportFormat::OtpAuthUri);
        assert_eq!(outcome.accepted, 9);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.status(), ImportStatus::Partial);
        assert_eq!(svc.list_tokens("", true).await.unwrap().len(), 9);

        let err = outcome.ensure_complete().unwrap_err();
        assert_eq!(err.kind, TotpErrorKind::PartialImportFailure);
        assert_eq!(err.message, "1 of 10 entries could not be imported");
    }

    #[tokio::test]
    async fn unreadable_payload_fails_whole_import() {
        let (_, svc) = service_at(0.0, None).await;
        let err = svc.import_tokens(ImportFormat::Auto, "garbage").await.unwrap_err();
        assert_eq!(err.kind, TotpErrorKind::InvalidFormat);
    }

    #[tokio::test]
    async fn export_then_import_elsewhere() {
        let (_, svc) = service_at(0.0, None).await;
        svc.add_token("GitHub", "alice", RFC_SECRET).await.unwrap();
        svc.add_token("AWS", "bob", "JBSWY3DPEHPK3PXP").await.unwrap();

        let uris = svc.export_tokens(ExportFormat::OtpAuthUris).await.unwrap();
        assert_eq!(uris.len(), 2);

        let (_, other) = service_at(0.0, None).await;
        let outcome = other
            .import_tokens(ImportFormat::OtpAuthUri, &uris.join("\n"))
            .await
            .unwrap();
        assert_eq!(outcome.status(), ImportStatus::Complete);

        // a second import of the same payload is all duplicates
        let again = other
            .import_tokens(ImportFormat::OtpAuthUri, &uris.join("\n"))
            .await
            .unwrap();
        assert_eq!(again.skipped_duplicate, 2);
        assert_eq!(again.status(), ImportStatus::NothingImported);
    }

    // ── Time ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_shifts_codes() {
        let (_, svc) = service_at(29.0, Some(30.0)).await;
        let a = svc.add_token("A", "a", RFC_SECRET).await.unwrap();
        let before = svc.get_code(&a.id).await.unwrap();
        assert_eq!(svc.get_ntp_status().state, SyncState::Unsynced);

        svc.sync_ntp().await.unwrap();
        let status = svc.get_ntp_status();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.offset_ms, Some(30_000.0));
        assert_eq!(status.last_server.as_deref(), Some("ref.test"));

        let after = svc.get_code(&a.id).await.unwrap();
        assert_eq!(after.code, "287082");
        assert_eq!(before.next_code.as_deref(), Some(after.code.as_str()));
    }

    #[tokio::test]
    async fn failed_sync_is_typed_and_keeps_clock() {
        let (_, svc) = service_at(100.0, None).await;
        let err = svc.sync_ntp().await.unwrap_err();
        assert_eq!(err.kind, TotpErrorKind::SyncFailure);
        assert_eq!(svc.now(), 100.0);
        let status = svc.get_ntp_status();
        assert_eq!(status.state, SyncState::Unsynced);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn periodic_sync_handle() {
        let (_, svc) = service_at(100.0, Some(1.0)).await;
        svc.start_periodic_sync(Duration::from_secs(300));
        assert!(svc.periodic_sync_running());
        svc.stop_periodic_sync();
        assert!(!svc.periodic_sync_running());
    }
}
