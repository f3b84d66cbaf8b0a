//! The token registry: records, sort preference and persistence.
//!
//! All state sits behind one async `RwLock`. Mutations hold the write guard
//! across the store call, so memory and disk change together or not at all.
//! Code computation snapshots the needed records under the read guard and
//! runs outside it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::totp::core;
use crate::totp::store::{PersistedRegistry, SecretStore};
use crate::totp::types::*;

/// Batches larger than this are split across blocking worker threads.
pub const PARALLEL_THRESHOLD: usize = 64;
const CHUNK_SIZE: usize = 32;

#[derive(Debug, Clone)]
struct RegistryState {
    tokens: Vec<TokenRecord>,
    sort_ascending: bool,
}

impl RegistryState {
    fn from_persisted(p: PersistedRegistry) -> Self {
        Self {
            tokens: p.tokens,
            sort_ascending: p.sort_ascending,
        }
    }

    fn to_persisted(&self) -> PersistedRegistry {
        PersistedRegistry::new(self.tokens.clone(), self.sort_ascending)
    }

    fn position(&self, id: &str) -> TotpResult<usize> {
        self.tokens
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| TotpError::not_found(id))
    }
}

pub struct TokenRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRegistry").finish_non_exhaustive()
    }
}

impl TokenRegistry {
    /// Load the registry from `store`; an empty store gives an empty registry.
    /// A snapshot with invalid records or repeated ids is refused.
    pub async fn open(store: Arc<dyn SecretStore>) -> TotpResult<Self> {
        let persisted = store.load().await?.unwrap_or_default();
        persisted.validate()?;
        log::info!("Token registry opened with {} tokens", persisted.tokens.len());
        Ok(Self {
            state: RwLock::new(RegistryState::from_persisted(persisted)),
            store,
        })
    }

    /// Apply `f` and persist the result; on any failure memory is restored.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RegistryState) -> TotpResult<T>,
    ) -> TotpResult<T> {
        let mut state = self.state.write().await;
        let backup = state.clone();
        let out = f(&mut *state)?;
        if let Err(e) = self.store.persist(&state.to_persisted()).await {
            log::error!("Persist failed, rolling back: {}", e);
            *state = backup;
            return Err(e);
        }
        Ok(out)
    }

    // ── CRUD ─────────────────────────────────────────────────────

    pub async fn add(&self, token: NewToken) -> TotpResult<TokenRecord> {
        let record = TokenRecord::from_new(token)?;
        let out = record.clone();
        self.mutate(move |s| {
            s.tokens.push(record);
            Ok(())
        })
        .await?;
        log::info!("Added token {} ({})", out.id, out.display_name());
        Ok(out)
    }

    /// Change display fields only. `None` leaves a field as it is.
    pub async fn update_metadata(
        &self,
        id: &str,
        issuer: Option<String>,
        name: Option<String>,
    ) -> TotpResult<()> {
        self.mutate(|s| {
            let idx = s.position(id)?;
            let token = &mut s.tokens[idx];
            if let Some(issuer) = issuer {
                token.issuer = issuer.trim().to_string();
            }
            if let Some(name) = name {
                token.name = name.trim().to_string();
            }
            Ok(())
        })
        .await?;
        log::debug!("Updated token {}", id);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> TotpResult<()> {
        self.mutate(|s| {
            let idx = s.position(id)?;
            s.tokens.remove(idx);
            Ok(())
        })
        .await?;
        log::info!("Deleted token {}", id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> TotpResult<TokenRecord> {
        let state = self.state.read().await;
        let idx = state.position(id)?;
        Ok(state.tokens[idx].clone())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tokens.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Filtered and sorted copy of the records; stored order is untouched.
    pub async fn list(&self, search_term: &str, sort_ascending: bool) -> Vec<TokenRecord> {
        let needle = search_term.trim().to_lowercase();
        let mut out: Vec<TokenRecord> = {
            let state = self.state.read().await;
            state.tokens.iter().filter(|t| t.matches(&needle)).cloned().collect()
        };
        sort_records(&mut out, sort_ascending);
        out
    }

    /// All records in insertion order.
    pub async fn records(&self) -> Vec<TokenRecord> {
        self.state.read().await.tokens.clone()
    }

    // ── Preferences ──────────────────────────────────────────────

    pub async fn sort_ascending(&self) -> bool {
        self.state.read().await.sort_ascending
    }

    pub async fn set_sort_ascending(&self, ascending: bool) -> TotpResult<()> {
        self.mutate(|s| {
            s.sort_ascending = ascending;
            Ok(())
        })
        .await
    }

    // ── Codes ────────────────────────────────────────────────────

    pub async fn get_code(&self, id: &str, at: f64) -> TotpResult<ComputedCode> {
        let record = self.get(id).await?;
        core::code_at(&record, at, true)
    }

    pub async fn get_next_code(&self, id: &str, at: f64) -> TotpResult<NextCode> {
        let record = self.get(id).await?;
        core::next_code_at(&record, at)
    }

    /// Codes for every id in `ids`; each id succeeds or fails on its own.
    pub async fn compute_codes(
        &self,
        ids: &[String],
        at: f64,
    ) -> HashMap<String, TotpResult<ComputedCode>> {
        let jobs: Vec<(String, Option<TokenRecord>)> = {
            let state = self.state.read().await;
            ids.iter()
                .map(|id| (id.clone(), state.tokens.iter().find(|t| &t.id == id).cloned()))
                .collect()
        };

        if jobs.len() <= PARALLEL_THRESHOLD {
            return compute_chunk(jobs, at).into_iter().collect();
        }

        let mut chunks = Vec::new();
        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            chunks.push(jobs.by_ref().take(CHUNK_SIZE).collect::<Vec<_>>());
        }
        log::debug!("Computing {} codes across {} workers", ids.len(), chunks.len());

        let handles = chunks.iter().cloned().map(|chunk| {
            tokio::task::spawn_blocking(move || compute_chunk(chunk, at))
        });
        let results = futures::future::join_all(handles).await;

        let mut out = HashMap::with_capacity(ids.len());
        for (chunk, result) in chunks.into_iter().zip(results) {
            match result {
                Ok(codes) => out.extend(codes),
                Err(e) => {
                    log::warn!("Code worker failed ({}); computing inline", e);
                    out.extend(compute_chunk(chunk, at));
                }
            }
        }
        out
    }

    // ── Import / maintenance ─────────────────────────────────────

    /// Insert parsed tokens, skipping ones whose issuer and secret match an
    /// existing record or an earlier entry of the same batch.
    pub async fn import(
        &self,
        format: ImportFormat,
        parsed: ParsedImport,
    ) -> TotpResult<ImportOutcome> {
        let mut outcome = ImportOutcome {
            format,
            accepted: 0,
            rejected: parsed.rejected,
            skipped_duplicate: 0,
            messages: parsed.messages,
            imported_ids: Vec::new(),
        };
        let drafts = parsed.tokens;

        let outcome = self
            .mutate(move |s| {
                for draft in drafts {
                    let label = if draft.name.is_empty() {
                        draft.issuer.clone()
                    } else {
                        format!("{} ({})", draft.issuer, draft.name)
                    };
                    let dup = s.tokens.iter().any(|t| {
                        t.issuer.eq_ignore_ascii_case(&draft.issuer) && t.secret == draft.secret
                    });
                    if dup {
                        outcome.skipped_duplicate += 1;
                        outcome.messages.push(format!("Skipped duplicate: {}", label));
                        continue;
                    }
                    match TokenRecord::from_new(draft) {
                        Ok(record) => {
                            outcome.imported_ids.push(record.id.clone());
                            s.tokens.push(record);
                            outcome.accepted += 1;
                        }
                        Err(e) => {
                            outcome.rejected += 1;
                            outcome.messages.push(format!("{}: {}", label, e.message));
                        }
                    }
                }
                Ok(outcome)
            })
            .await?;

        log::info!(
            "Imported {} tokens from {} ({} rejected, {} duplicates)",
            outcome.accepted,
            outcome.format,
            outcome.rejected,
            outcome.skipped_duplicate
        );
        Ok(outcome)
    }

    /// Groups of two or more records sharing issuer (case-insensitive) and
    /// secret, in insertion order.
    pub async fn find_duplicates(&self) -> Vec<Vec<TokenSummary>> {
        let state = self.state.read().await;
        let mut groups: Vec<(String, &[u8], Vec<TokenSummary>)> = Vec::new();
        for t in &state.tokens {
            let issuer = t.issuer.to_lowercase();
            match groups
                .iter_mut()
                .find(|(i, s, _)| *i == issuer && *s == t.secret.as_bytes())
            {
                Some((_, _, members)) => members.push(t.summary()),
                None => groups.push((issuer, t.secret.as_bytes(), vec![t.summary()])),
            }
        }
        groups
            .into_iter()
            .filter(|(_, _, members)| members.len() > 1)
            .map(|(_, _, members)| members)
            .collect()
    }

    /// Current state as a persistable snapshot.
    pub async fn snapshot(&self) -> PersistedRegistry {
        self.state.read().await.to_persisted()
    }

    /// Write the current state to the store again.
    pub async fn flush(&self) -> TotpResult<()> {
        let state = self.state.read().await;
        self.store.persist(&state.to_persisted()).await
    }
}

fn sort_records(records: &mut [TokenRecord], ascending: bool) {
    records.sort_by_cached_key(|t| (t.issuer.to_lowercase(), t.name.to_lowercase()));
    if !ascending {
        records.reverse();
    }
}

fn compute_chunk(
    jobs: Vec<(String, Option<TokenRecord>)>,
    at: f64,
) -> Vec<(String, TotpResult<ComputedCode>)> {
    jobs.into_iter()
        .map(|(id, record)| {
            let result = match record {
                Some(r) => core::code_at(&r, at, true),
                None => Err(TotpError::not_found(&id)),
            };
            (id, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::totp::store::MemoryStore;
    use tokio_test::{assert_err, assert_ok};

    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    async fn registry() -> (Arc<MemoryStore>, TokenRegistry) {
        let store = Arc::new(MemoryStore::new());
        let reg = TokenRegistry::open(store.clone()).await.unwrap();
        (store, reg)
    }

    fn draft(issuer: &str, name: &str) -> NewToken {
        NewToken::from_base32(issuer, name, RFC_SECRET).unwrap()
    }

    fn stored(id: &str, issuer: &str) -> TokenRecord {
        let mut record = TokenRecord::from_new(draft(issuer, "x")).unwrap();
        record.id = id.to_string();
        record
    }

    // ── Opening ──────────────────────────────────────────────────

    #[tokio::test]
    async fn open_refuses_repeated_ids() {
        let snapshot = PersistedRegistry::new(vec![stored("a", "First"), stored("a", "Dup")], true);
        let store = Arc::new(MemoryStore::with_registry(snapshot));
        let err = assert_err!(TokenRegistry::open(store).await);
        assert_eq!(err.kind, TotpErrorKind::PersistenceFailure);
        assert!(err.message.contains("more than once"), "{}", err.message);
    }

    #[tokio::test]
    async fn open_refuses_out_of_range_digits() {
        let mut bad = stored("b", "Nine");
        bad.digits = 9;
        let snapshot = PersistedRegistry::new(vec![stored("a", "Fine"), bad], true);
        let store = Arc::new(MemoryStore::with_registry(snapshot));
        let err = assert_err!(TokenRegistry::open(store.clone()).await);
        assert_eq!(err.kind, TotpErrorKind::PersistenceFailure);
        assert_eq!(store.persist_count(), 0);
    }

    #[tokio::test]
    async fn open_accepts_valid_snapshot() {
        let snapshot = PersistedRegistry::new(vec![stored("a", "A"), stored("b", "B")], false);
        let store = Arc::new(MemoryStore::with_registry(snapshot));
        let reg = assert_ok!(TokenRegistry::open(store).await);
        assert_eq!(reg.len().await, 2);
        assert!(!reg.sort_ascending().await);
        assert_ok!(reg.delete("a").await);
        assert_eq!(assert_err!(reg.delete("a").await).kind, TotpErrorKind::NotFound);
    }

    // ── CRUD ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn add_then_get_code() {
        let (store, reg) = registry().await;
        let rec = reg.add(draft("GitHub", "alice")).await.unwrap();
        assert_eq!(store.persist_count(), 1);

        let code = reg.get_code(&rec.id, 59.0).await.unwrap();
        assert_eq!(code.code, "287082");
        assert_eq!(code.time_remaining, 1.0);
        assert_eq!(code.next_code.as_deref(), Some("359152"));

        let next = reg.get_next_code(&rec.id, 59.0).await.unwrap();
        assert_eq!(next.code, "359152");
        assert_eq!(next.valid_in, 1.0);
    }

    #[tokio::test]
    async fn add_invalid_parameters_inserts_nothing() {
        let (store, reg) = registry().await;
        let err = reg.add(draft("X", "y").with_digits(9)).await.unwrap_err();
        assert_eq!(err.kind, TotpErrorKind::InvalidParameter);
        assert!(reg.is_empty().await);
        assert_eq!(store.persist_count(), 0);
    }

    #[tokio::test]
    async fn update_only_touches_display_fields() {
        let (_, reg) = registry().await;
        let rec = reg.add(draft("Old", "name")).await.unwrap();
        reg.update_metadata(&rec.id, Some("  New ".into()), None).await.unwrap();

        let got = reg.get(&rec.id).await.unwrap();
        assert_eq!(got.issuer, "New");
        assert_eq!(got.name, "name");
        assert_eq!(got.secret, rec.secret);
        assert_eq!(got.created_at, rec.created_at);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (_, reg) = registry().await;
        assert_eq!(reg.delete("nope").await.unwrap_err().kind, TotpErrorKind::NotFound);
        assert_eq!(
            reg.update_metadata("nope", None, None).await.unwrap_err().kind,
            TotpErrorKind::NotFound
        );
        assert_eq!(reg.get_code("nope", 0.0).await.unwrap_err().kind, TotpErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_twice() {
        let (_, reg) = registry().await;
        let rec = reg.add(draft("A", "a")).await.unwrap();
        assert_ok!(reg.delete(&rec.id).await);
        assert_err!(reg.delete(&rec.id).await);
    }

    // ── Listing ──────────────────────────────────────────────────

    #[tokio::test]
    async fn list_sorts_and_filters_without_reordering_storage() {
        let (_, reg) = registry().await;
        reg.add(draft("zeta", "b")).await.unwrap();
        reg.add(draft("Alpha", "z")).await.unwrap();
        reg.add(draft("alpha", "a")).await.unwrap();
        reg.add(draft("Mid", "needle")).await.unwrap();

        let asc: Vec<_> = reg.list("", true).await.into_iter().map(|t| t.name).collect();
        assert_eq!(asc, ["a", "z", "needle", "b"]);

        let desc: Vec<_> = reg.list("", false).await.into_iter().map(|t| t.name).collect();
        assert_eq!(desc, ["b", "needle", "z", "a"]);

        let hits = reg.list("NEED", true).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(reg.list("ALPHA", true).await.len(), 2);

        let stored: Vec<_> = reg.records().await.into_iter().map(|t| t.issuer).collect();
        assert_eq!(stored, ["zeta", "Alpha", "alpha", "Mid"]);
    }

    #[tokio::test]
    async fn sort_preference_persists() {
        let (store, reg) = registry().await;
        reg.set_sort_ascending(false).await.unwrap();
        assert!(!reg.sort_ascending().await);
        assert!(!store.saved().await.unwrap().sort_ascending);
    }

    // ── Batch codes ──────────────────────────────────────────────

    #[tokio::test]
    async fn batch_isolates_missing_ids() {
        let (_, reg) = registry().await;
        let a = reg.add(draft("A", "a")).await.unwrap();
        let b = reg.add(draft("B", "b")).await.unwrap();
        reg.delete(&b.id).await.unwrap();

        let ids = vec![a.id.clone(), b.id.clone(), "ghost".to_string()];
        let out = reg.compute_codes(&ids, 59.0).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[&a.id].as_ref().unwrap().code, "287082");
        assert_eq!(out[&b.id].as_ref().unwrap_err().kind, TotpErrorKind::NotFound);
        assert_eq!(out["ghost"].as_ref().unwrap_err().kind, TotpErrorKind::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_batch_matches_single_calls() {
        let (_, reg) = registry().await;
        let mut ids = Vec::new();
        for i in 0..150 {
            let t = draft(&format!("Svc{}", i), "u").with_digits(6 + (i % 3) as u8);
            ids.push(reg.add(t).await.unwrap().id);
        }
        ids.push("missing".into());

        let out = reg.compute_codes(&ids, 1_111_111_111.0).await;
        assert_eq!(out.len(), 151);
        for id in &ids[..150] {
            let single = reg.get_code(id, 1_111_111_111.0).await.unwrap();
            assert_eq!(out[id].as_ref().unwrap(), &single);
        }
        assert!(out["missing"].is_err());
    }

    // ── Persistence rollback ─────────────────────────────────────

    #[tokio::test]
    async fn failed_persist_rolls_back_every_mutation() {
        let (store, reg) = registry().await;
        let kept = reg.add(draft("Keep", "me")).await.unwrap();
        store.set_fail_persist(true);

        let err = reg.add(draft("New", "one")).await.unwrap_err();
        assert_eq!(err.kind, TotpErrorKind::PersistenceFailure);
        assert_eq!(reg.len().await, 1);

        assert_err!(reg.delete(&kept.id).await);
        assert_eq!(reg.len().await, 1);

        assert_err!(reg.update_metadata(&kept.id, Some("Changed".into()), None).await);
        assert_eq!(reg.get(&kept.id).await.unwrap().issuer, "Keep");

        assert_err!(reg.set_sort_ascending(false).await);
        assert!(reg.sort_ascending().await);

        store.set_fail_persist(false);
        assert_ok!(reg.delete(&kept.id).await);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn reopen_sees_persisted_state() {
        let (store, reg) = registry().await;
        let rec = reg.add(draft("GitHub", "alice")).await.unwrap();
        drop(reg);

        let reopened = TokenRegistry::open(store).await.unwrap();
        assert_eq!(reopened.get(&rec.id).await.unwrap(), rec);
    }

    // ── Concurrency ──────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_get_unique_ids() {
        let (_, reg) = registry().await;
        let reg = Arc::new(reg);
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.add(draft("Svc", &i.to_string())).await })
            })
            .collect();

        let mut ids = std::collections::HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 50);
        assert_eq!(reg.len().await, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_delete_succeeds_once() {
        let (_, reg) = registry().await;
        let reg = Arc::new(reg);
        let id = reg.add(draft("A", "a")).await.unwrap().id;

        let (r1, r2) = tokio::join!(
            {
                let (reg, id) = (reg.clone(), id.clone());
                tokio::spawn(async move { reg.delete(&id).await })
            },
            {
                let (reg, id) = (reg.clone(), id.clone());
                tokio::spawn(async move { reg.delete(&id).await })
            }
        );
        let results = [r1.unwrap(), r2.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(err.kind, TotpErrorKind::NotFound);
    }

    // ── Import / duplicates ──────────────────────────────────────

    #[tokio::test]
    async fn import_counts_and_skips_duplicates() {
        let (_, reg) = registry().await;
        reg.add(draft("GitHub", "alice")).await.unwrap();

        let mut parsed = ParsedImport::default();
        parsed.tokens.push(draft("github", "again"));
        parsed.tokens.push(draft("AWS", "bob"));
        parsed.tokens.push(draft("AWS", "bob"));
        parsed.tokens.push(draft("Bad", "digits").with_digits(4));
        parsed.rejected = 1;
        parsed.messages.push("Line 9: broken".into());

        let outcome = reg.import(ImportFormat::OtpAuthUri, parsed).await.unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.skipped_duplicate, 2);
        assert_eq!(outcome.rejected, 2);
        assert_eq!(outcome.imported_ids.len(), 1);
        assert_eq!(outcome.status(), ImportStatus::Partial);
        assert_eq!(reg.len().await, 2);
    }

    #[tokio::test]
    async fn import_rolls_back_on_persist_failure() {
        let (store, reg) = registry().await;
        store.set_fail_persist(true);
        let mut parsed = ParsedImport::default();
        parsed.tokens.push(draft("A", "a"));
        let err = reg.import(ImportFormat::OtpAuthUri, parsed).await.unwrap_err();
        assert_eq!(err.kind, TotpErrorKind::PersistenceFailure);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn duplicates_grouped_by_issuer_and_secret() {
        let (_, reg) = registry().await;
        reg.add(draft("GitHub", "a")).await.unwrap();
        reg.add(draft("github", "b")).await.unwrap();
        reg.add(draft("GitLab", "c")).await.unwrap();
        reg.add(NewToken::from_base32("GitHub", "d", "JBSWY3DPEHPK3PXP").unwrap())
            .await
            .unwrap();

        let groups = reg.find_duplicates().await;
        assert_eq!(groups.len(), 1);
        let names: Vec<_> = groups[0].iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
