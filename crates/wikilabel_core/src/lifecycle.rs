//! Cache pull-through, cluster views, and the suggestion lifecycle.
//!
//! A suggestion moves `pending -> applied` and nothing else. Regeneration
//! replaces every suggestion of a cluster with a freshly generated set.

use anyhow::{Context, Result};

use crate::cluster::{
    analyze_label_patterns, find_clusters, find_members, find_members_extended, find_orphans,
    label_vocabulary,
};
use crate::config::{GeneratorSettings, StrategyChoice};
use crate::error::LabelError;
use crate::model::{
    ClusterInfo, NewSuggestion, Page, PageInput, Space, Suggestion, SuggestionKind,
    SuggestionStatus, directory_labels,
};
use crate::source::SourceApi;
use crate::store::{CacheStore, utc_timestamp};
use crate::suggest::{PageFailure, SuggestionStrategy, build_strategy, generate_batch};

#[derive(Debug, Clone)]
pub struct ReindexReport {
    pub space_key: String,
    pub removed: usize,
    /// Pages fetched right away, when a refetch was requested.
    pub fetched: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PendingSuggestionView {
    pub suggestion: Suggestion,
    pub page_title: String,
}

#[derive(Debug, Clone)]
pub struct ClusterDetail {
    pub cluster: Page,
    pub directory_labels: Vec<String>,
    /// Direct children only.
    pub members: Vec<Page>,
    pub pending: Vec<PendingSuggestionView>,
}

#[derive(Debug, Clone)]
pub struct GeneratedRow {
    pub id: i64,
    pub page_id: String,
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct RegenerateReport {
    pub cluster_id: String,
    pub strategy: String,
    pub candidate_pages: usize,
    pub removed: usize,
    pub created: Vec<GeneratedRow>,
    pub failures: Vec<PageFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub id: i64,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_count: usize,
    pub outcomes: Vec<ApplyOutcome>,
}

impl ApplyReport {
    fn record(&mut self, id: i64, action: &str, detail: Option<String>) {
        match action {
            "applied" => self.success_count += 1,
            "skipped" => self.skipped_count += 1,
            _ => self.error_count += 1,
        }
        self.outcomes.push(ApplyOutcome {
            id,
            action: action.to_string(),
            detail,
        });
    }
}

/// Core operations over an explicit cache and source.
pub struct LabelLifecycle<'a, S, A> {
    store: &'a S,
    source: &'a mut A,
    marker_label: String,
}

impl<'a, S: CacheStore, A: SourceApi> LabelLifecycle<'a, S, A> {
    pub fn new(store: &'a S, source: &'a mut A, marker_label: impl Into<String>) -> Self {
        Self {
            store,
            source,
            marker_label: marker_label.into(),
        }
    }

    pub fn marker_label(&self) -> &str {
        &self.marker_label
    }

    /// Cached spaces, fetched and written through with a fresh `last_indexed`
    /// when the cache is empty or `refresh` is set.
    pub fn ensure_spaces(&mut self, refresh: bool) -> Result<Vec<Space>> {
        let cached = self.store.list_spaces()?;
        if !cached.is_empty() && !refresh {
            return Ok(cached);
        }
        let listed_at = utc_timestamp();
        let fetched = self
            .source
            .list_spaces()
            .context("failed to fetch spaces from source")?
            .into_iter()
            .map(|space| Space {
                last_indexed: Some(listed_at.clone()),
                ..space
            })
            .collect::<Vec<_>>();
        self.store.put_spaces(&fetched)?;
        tracing::info!(count = fetched.len(), "cached spaces from source");
        self.store.list_spaces()
    }

    /// Cached pages of a space; on an empty cache they are fetched, written
    /// through, and the space is stamped as indexed.
    pub fn space_pages(&mut self, space_key: &str) -> Result<Vec<Page>> {
        let cached = self.store.get_pages(space_key)?;
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.fetch_space(space_key)?;
        self.store.get_pages(space_key)
    }

    /// Drop the cached pages of a space, optionally refetching them at once.
    pub fn reindex(&mut self, space_key: &str, fetch: bool) -> Result<ReindexReport> {
        let removed = self.store.delete_pages(space_key)?;
        tracing::info!(space_key, removed, "cleared cached pages");
        let fetched = if fetch {
            Some(self.fetch_space(space_key)?)
        } else {
            None
        };
        Ok(ReindexReport {
            space_key: space_key.to_string(),
            removed,
            fetched,
        })
    }

    fn fetch_space(&mut self, space_key: &str) -> Result<usize> {
        let pages = self
            .source
            .list_pages(space_key)
            .with_context(|| format!("failed to fetch pages of space {space_key}"))?;
        self.store.put_pages(space_key, &pages)?;
        if !self.store.mark_space_indexed(space_key, &utc_timestamp())? {
            tracing::debug!(space_key, "space not listed yet; index stamp skipped");
        }
        tracing::info!(space_key, pages = pages.len(), "cached pages from source");
        Ok(pages.len())
    }

    pub fn clusters(&mut self, space_key: &str) -> Result<Vec<Page>> {
        let pages = self.space_pages(space_key)?;
        Ok(find_clusters(&pages, &self.marker_label)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn orphans(&mut self, space_key: &str) -> Result<Vec<Page>> {
        let pages = self.space_pages(space_key)?;
        let clusters = find_clusters(&pages, &self.marker_label);
        Ok(find_orphans(&pages, &clusters).into_iter().cloned().collect())
    }

    /// Label frequencies of a space, most used first.
    pub fn label_vocabulary(&mut self, space_key: &str) -> Result<Vec<(String, usize)>> {
        let pages = self.space_pages(space_key)?;
        Ok(label_vocabulary(&analyze_label_patterns(&pages)))
    }

    fn load_cluster(&self, cluster_id: &str) -> Result<Page, LabelError> {
        match self.store.get_cluster_root(cluster_id)? {
            Some(page) if page.has_label(&self.marker_label) => Ok(page),
            Some(_) => {
                tracing::debug!(cluster_id, marker = %self.marker_label, "page is not a cluster");
                Err(LabelError::ClusterNotFound(cluster_id.to_string()))
            }
            None => Err(LabelError::ClusterNotFound(cluster_id.to_string())),
        }
    }

    /// Cluster page, its direct children, and its pending suggestions.
    pub fn cluster_detail(&mut self, cluster_id: &str) -> Result<ClusterDetail, LabelError> {
        let cluster = self.load_cluster(cluster_id)?;
        let pages = self.space_pages(&cluster.space_key)?;
        let members = find_members(&pages, cluster_id)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        let pending = self
            .store
            .get_suggestions(cluster_id, Some(SuggestionStatus::Pending))?
            .into_iter()
            .map(|suggestion| {
                let page_title = pages
                    .iter()
                    .find(|page| page.id == suggestion.page_id)
                    .map(|page| page.title.clone())
                    .unwrap_or_else(|| suggestion.page_id.clone());
                PendingSuggestionView {
                    suggestion,
                    page_title,
                }
            })
            .collect();
        Ok(ClusterDetail {
            directory_labels: directory_labels(&cluster.labels, &self.marker_label),
            cluster,
            members,
            pending,
        })
    }

    /// Resolve the strategy from settings, then regenerate. Both the cluster
    /// lookup and the credential check happen before anything is written.
    pub fn regenerate_with_settings(
        &mut self,
        cluster_id: &str,
        settings: &GeneratorSettings,
        requested: Option<StrategyChoice>,
    ) -> Result<RegenerateReport, LabelError> {
        self.load_cluster(cluster_id)?;
        let mut strategy = build_strategy(settings, requested)?;
        self.regenerate(cluster_id, strategy.as_mut())
    }

    /// Replace every suggestion of `cluster_id` with a freshly generated set
    /// over the extended member pool.
    pub fn regenerate(
        &mut self,
        cluster_id: &str,
        strategy: &mut dyn SuggestionStrategy,
    ) -> Result<RegenerateReport, LabelError> {
        let cluster_page = self.load_cluster(cluster_id)?;
        let pages = self.space_pages(&cluster_page.space_key)?;
        let cluster = ClusterInfo::from_page(&cluster_page, &self.marker_label);
        let candidates = find_members_extended(
            &pages,
            cluster_id,
            &cluster_page.labels,
            &self.marker_label,
        );
        let vocabulary = label_vocabulary(&analyze_label_patterns(&pages))
            .into_iter()
            .map(|(label, _)| label)
            .collect::<Vec<_>>();

        let mut inputs = Vec::with_capacity(candidates.len());
        for page in &candidates {
            let content = if strategy.needs_content() {
                match self.source.get_page_content(&page.id) {
                    Ok(content) => Some(content),
                    Err(error) => {
                        tracing::warn!(page_id = %page.id, error = %format!("{error:#}"), "failed to fetch page content");
                        None
                    }
                }
            } else {
                None
            };
            inputs.push(PageInput {
                page: (*page).clone(),
                content,
            });
        }

        let outcome = generate_batch(strategy, &inputs, &vocabulary, &cluster);
        let created_date = utc_timestamp();
        let mut fresh = Vec::with_capacity(outcome.suggestion_count());
        for page in &candidates {
            let Some(suggestions) = outcome.suggestions.get(&page.id) else {
                continue;
            };
            for suggestion in suggestions {
                fresh.push(NewSuggestion {
                    cluster_id: cluster_id.to_string(),
                    page_id: page.id.clone(),
                    kind: SuggestionKind::Label,
                    suggestion_text: suggestion.label.clone(),
                    confidence_score: suggestion.confidence,
                    reason: Some(suggestion.reason.clone()).filter(|reason| !reason.is_empty()),
                    created_date: created_date.clone(),
                });
            }
        }

        let replaced = self.store.replace_suggestions(cluster_id, &fresh)?;
        let removed = replaced.removed;
        let created = replaced
            .ids
            .into_iter()
            .zip(&fresh)
            .map(|(id, suggestion)| GeneratedRow {
                id,
                page_id: suggestion.page_id.clone(),
                label: suggestion.suggestion_text.clone(),
                confidence: suggestion.confidence_score,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            cluster_id,
            strategy = strategy.name(),
            candidates = candidates.len(),
            removed,
            created = created.len(),
            failed_pages = outcome.failures.len(),
            "regenerated cluster suggestions"
        );

        Ok(RegenerateReport {
            cluster_id: cluster_id.to_string(),
            strategy: strategy.name().to_string(),
            candidate_pages: candidates.len(),
            removed,
            created,
            failures: outcome.failures,
        })
    }

    /// Apply each suggestion independently; one failure never stops the batch.
    pub fn apply(&mut self, ids: &[i64]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for &id in ids {
            match self.apply_one(id) {
                Ok((action, detail)) => {
                    tracing::info!(id, action, detail = detail.as_deref().unwrap_or(""), "apply outcome");
                    report.record(id, action, detail);
                }
                Err(error) => {
                    let detail = format!("{error:#}");
                    tracing::warn!(id, error = %detail, "failed to apply suggestion");
                    report.record(id, "error", Some(detail));
                }
            }
        }
        tracing::info!(
            success = report.success_count,
            errors = report.error_count,
            skipped = report.skipped_count,
            "applied suggestions"
        );
        report
    }

    fn apply_one(&mut self, id: i64) -> Result<(&'static str, Option<String>)> {
        let Some(suggestion) = self.store.get_suggestion(id)? else {
            anyhow::bail!("suggestion {id} not found");
        };
        if suggestion.status != SuggestionStatus::Pending {
            return Ok(("skipped", Some(format!("already {}", suggestion.status))));
        }
        if suggestion.kind != SuggestionKind::Label {
            anyhow::bail!(
                "suggestion {id} has unsupported type {}",
                suggestion.kind.as_str()
            );
        }

        self.source
            .add_label(&suggestion.page_id, &suggestion.suggestion_text)
            .with_context(|| {
                format!(
                    "source rejected label {:?} for page {}",
                    suggestion.suggestion_text, suggestion.page_id
                )
            })?;
        self.store
            .update_suggestion_status(id, SuggestionStatus::Applied, Some(&utc_timestamp()))?;
        match self
            .store
            .append_page_label(&suggestion.page_id, &suggestion.suggestion_text)
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(page_id = %suggestion.page_id, "cached page already holds label or is not cached");
            }
            Err(error) => {
                tracing::warn!(page_id = %suggestion.page_id, error = %format!("{error:#}"), "failed to update cached labels");
            }
        }
        Ok((
            "applied",
            Some(format!(
                "{} -> page {}",
                suggestion.suggestion_text, suggestion.page_id
            )),
        ))
    }
}
