//! SQLite cache mirroring spaces, pages and suggestions from the wiki.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::migrate::{ensure_db_parent, migrate_connection, open_connection};
use crate::model::{
    NewSuggestion, Page, Space, Suggestion, SuggestionKind, SuggestionStatus, contains_label,
};
use crate::runtime::ResolvedPaths;

/// Read/write contract the core logic needs from the cache.
pub trait CacheStore {
    fn list_spaces(&self) -> Result<Vec<Space>>;
    /// Upsert keyed by space key.
    fn put_spaces(&self, spaces: &[Space]) -> Result<()>;
    /// Stamp `last_indexed` on a listed space. Rows only come from the space
    /// listing, so an unlisted key is left alone and false is returned.
    fn mark_space_indexed(&self, space_key: &str, indexed_at: &str) -> Result<bool>;

    /// Cached pages of a space in insertion order; empty when nothing is cached.
    fn get_pages(&self, space_key: &str) -> Result<Vec<Page>>;
    /// Upsert keyed by page id.
    fn put_pages(&self, space_key: &str, pages: &[Page]) -> Result<()>;
    fn get_page(&self, page_id: &str) -> Result<Option<Page>>;
    fn delete_pages(&self, space_key: &str) -> Result<usize>;
    /// Append a label to a cached page as one atomic read-modify-write.
    /// Returns false when the page is missing or already holds the label.
    fn append_page_label(&self, page_id: &str, label: &str) -> Result<bool>;

    fn get_suggestions(
        &self,
        cluster_id: &str,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<Suggestion>>;
    fn get_suggestion(&self, id: i64) -> Result<Option<Suggestion>>;
    fn put_suggestion(&self, suggestion: &NewSuggestion) -> Result<i64>;
    fn delete_suggestions(&self, cluster_id: &str) -> Result<usize>;
    /// Delete every suggestion of the cluster and insert `suggestions` in one transaction.
    fn replace_suggestions(
        &self,
        cluster_id: &str,
        suggestions: &[NewSuggestion],
    ) -> Result<ReplacedSuggestions>;
    fn update_suggestion_status(
        &self,
        id: i64,
        status: SuggestionStatus,
        applied_at: Option<&str>,
    ) -> Result<bool>;

    fn get_cluster_root(&self, page_id: &str) -> Result<Option<Page>> {
        self.get_page(page_id)
    }
}

/// Result of one [`CacheStore::replace_suggestions`] transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacedSuggestions {
    /// Rows the delete removed.
    pub removed: usize,
    /// Ids of the inserted rows, in input order.
    pub ids: Vec<i64>,
}

pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        Self::open_at(&paths.db_path)
    }

    pub fn open_at(db_path: &Path) -> Result<Self> {
        ensure_db_parent(db_path)?;
        let connection = open_connection(db_path)?;
        migrate_connection(&connection)?;
        Ok(Self { connection })
    }

    fn immediate_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.connection, TransactionBehavior::Immediate)
            .context("failed to start cache transaction")
    }
}

const SUGGESTION_COLUMNS: &str = "id, cluster_id, page_id, type, suggestion_text, confidence_score, status, created_date, applied_date, reason";

impl CacheStore for SqliteStore {
    fn list_spaces(&self) -> Result<Vec<Space>> {
        let mut statement = self
            .connection
            .prepare("SELECT key, name, last_indexed FROM spaces ORDER BY key")
            .context("failed to prepare spaces query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(Space {
                    key: row.get(0)?,
                    name: row.get(1)?,
                    last_indexed: row.get(2)?,
                })
            })
            .context("failed to run spaces query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode space row")?);
        }
        Ok(out)
    }

    fn put_spaces(&self, spaces: &[Space]) -> Result<()> {
        let transaction = self.immediate_transaction()?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO spaces (key, name, last_indexed) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        name = excluded.name,
                        last_indexed = COALESCE(excluded.last_indexed, spaces.last_indexed)",
                )
                .context("failed to prepare spaces upsert")?;
            for space in spaces {
                statement
                    .execute(params![space.key, space.name, space.last_indexed])
                    .with_context(|| format!("failed to upsert space {}", space.key))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit spaces upsert")
    }

    fn mark_space_indexed(&self, space_key: &str, indexed_at: &str) -> Result<bool> {
        let affected = self
            .connection
            .execute(
                "UPDATE spaces SET last_indexed = ?2 WHERE key = ?1",
                params![space_key, indexed_at],
            )
            .with_context(|| format!("failed to stamp last_indexed for space {space_key}"))?;
        Ok(affected > 0)
    }

    fn get_pages(&self, space_key: &str) -> Result<Vec<Page>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT id, space_key, title, parent_id, labels_json
                 FROM pages WHERE space_key = ?1 ORDER BY rowid",
            )
            .context("failed to prepare pages query")?;
        let rows = statement
            .query_map([space_key], page_from_row)
            .with_context(|| format!("failed to query pages for space {space_key}"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode page row")?);
        }
        Ok(out)
    }

    fn put_pages(&self, space_key: &str, pages: &[Page]) -> Result<()> {
        let fetched_at = utc_timestamp();
        let transaction = self.immediate_transaction()?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO pages (id, space_key, title, parent_id, labels_json, last_fetched)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        space_key = excluded.space_key,
                        title = excluded.title,
                        parent_id = excluded.parent_id,
                        labels_json = excluded.labels_json,
                        last_fetched = excluded.last_fetched",
                )
                .context("failed to prepare pages upsert")?;
            for page in pages {
                let labels_json = serde_json::to_string(&page.labels)
                    .context("failed to encode page labels")?;
                statement
                    .execute(params![
                        page.id,
                        space_key,
                        page.title,
                        page.parent_id,
                        labels_json,
                        fetched_at
                    ])
                    .with_context(|| format!("failed to upsert page {}", page.id))?;
            }
        }
        transaction.commit().context("failed to commit pages upsert")
    }

    fn get_page(&self, page_id: &str) -> Result<Option<Page>> {
        self.connection
            .query_row(
                "SELECT id, space_key, title, parent_id, labels_json FROM pages WHERE id = ?1",
                [page_id],
                page_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load page {page_id}"))
    }

    fn delete_pages(&self, space_key: &str) -> Result<usize> {
        self.connection
            .execute("DELETE FROM pages WHERE space_key = ?1", [space_key])
            .with_context(|| format!("failed to delete cached pages for space {space_key}"))
    }

    fn append_page_label(&self, page_id: &str, label: &str) -> Result<bool> {
        let transaction = self.immediate_transaction()?;
        let stored: Option<Option<String>> = transaction
            .query_row(
                "SELECT labels_json FROM pages WHERE id = ?1",
                [page_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read labels of page {page_id}"))?;
        let Some(stored) = stored else {
            return Ok(false);
        };

        let mut labels = decode_labels(page_id, stored.as_deref());
        if contains_label(&labels, label) {
            return Ok(false);
        }
        labels.push(label.to_string());
        let encoded = serde_json::to_string(&labels).context("failed to encode page labels")?;
        transaction
            .execute(
                "UPDATE pages SET labels_json = ?1 WHERE id = ?2",
                params![encoded, page_id],
            )
            .with_context(|| format!("failed to update labels of page {page_id}"))?;
        transaction
            .commit()
            .context("failed to commit page label append")?;
        Ok(true)
    }

    fn get_suggestions(
        &self,
        cluster_id: &str,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<Suggestion>> {
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM suggestions
             WHERE cluster_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id"
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare suggestions query")?;
        let rows = statement
            .query_map(
                params![cluster_id, status.map(SuggestionStatus::as_str)],
                suggestion_from_row,
            )
            .with_context(|| format!("failed to query suggestions for cluster {cluster_id}"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode suggestion row")?);
        }
        Ok(out)
    }

    fn get_suggestion(&self, id: i64) -> Result<Option<Suggestion>> {
        let sql = format!("SELECT {SUGGESTION_COLUMNS} FROM suggestions WHERE id = ?1");
        self.connection
            .query_row(&sql, [id], suggestion_from_row)
            .optional()
            .with_context(|| format!("failed to load suggestion {id}"))
    }

    fn put_suggestion(&self, suggestion: &NewSuggestion) -> Result<i64> {
        insert_suggestion(&self.connection, suggestion)
    }

    fn delete_suggestions(&self, cluster_id: &str) -> Result<usize> {
        self.connection
            .execute("DELETE FROM suggestions WHERE cluster_id = ?1", [cluster_id])
            .with_context(|| format!("failed to delete suggestions for cluster {cluster_id}"))
    }

    fn replace_suggestions(
        &self,
        cluster_id: &str,
        suggestions: &[NewSuggestion],
    ) -> Result<ReplacedSuggestions> {
        let transaction = self.immediate_transaction()?;
        let removed = transaction
            .execute("DELETE FROM suggestions WHERE cluster_id = ?1", [cluster_id])
            .with_context(|| format!("failed to clear suggestions for cluster {cluster_id}"))?;
        let mut ids = Vec::with_capacity(suggestions.len());
        for suggestion in suggestions {
            ids.push(insert_suggestion(&transaction, suggestion)?);
        }
        transaction
            .commit()
            .context("failed to commit suggestion regeneration")?;
        Ok(ReplacedSuggestions { removed, ids })
    }

    fn update_suggestion_status(
        &self,
        id: i64,
        status: SuggestionStatus,
        applied_at: Option<&str>,
    ) -> Result<bool> {
        let affected = self
            .connection
            .execute(
                "UPDATE suggestions SET status = ?1, applied_date = ?2 WHERE id = ?3",
                params![status.as_str(), applied_at, id],
            )
            .with_context(|| format!("failed to update status of suggestion {id}"))?;
        Ok(affected > 0)
    }
}

/// Current UTC time in the format stored in every date column.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn insert_suggestion(connection: &Connection, suggestion: &NewSuggestion) -> Result<i64> {
    connection
        .execute(
            "INSERT INTO suggestions (
                cluster_id, page_id, type, suggestion_text, confidence_score, status,
                created_date, applied_date, reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)",
            params![
                suggestion.cluster_id,
                suggestion.page_id,
                suggestion.kind.as_str(),
                suggestion.suggestion_text,
                suggestion.confidence_score,
                SuggestionStatus::Pending.as_str(),
                suggestion.created_date,
                suggestion.reason,
            ],
        )
        .with_context(|| {
            format!(
                "failed to insert suggestion {:?} for page {}",
                suggestion.suggestion_text, suggestion.page_id
            )
        })?;
    Ok(connection.last_insert_rowid())
}

fn page_from_row(row: &Row<'_>) -> rusqlite::Result<Page> {
    let id: String = row.get(0)?;
    let labels_json: Option<String> = row.get(4)?;
    let labels = decode_labels(&id, labels_json.as_deref());
    Ok(Page {
        id,
        space_key: row.get(1)?,
        title: row.get(2)?,
        parent_id: row.get(3)?,
        labels,
    })
}

fn suggestion_from_row(row: &Row<'_>) -> rusqlite::Result<Suggestion> {
    let status_text: String = row.get(6)?;
    let status = SuggestionStatus::parse(&status_text).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, error.into())
    })?;
    let kind_text: String = row.get(3)?;
    Ok(Suggestion {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        page_id: row.get(2)?,
        kind: SuggestionKind::parse(&kind_text),
        suggestion_text: row.get(4)?,
        confidence_score: row.get(5)?,
        status,
        created_date: row.get(7)?,
        applied_date: row.get(8)?,
        reason: row.get(9)?,
    })
}

fn decode_labels(page_id: &str, labels_json: Option<&str>) -> Vec<String> {
    let Some(raw) = labels_json.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(labels) => labels,
        Err(error) => {
            tracing::warn!(page_id, %error, "ignoring unreadable cached labels");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open_at(&temp.path().join("data").join("cache.db"))
            .expect("open store");
        (temp, store)
    }

    fn page(id: &str, parent: Option<&str>, labels: &[&str]) -> Page {
        Page {
            id: id.to_string(),
            space_key: "ENG".to_string(),
            title: format!("Page {id}"),
            parent_id: parent.map(ToString::to_string),
            labels: labels.iter().map(ToString::to_string).collect(),
        }
    }

    fn new_suggestion(cluster: &str, page_id: &str, label: &str) -> NewSuggestion {
        NewSuggestion {
            cluster_id: cluster.to_string(),
            page_id: page_id.to_string(),
            kind: SuggestionKind::Label,
            suggestion_text: label.to_string(),
            confidence_score: 0.75,
            reason: None,
            created_date: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn pages_round_trip_in_insertion_order() {
        let (_temp, store) = open_store();
        assert!(store.get_pages("ENG").expect("empty").is_empty());

        store
            .put_pages(
                "ENG",
                &[page("2", None, &["directory_page"]), page("1", Some("2"), &[])],
            )
            .expect("put pages");
        let pages = store.get_pages("ENG").expect("pages");
        assert_eq!(
            pages.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["2", "1"]
        );
        assert_eq!(pages[1].parent_id.as_deref(), Some("2"));
        assert_eq!(pages[0].labels, vec!["directory_page".to_string()]);
    }

    #[test]
    fn put_pages_upserts_by_id() {
        let (_temp, store) = open_store();
        store
            .put_pages("ENG", &[page("1", None, &["a"])])
            .expect("first put");
        let mut renamed = page("1", None, &["a", "b"]);
        renamed.title = "Renamed".to_string();
        store.put_pages("ENG", &[renamed]).expect("second put");

        let pages = store.get_pages("ENG").expect("pages");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].title, "Renamed");
        assert_eq!(pages[0].labels.len(), 2);
    }

    #[test]
    fn null_or_broken_labels_read_as_empty() {
        let (_temp, store) = open_store();
        store
            .connection
            .execute(
                "INSERT INTO pages (id, space_key, title, parent_id, labels_json) VALUES
                 ('n', 'ENG', 'Null', NULL, ''), ('b', 'ENG', 'Broken', NULL, '{oops')",
                [],
            )
            .expect("insert raw rows");
        let pages = store.get_pages("ENG").expect("pages");
        assert!(pages.iter().all(|page| page.labels.is_empty()));
    }

    #[test]
    fn delete_pages_only_touches_one_space() {
        let (_temp, store) = open_store();
        store.put_pages("ENG", &[page("1", None, &[])]).expect("eng");
        let mut ops = page("9", None, &[]);
        ops.space_key = "OPS".to_string();
        store.put_pages("OPS", &[ops]).expect("ops");

        assert_eq!(store.delete_pages("ENG").expect("delete"), 1);
        assert!(store.get_pages("ENG").expect("eng").is_empty());
        assert_eq!(store.get_pages("OPS").expect("ops").len(), 1);
    }

    #[test]
    fn append_page_label_refuses_duplicates_in_any_case() {
        let (_temp, store) = open_store();
        store
            .put_pages("ENG", &[page("1", None, &["Billing"])])
            .expect("put");

        assert!(!store.append_page_label("1", "billing").expect("dup"));
        assert!(store.append_page_label("1", "api").expect("append"));
        assert!(!store.append_page_label("missing", "api").expect("missing"));

        let cached = store.get_page("1").expect("get").expect("present");
        assert_eq!(cached.labels, vec!["Billing".to_string(), "api".to_string()]);
    }

    #[test]
    fn spaces_upsert_and_index_stamp() {
        let (_temp, store) = open_store();
        store
            .put_spaces(&[Space {
                key: "ENG".to_string(),
                name: "Engineering".to_string(),
                last_indexed: None,
            }])
            .expect("put spaces");
        assert!(
            store
                .mark_space_indexed("ENG", "2026-02-01T00:00:00Z")
                .expect("stamp")
        );
        assert!(
            !store
                .mark_space_indexed("OPS", "2026-02-02T00:00:00Z")
                .expect("stamp unlisted")
        );

        let spaces = store.list_spaces().expect("spaces");
        assert_eq!(spaces.len(), 1);
        assert_eq!(spaces[0].name, "Engineering");
        assert_eq!(spaces[0].last_indexed.as_deref(), Some("2026-02-01T00:00:00Z"));
    }

    #[test]
    fn replace_suggestions_drops_everything_previous() {
        let (_temp, store) = open_store();
        let old = store
            .put_suggestion(&new_suggestion("A", "B", "x"))
            .expect("put");
        store
            .put_suggestion(&new_suggestion("Z", "Y", "keep"))
            .expect("other cluster");

        store
            .put_suggestion(&new_suggestion("A", "C", "y"))
            .expect("second");

        let replaced = store
            .replace_suggestions("A", &[new_suggestion("A", "B", "x")])
            .expect("replace");
        assert_eq!(replaced.removed, 2);
        assert_eq!(replaced.ids.len(), 1);
        assert_ne!(replaced.ids[0], old);
        assert!(store.get_suggestion(old).expect("lookup").is_none());

        let current = store.get_suggestions("A", None).expect("list");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].status, SuggestionStatus::Pending);
        assert_eq!(store.get_suggestions("Z", None).expect("other").len(), 1);
    }

    #[test]
    fn status_update_filters_listing() {
        let (_temp, store) = open_store();
        let first = store
            .put_suggestion(&new_suggestion("A", "B", "x"))
            .expect("first");
        store
            .put_suggestion(&new_suggestion("A", "C", "y"))
            .expect("second");

        assert!(
            store
                .update_suggestion_status(first, SuggestionStatus::Applied, Some("2026-03-01T00:00:00Z"))
                .expect("update")
        );
        assert!(
            !store
                .update_suggestion_status(999, SuggestionStatus::Applied, None)
                .expect("missing")
        );

        let pending = store
            .get_suggestions("A", Some(SuggestionStatus::Pending))
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].suggestion_text, "y");

        let applied = store.get_suggestion(first).expect("get").expect("present");
        assert_eq!(applied.status, SuggestionStatus::Applied);
        assert_eq!(applied.applied_date.as_deref(), Some("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn cluster_root_lookup_reports_missing_pages() {
        let (_temp, store) = open_store();
        store.put_pages("ENG", &[page("A", None, &[])]).expect("put");
        assert!(store.get_cluster_root("A").expect("lookup").is_some());
        assert!(store.get_cluster_root("nope").expect("lookup").is_none());
    }

    #[test]
    fn concurrent_label_appends_from_two_connections_all_survive() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("cache.db");
        let first = SqliteStore::open_at(&db_path).expect("first store");
        let second = SqliteStore::open_at(&db_path).expect("second store");
        first.put_pages("ENG", &[page("1", None, &[])]).expect("put");

        std::thread::scope(|scope| {
            for (store, prefix) in [(first, "alpha"), (second, "beta")] {
                scope.spawn(move || {
                    for n in 0..25 {
                        assert!(
                            store
                                .append_page_label("1", &format!("{prefix}-{n}"))
                                .expect("append")
                        );
                    }
                });
            }
        });

        let reader = SqliteStore::open_at(&db_path).expect("reader");
        let labels = reader.get_page("1").expect("get").expect("present").labels;
        assert_eq!(labels.len(), 50);
        for n in 0..25 {
            assert!(labels.contains(&format!("alpha-{n}")));
            assert!(labels.contains(&format!("beta-{n}")));
        }
    }
}
