use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub key: String,
    pub name: String,
    pub last_indexed: Option<String>,
}

/// A cached wiki page. `parent_id == None` means the page sits at the space root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub space_key: String,
    pub title: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Page {
    /// Case-insensitive label membership.
    pub fn has_label(&self, label: &str) -> bool {
        contains_label(&self.labels, label)
    }
}

pub fn contains_label(labels: &[String], label: &str) -> bool {
    let needle = label.trim().to_lowercase();
    labels
        .iter()
        .any(|existing| existing.trim().to_lowercase() == needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Applied,
}

impl SuggestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            other => bail!("unknown suggestion status: {other}"),
        }
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Label,
    /// Rows written by another tool with a type this build does not handle.
    Unknown(String),
}

impl SuggestionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Label => "label",
            Self::Unknown(value) => value,
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "label" {
            Self::Label
        } else {
            Self::Unknown(value.to_string())
        }
    }
}

/// A persisted suggestion row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub id: i64,
    pub cluster_id: String,
    pub page_id: String,
    pub kind: SuggestionKind,
    pub suggestion_text: String,
    pub confidence_score: f64,
    pub reason: Option<String>,
    pub status: SuggestionStatus,
    pub created_date: String,
    pub applied_date: Option<String>,
}

/// A suggestion that has not been stored yet; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSuggestion {
    pub cluster_id: String,
    pub page_id: String,
    pub kind: SuggestionKind,
    pub suggestion_text: String,
    pub confidence_score: f64,
    pub reason: Option<String>,
    pub created_date: String,
}

/// One candidate label produced by a generation strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelSuggestion {
    pub label: String,
    pub confidence: f64,
    pub reason: String,
}

/// Context handed to a strategy about the cluster a page is being labelled for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub id: String,
    pub title: String,
    pub labels: Vec<String>,
    /// Cluster labels minus the marker label.
    pub directory_labels: Vec<String>,
}

impl ClusterInfo {
    pub fn from_page(page: &Page, marker_label: &str) -> Self {
        Self {
            id: page.id.clone(),
            title: page.title.clone(),
            labels: page.labels.clone(),
            directory_labels: directory_labels(&page.labels, marker_label),
        }
    }
}

pub fn directory_labels(cluster_labels: &[String], marker_label: &str) -> Vec<String> {
    let marker = marker_label.trim().to_lowercase();
    cluster_labels
        .iter()
        .filter(|label| label.trim().to_lowercase() != marker)
        .cloned()
        .collect()
}

/// A member page together with the content the generative strategy reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInput {
    pub page: Page,
    pub content: Option<String>,
}

impl PageInput {
    pub fn without_content(page: Page) -> Self {
        Self {
            page,
            content: None,
        }
    }
}
