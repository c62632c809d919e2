//! Derives clusters and their members from a flat page list.
//!
//! Two membership rules exist side by side. The minimal rule (direct children
//! of the cluster page) backs the cluster detail view. The extended rule also
//! admits any page sharing a non-marker label with the cluster and is only
//! used to pick the pages that receive suggestions. The two views disagree on
//! purpose and callers must pick the rule that matches their surface.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Page, contains_label, directory_labels};

/// Every page carrying `marker_label`, in input order.
pub fn find_clusters<'a>(pages: &'a [Page], marker_label: &str) -> Vec<&'a Page> {
    pages
        .iter()
        .filter(|page| page.has_label(marker_label))
        .collect()
}

/// Direct children of `cluster_id`, in input order. The cluster page itself is
/// never a member, even when it names itself as its parent.
pub fn find_members<'a>(pages: &'a [Page], cluster_id: &str) -> Vec<&'a Page> {
    pages
        .iter()
        .filter(|page| is_direct_child(page, cluster_id))
        .collect()
}

/// Direct children plus pages sharing at least one directory label with the
/// cluster, in input order.
pub fn find_members_extended<'a>(
    pages: &'a [Page],
    cluster_id: &str,
    cluster_labels: &[String],
    marker_label: &str,
) -> Vec<&'a Page> {
    let directory = directory_labels(cluster_labels, marker_label);
    pages
        .iter()
        .filter(|page| page.id != cluster_id)
        .filter(|page| {
            is_direct_child(page, cluster_id)
                || directory
                    .iter()
                    .any(|label| contains_label(&page.labels, label))
        })
        .collect()
}

/// Label frequency over all supplied pages, keyed by the label as stored.
pub fn analyze_label_patterns(pages: &[Page]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for page in pages {
        for label in &page.labels {
            *counts.entry(label.clone()).or_insert(0usize) += 1;
        }
    }
    counts
}

/// Labels ordered by descending frequency, ties broken alphabetically.
pub fn label_vocabulary(counts: &BTreeMap<String, usize>) -> Vec<(String, usize)> {
    let mut ranked = counts
        .iter()
        .map(|(label, count)| (label.clone(), *count))
        .collect::<Vec<_>>();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));
    ranked
}

/// Pages that are neither cluster roots nor direct children of one.
pub fn find_orphans<'a>(pages: &'a [Page], clusters: &[&Page]) -> Vec<&'a Page> {
    let cluster_ids = clusters
        .iter()
        .map(|cluster| cluster.id.as_str())
        .collect::<BTreeSet<_>>();
    pages
        .iter()
        .filter(|page| !cluster_ids.contains(page.id.as_str()))
        .filter(|page| {
            page.parent_id
                .as_deref()
                .is_none_or(|parent| !cluster_ids.contains(parent))
        })
        .collect()
}

fn is_direct_child(page: &Page, cluster_id: &str) -> bool {
    page.id != cluster_id && page.parent_id.as_deref() == Some(cluster_id)
}
