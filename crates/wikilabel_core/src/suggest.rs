//! Label suggestion strategies.
//!
//! Both strategies honour the same contract: given a member page, the space
//! vocabulary and the cluster it is being labelled for, return candidate
//! labels the page does not already carry (compared case-insensitively).
//! Per-page failures never escape [`SuggestionStrategy::generate`] or
//! [`generate_batch`]; they are logged and reported as data.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::{GeneratorSettings, StrategyChoice};
use crate::error::{GenerateError, LabelError};
use crate::llm::{AnthropicClient, CompletionApi};
use crate::model::{ClusterInfo, LabelSuggestion, PageInput, contains_label};

pub const RULE_CONFIDENCE: f64 = 0.75;

pub trait SuggestionStrategy {
    fn name(&self) -> &'static str;

    /// Whether callers must fetch page bodies before generating.
    fn needs_content(&self) -> bool;

    fn try_generate(
        &mut self,
        input: &PageInput,
        all_labels: &[String],
        cluster: &ClusterInfo,
    ) -> Result<Vec<LabelSuggestion>, GenerateError>;

    fn generate(
        &mut self,
        input: &PageInput,
        all_labels: &[String],
        cluster: &ClusterInfo,
    ) -> Vec<LabelSuggestion> {
        match self.try_generate(input, all_labels, cluster) {
            Ok(suggestions) => suggestions,
            Err(error) => {
                tracing::warn!(
                    strategy = self.name(),
                    page_id = %input.page.id,
                    %error,
                    "suggestion generation failed for page"
                );
                Vec::new()
            }
        }
    }
}

/// Proposes every directory label of the cluster the page is missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedStrategy;

impl SuggestionStrategy for RuleBasedStrategy {
    fn name(&self) -> &'static str {
        "rule"
    }

    fn needs_content(&self) -> bool {
        false
    }

    fn try_generate(
        &mut self,
        input: &PageInput,
        _all_labels: &[String],
        cluster: &ClusterInfo,
    ) -> Result<Vec<LabelSuggestion>, GenerateError> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for label in &cluster.directory_labels {
            let trimmed = label.trim();
            if trimmed.is_empty() || input.page.has_label(trimmed) {
                continue;
            }
            if !seen.insert(trimmed.to_lowercase()) {
                continue;
            }
            out.push(LabelSuggestion {
                label: trimmed.to_string(),
                confidence: RULE_CONFIDENCE,
                reason: format!("label of cluster \"{}\"", cluster.title),
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PromptLimits {
    pub content_budget_chars: usize,
    pub vocabulary_hint_limit: usize,
}

impl PromptLimits {
    pub fn from_settings(settings: &GeneratorSettings) -> Self {
        Self {
            content_budget_chars: settings.content_budget_chars,
            vocabulary_hint_limit: settings.vocabulary_hint_limit,
        }
    }
}

/// Asks a completion service for labels and decodes its free-text answer.
pub struct GenerativeStrategy<C> {
    completion: C,
    limits: PromptLimits,
}

impl<C: CompletionApi> GenerativeStrategy<C> {
    pub fn new(completion: C, limits: PromptLimits) -> Self {
        Self { completion, limits }
    }

    pub fn completion(&self) -> &C {
        &self.completion
    }
}

impl<C: CompletionApi> SuggestionStrategy for GenerativeStrategy<C> {
    fn name(&self) -> &'static str {
        "model"
    }

    fn needs_content(&self) -> bool {
        true
    }

    fn try_generate(
        &mut self,
        input: &PageInput,
        all_labels: &[String],
        cluster: &ClusterInfo,
    ) -> Result<Vec<LabelSuggestion>, GenerateError> {
        let Some(content) = input.content.as_deref() else {
            return Err(GenerateError::Content(format!(
                "no content fetched for page {}",
                input.page.id
            )));
        };
        let prompt = build_prompt(input, content, all_labels, cluster, self.limits);
        let response = self
            .completion
            .complete(&prompt)
            .map_err(|error| GenerateError::Service(format!("{error:#}")))?;
        let parsed = parse_model_response(&response, &input.page.labels)?;
        tracing::debug!(
            page_id = %input.page.id,
            suggestions = parsed.suggestions.len(),
            dropped = parsed.dropped,
            clamped = parsed.clamped,
            fallback = parsed.used_fallback,
            "parsed model suggestions"
        );
        Ok(parsed.suggestions)
    }
}

pub fn build_prompt(
    input: &PageInput,
    content: &str,
    all_labels: &[String],
    cluster: &ClusterInfo,
    limits: PromptLimits,
) -> String {
    let plain = truncate_chars(&strip_html(content), limits.content_budget_chars);
    let existing = join_or_none(&input.page.labels);
    let cluster_labels = join_or_none(&cluster.labels);
    let vocabulary = all_labels
        .iter()
        .take(limits.vocabulary_hint_limit)
        .cloned()
        .collect::<Vec<_>>();
    let vocabulary = join_or_none(&vocabulary);

    format!(
        "You label pages in a company wiki so related pages can be found together.\n\
         \n\
         Page title: {title}\n\
         Current labels: {existing}\n\
         \n\
         Page content (plain text, possibly truncated):\n\
         {plain}\n\
         \n\
         The page sits in the directory \"{cluster_title}\" whose labels are: {cluster_labels}\n\
         Labels already used in this space: {vocabulary}\n\
         \n\
         Suggest between 1 and 3 additional labels for this page. Prefer labels that already exist \
         in the space. Labels are lowercase and use hyphens instead of spaces. Do not repeat a \
         current label.\n\
         \n\
         Respond with only a JSON array, no other text, in this shape:\n\
         [{{\"label\": \"example-label\", \"confidence\": 0.8, \"reason\": \"short justification\"}}]\n\
         confidence is a number between 0 and 1.",
        title = input.page.title,
        cluster_title = cluster.title,
    )
}

/// Outcome of decoding one model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub suggestions: Vec<LabelSuggestion>,
    /// The array was found by scanning inside surrounding prose.
    pub used_fallback: bool,
    /// Items rejected for shape, duplicates or labels already on the page.
    pub dropped: usize,
    pub clamped: usize,
}

/// Decode untrusted model output into validated suggestions.
///
/// The whole response is tried as a JSON array first. Failing that, each `[`
/// is tried in turn as the start of a balanced array. Items with a missing or
/// mistyped `label`/`confidence` are dropped individually.
pub fn parse_model_response(
    response: &str,
    existing_labels: &[String],
) -> Result<ParsedResponse, GenerateError> {
    let (items, used_fallback) = match strict_array(response) {
        Some(items) => (items, false),
        None => match scan_for_array(response) {
            Some(items) => {
                tracing::debug!("model response was not bare JSON, recovered embedded array");
                (items, true)
            }
            None => {
                return Err(GenerateError::Parse(format!(
                    "no JSON array found in response: {}",
                    preview(response)
                )));
            }
        },
    };

    let mut parsed = ParsedResponse {
        used_fallback,
        ..ParsedResponse::default()
    };
    let mut seen = BTreeSet::new();
    for (index, item) in items.iter().enumerate() {
        let Some(mut suggestion) = validate_item(item) else {
            tracing::warn!(index, item = %item, "dropping malformed model suggestion");
            parsed.dropped += 1;
            continue;
        };
        if !(0.0..=1.0).contains(&suggestion.confidence) {
            tracing::warn!(
                label = %suggestion.label,
                confidence = suggestion.confidence,
                "clamping out-of-range confidence"
            );
            suggestion.confidence = suggestion.confidence.clamp(0.0, 1.0);
            parsed.clamped += 1;
        }
        if contains_label(existing_labels, &suggestion.label)
            || !seen.insert(suggestion.label.to_lowercase())
        {
            parsed.dropped += 1;
            continue;
        }
        parsed.suggestions.push(suggestion);
    }
    Ok(parsed)
}

fn strict_array(response: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(response.trim()) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

fn scan_for_array(response: &str) -> Option<Vec<Value>> {
    for (start, ch) in response.char_indices() {
        if ch != '[' {
            continue;
        }
        let Some(end) = balanced_array_end(&response[start..]) else {
            continue;
        };
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&response[start..start + end])
        {
            return Some(items);
        }
    }
    None
}

/// Byte length of the bracketed run starting at `text[0] == '['`, skipping
/// brackets inside JSON strings.
fn balanced_array_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn validate_item(item: &Value) -> Option<LabelSuggestion> {
    let object = item.as_object()?;
    let label = object.get("label")?.as_str()?.trim();
    if label.is_empty() {
        return None;
    }
    let confidence = object.get("confidence")?.as_f64()?;
    let reason = object
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    Some(LabelSuggestion {
        label: label.to_string(),
        confidence,
        reason,
    })
}

/// Wide enough that html2text never splits a word across lines.
const TEXT_WIDTH: usize = 1_000;

/// Plain text of a storage-format body with whitespace runs collapsed.
/// Macro bodies wrapped in CDATA are kept as text.
pub fn strip_html(markup: &str) -> String {
    let escaped = escape_cdata(markup);
    let text = match html2text::from_read(escaped.as_bytes(), TEXT_WIDTH) {
        Ok(text) => text,
        Err(error) => {
            tracing::warn!(%error, "failed to render page body as text; using raw markup");
            escaped
        }
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace each `<![CDATA[...]]>` section with its escaped contents. An HTML
/// parser would otherwise read it as a bogus comment ending at the first `>`.
fn escape_cdata(markup: &str) -> String {
    const OPEN: &str = "<![CDATA[";
    const CLOSE: &str = "]]>";

    let mut out = String::with_capacity(markup.len());
    let mut rest = markup;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let body_and_tail = &rest[start + OPEN.len()..];
        let (body, tail) = match body_and_tail.find(CLOSE) {
            Some(end) => (&body_and_tail[..end], &body_and_tail[end + CLOSE.len()..]),
            None => (body_and_tail, ""),
        };
        for ch in body.chars() {
            match ch {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                _ => out.push(ch),
            }
        }
        rest = tail;
    }
    out.push_str(rest);
    out
}

fn truncate_chars(text: &str, budget: usize) -> String {
    match text.char_indices().nth(budget) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

fn join_or_none(labels: &[String]) -> String {
    if labels.is_empty() {
        "(none)".to_string()
    } else {
        labels.join(", ")
    }
}

fn preview(response: &str) -> String {
    let flat = response.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&flat, 120)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Pages with at least one suggestion, keyed by page id.
    pub suggestions: BTreeMap<String, Vec<LabelSuggestion>>,
    pub failures: Vec<PageFailure>,
}

impl BatchOutcome {
    pub fn suggestion_count(&self) -> usize {
        self.suggestions.values().map(Vec::len).sum()
    }
}

/// Run `strategy` over every input. Pages that fail or yield nothing are
/// omitted from `suggestions`; failures are also listed.
pub fn generate_batch(
    strategy: &mut dyn SuggestionStrategy,
    inputs: &[PageInput],
    all_labels: &[String],
    cluster: &ClusterInfo,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for input in inputs {
        match strategy.try_generate(input, all_labels, cluster) {
            Ok(suggestions) if suggestions.is_empty() => {
                tracing::debug!(page_id = %input.page.id, "no suggestions for page");
            }
            Ok(suggestions) => {
                tracing::info!(
                    page_id = %input.page.id,
                    count = suggestions.len(),
                    "generated suggestions"
                );
                outcome
                    .suggestions
                    .insert(input.page.id.clone(), suggestions);
            }
            Err(error) => {
                tracing::warn!(
                    strategy = strategy.name(),
                    page_id = %input.page.id,
                    %error,
                    "suggestion generation failed for page"
                );
                outcome.failures.push(PageFailure {
                    page_id: input.page.id.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }
    outcome
}

/// Pick the strategy for a run. Fails before any page is touched when the
/// model strategy is requested without a usable credential.
pub fn build_strategy(
    settings: &GeneratorSettings,
    requested: Option<StrategyChoice>,
) -> Result<Box<dyn SuggestionStrategy>, LabelError> {
    let choice = requested.unwrap_or(settings.strategy);
    match choice {
        StrategyChoice::Rule => Ok(Box::new(RuleBasedStrategy)),
        StrategyChoice::Auto if settings.api_key.is_none() => {
            tracing::warn!("no generator API key configured, using rule-based suggestions");
            Ok(Box::new(RuleBasedStrategy))
        }
        StrategyChoice::Auto | StrategyChoice::Model => {
            if settings.api_key.is_none() {
                return Err(LabelError::GeneratorNotConfigured(
                    "ANTHROPIC_API_KEY is missing or a placeholder".to_string(),
                ));
            }
            let client = AnthropicClient::from_settings(settings)?;
            Ok(Box::new(GenerativeStrategy::new(
                client,
                PromptLimits::from_settings(settings),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, bail};

    use super::*;
    use crate::model::Page;

    struct ScriptedCompletion {
        responses: Vec<Result<String, String>>,
        prompts: Vec<String>,
    }

    impl ScriptedCompletion {
        fn new(responses: Vec<Result<String, String>>) -> Self {
            Self {
                responses,
                prompts: Vec::new(),
            }
        }
    }

    impl CompletionApi for ScriptedCompletion {
        fn complete(&mut self, prompt: &str) -> Result<String> {
            self.prompts.push(prompt.to_string());
            if self.responses.is_empty() {
                bail!("no scripted response left");
            }
            match self.responses.remove(0) {
                Ok(text) => Ok(text),
                Err(message) => bail!(message),
            }
        }

        fn request_count(&self) -> usize {
            self.prompts.len()
        }
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

    fn cluster() -> ClusterInfo {
        ClusterInfo::from_page(&page("A", None, &["directory_page", "x"]), "directory_page")
    }

    fn limits() -> PromptLimits {
        PromptLimits {
            content_budget_chars: 3_000,
            vocabulary_hint_limit: 2,
        }
    }

    fn settings(strategy: StrategyChoice, api_key: Option<&str>) -> GeneratorSettings {
        GeneratorSettings {
            strategy,
            api_key: api_key.map(ToString::to_string),
            api_url: "https://llm.example/v1/messages".to_string(),
            model: "test-model".to_string(),
            max_tokens: 256,
            temperature: 0.3,
            timeout_ms: 1_000,
            content_budget_chars: 3_000,
            vocabulary_hint_limit: 50,
        }
    }

    #[test]
    fn rule_based_scenario_skips_pages_that_already_hold_the_label() {
        let mut strategy = RuleBasedStrategy;
        let inputs = vec![
            PageInput::without_content(page("B", Some("A"), &[])),
            PageInput::without_content(page("C", Some("A"), &["x"])),
        ];
        let outcome = generate_batch(&mut strategy, &inputs, &[], &cluster());

        assert_eq!(outcome.suggestions.len(), 1);
        let for_b = &outcome.suggestions["B"];
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].label, "x");
        assert_eq!(for_b[0].confidence, RULE_CONFIDENCE);
        assert!(!outcome.suggestions.contains_key("C"));
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn rule_based_dedup_ignores_case() {
        let mut strategy = RuleBasedStrategy;
        let input = PageInput::without_content(page("B", Some("A"), &["X"]));
        assert!(strategy.generate(&input, &[], &cluster()).is_empty());
    }

    #[test]
    fn embedded_array_is_recovered_from_prose() {
        let response = "Here you go: [{\"label\":\"a\",\"confidence\":0.9,\"reason\":\"r\"}] thanks";
        let parsed = parse_model_response(response, &[]).expect("parse");
        assert!(parsed.used_fallback);
        assert_eq!(
            parsed.suggestions,
            vec![LabelSuggestion {
                label: "a".to_string(),
                confidence: 0.9,
                reason: "r".to_string(),
            }]
        );
    }

    #[test]
    fn response_without_array_yields_no_suggestions() {
        assert!(matches!(
            parse_model_response("I cannot help with that.", &[]),
            Err(GenerateError::Parse(_))
        ));

        let mut strategy = GenerativeStrategy::new(
            ScriptedCompletion::new(vec![Ok("I cannot help with that.".to_string())]),
            limits(),
        );
        let input = PageInput {
            page: page("B", Some("A"), &[]),
            content: Some("<p>body</p>".to_string()),
        };
        assert!(strategy.generate(&input, &[], &cluster()).is_empty());
    }

    #[test]
    fn scan_skips_bracketed_prose_and_brackets_inside_strings() {
        let response = "Options [see below]:\n```json\n[{\"label\":\"ops\",\"confidence\":0.6,\"reason\":\"mentions [runbooks]\"}]\n```";
        let parsed = parse_model_response(response, &[]).expect("parse");
        assert_eq!(parsed.suggestions.len(), 1);
        assert_eq!(parsed.suggestions[0].label, "ops");
        assert_eq!(parsed.suggestions[0].reason, "mentions [runbooks]");
    }

    #[test]
    fn malformed_items_are_dropped_individually() {
        let response = r#"[
            {"label": "good", "confidence": 0.8},
            {"label": "", "confidence": 0.8},
            {"label": "no-confidence"},
            {"label": 7, "confidence": 0.5},
            {"label": "stringly", "confidence": "high"},
            "bare"
        ]"#;
        let parsed = parse_model_response(response, &[]).expect("parse");
        assert!(!parsed.used_fallback);
        assert_eq!(parsed.suggestions.len(), 1);
        assert_eq!(parsed.suggestions[0].label, "good");
        assert_eq!(parsed.suggestions[0].reason, "");
        assert_eq!(parsed.dropped, 5);
    }

    #[test]
    fn confidence_is_clamped_and_existing_labels_are_dropped() {
        let existing = vec!["Billing".to_string()];
        let response = r#"[
            {"label": "billing", "confidence": 0.9, "reason": "dup"},
            {"label": "api", "confidence": 1.7, "reason": "over"},
            {"label": "API", "confidence": 0.4, "reason": "dup in response"},
            {"label": "legacy", "confidence": -0.2, "reason": "under"}
        ]"#;
        let parsed = parse_model_response(response, &existing).expect("parse");
        let labels = parsed
            .suggestions
            .iter()
            .map(|s| (s.label.as_str(), s.confidence))
            .collect::<Vec<_>>();
        assert_eq!(labels, vec![("api", 1.0), ("legacy", 0.0)]);
        assert_eq!(parsed.clamped, 2);
        assert_eq!(parsed.dropped, 2);
    }

    #[test]
    fn prompt_carries_page_cluster_and_vocabulary_context() {
        let input = PageInput {
            page: page("B", Some("A"), &["runbook"]),
            content: Some("<h1>Deploys</h1><p>Roll back with &amp; care</p>".to_string()),
        };
        let vocabulary = vec![
            "payments".to_string(),
            "api".to_string(),
            "hidden-by-limit".to_string(),
        ];
        let prompt = build_prompt(
            &input,
            input.content.as_deref().unwrap_or_default(),
            &vocabulary,
            &cluster(),
            limits(),
        );
        assert!(prompt.contains("Page title: Page B"));
        assert!(prompt.contains("Current labels: runbook"));
        assert!(prompt.contains("Deploys Roll back with & care"));
        assert!(prompt.contains("\"Page A\" whose labels are: directory_page, x"));
        assert!(prompt.contains("payments, api"));
        assert!(!prompt.contains("hidden-by-limit"));
        assert!(!prompt.contains("<h1>"));
    }

    #[test]
    fn content_is_truncated_to_the_budget() {
        let input = PageInput {
            page: page("B", Some("A"), &[]),
            content: Some("é".repeat(50)),
        };
        let prompt = build_prompt(
            &input,
            input.content.as_deref().unwrap_or_default(),
            &[],
            &cluster(),
            PromptLimits {
                content_budget_chars: 10,
                vocabulary_hint_limit: 0,
            },
        );
        assert!(prompt.contains(&format!("{}\n", "é".repeat(10))));
        assert!(!prompt.contains(&"é".repeat(11)));
    }

    #[test]
    fn service_and_content_failures_are_isolated_per_page() {
        let mut strategy = GenerativeStrategy::new(
            ScriptedCompletion::new(vec![
                Err("HTTP 429".to_string()),
                Ok(r#"[{"label":"api","confidence":0.7,"reason":"r"}]"#.to_string()),
            ]),
            limits(),
        );
        let inputs = vec![
            PageInput {
                page: page("B", Some("A"), &[]),
                content: Some("first".to_string()),
            },
            PageInput::without_content(page("C", Some("A"), &[])),
            PageInput {
                page: page("D", Some("A"), &[]),
                content: Some("third".to_string()),
            },
        ];
        let outcome = generate_batch(&mut strategy, &inputs, &[], &cluster());

        assert_eq!(outcome.suggestions.keys().collect::<Vec<_>>(), vec!["D"]);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].page_id, "B");
        assert!(outcome.failures[0].reason.contains("HTTP 429"));
        assert_eq!(outcome.failures[1].page_id, "C");
        assert_eq!(strategy.completion().request_count(), 2);
    }

    #[test]
    fn strategy_selection_respects_credentials() {
        let auto = build_strategy(&settings(StrategyChoice::Auto, None), None).expect("auto");
        assert_eq!(auto.name(), "rule");

        let model = build_strategy(&settings(StrategyChoice::Auto, None), Some(StrategyChoice::Model));
        assert!(matches!(model, Err(LabelError::GeneratorNotConfigured(_))));

        let keyed = build_strategy(
            &settings(StrategyChoice::Auto, Some("sk-test-123456789")),
            None,
        )
        .expect("keyed");
        assert_eq!(keyed.name(), "model");
        assert!(keyed.needs_content());
    }

    #[test]
    fn strip_html_collapses_markup_to_text() {
        let text = strip_html("<p>Hello&nbsp;<b>world</b></p>\n<ul><li>a &lt; b</li></ul>");
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
        assert!(text.contains("a < b"));
        assert!(!text.contains('\n'));
        assert!(!text.contains("&nbsp;"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn strip_html_keeps_storage_format_macro_bodies() {
        let body = "<p>Don&rsquo;t deploy on Fridays&#8230;</p>\
            <ac:structured-macro ac:name=\"code\"><ac:parameter ac:name=\"language\">bash</ac:parameter>\
            <ac:plain-text-body><![CDATA[if a > b then rollback && page <oncall>]]></ac:plain-text-body>\
            </ac:structured-macro><p>Owner: <ri:user ri:account-id=\"42\" /> SRE</p>";
        let text = strip_html(body);
        assert!(text.contains("Don\u{2019}t deploy on Fridays\u{2026}"), "{text}");
        assert!(text.contains("if a > b then rollback && page <oncall>"), "{text}");
        assert!(text.contains("SRE"), "{text}");
        assert!(!text.contains("&rsquo;"));
        assert!(!text.contains("]]>"));
        assert!(!text.contains("CDATA"));
    }

    #[test]
    fn unterminated_cdata_runs_to_the_end() {
        assert_eq!(escape_cdata("x<![CDATA[a<b"), "xa&lt;b");
        assert_eq!(escape_cdata("plain"), "plain");
    }
}
