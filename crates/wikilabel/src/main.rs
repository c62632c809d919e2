mod tracing_setup;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use wikilabel_core::config::{LabelConfig, StrategyChoice, load_config, mask_secret};
use wikilabel_core::error::LabelError;
use wikilabel_core::lifecycle::LabelLifecycle;
use wikilabel_core::migrate::{pending_migration_count, run_migrations};
use wikilabel_core::model::Page;
use wikilabel_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use wikilabel_core::source::{LazyConfluenceClient, SourceApi};
use wikilabel_core::store::SqliteStore;

use crate::tracing_setup::{Verbosity, init_subscriber};

#[derive(Debug, Parser)]
#[command(
    name = "wikilabel",
    version,
    about = "Cluster Confluence pages by directory label and suggest labels for their members"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Debug-level logging on stderr")]
    verbose: bool,
    #[arg(short, long, global = true, help = "Only log errors")]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .wikilabel/ and a default config.toml")]
    Init(InitArgs),
    #[command(about = "Show runtime layout and cache state")]
    Status,
    #[command(about = "Show effective configuration with secrets masked")]
    Config,
    Db(DbArgs),
    #[command(about = "List spaces (fetched on first use)")]
    Spaces(SpacesArgs),
    #[command(about = "List cluster pages of a space")]
    Clusters(SpaceArgs),
    #[command(about = "Drop cached pages of a space")]
    Reindex(ReindexArgs),
    #[command(about = "Label frequency table of a space")]
    Labels(LabelsArgs),
    #[command(about = "Pages outside every cluster")]
    Orphans(SpaceArgs),
    #[command(about = "Show a cluster, its members and pending suggestions")]
    Cluster(ClusterArgs),
    #[command(about = "Regenerate suggestions for a cluster")]
    Suggest(SuggestArgs),
    #[command(about = "Apply pending suggestions to the wiki")]
    Apply(ApplyArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing .wikilabel/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
}

#[derive(Debug, Args)]
struct SpacesArgs {
    #[arg(long, help = "Refetch the space list from Confluence")]
    refresh: bool,
}

#[derive(Debug, Args)]
struct SpaceArgs {
    space_key: String,
}

#[derive(Debug, Args)]
struct ReindexArgs {
    space_key: String,
    #[arg(long, help = "Refetch pages immediately")]
    fetch: bool,
}

#[derive(Debug, Args)]
struct LabelsArgs {
    space_key: String,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ClusterArgs {
    cluster_id: String,
}

#[derive(Debug, Args)]
struct SuggestArgs {
    cluster_id: String,
    #[arg(long, value_name = "auto|rule|model")]
    strategy: Option<String>,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[arg(required = true, value_name = "SUGGESTION_ID")]
    ids: Vec<i64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet));
    let runtime = RuntimeOptions::from_cli(&cli);
    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Config) => run_config(&runtime),
        Some(Commands::Db(DbArgs {
            command: DbSubcommand::Migrate,
        })) => run_db_migrate(&runtime),
        Some(Commands::Spaces(args)) => run_spaces(&runtime, args),
        Some(Commands::Clusters(SpaceArgs { space_key })) => run_clusters(&runtime, &space_key),
        Some(Commands::Reindex(args)) => run_reindex(&runtime, args),
        Some(Commands::Labels(args)) => run_labels(&runtime, args),
        Some(Commands::Orphans(SpaceArgs { space_key })) => run_orphans(&runtime, &space_key),
        Some(Commands::Cluster(ClusterArgs { cluster_id })) => {
            run_cluster(&runtime, &cluster_id)
        }
        Some(Commands::Suggest(args)) => run_suggest(&runtime, args),
        Some(Commands::Apply(ApplyArgs { ids })) => run_apply(&runtime, &ids),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    println!("Initialized wikilabel runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "pending_migrations: {}",
        pending_migration_count(&paths)?
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_config(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let confluence = config.confluence_settings();
    let generator = config.generator_settings()?;
    println!("configuration");
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("analysis.cluster_label: {}", config.cluster_label());
    println!("confluence.url: {}", display_or_unset(&confluence.base_url));
    println!("confluence.email: {}", display_or_unset(&confluence.email));
    println!(
        "confluence.api_token: {}",
        mask_secret(confluence.api_token.as_deref())
    );
    println!("confluence.timeout_ms: {}", confluence.timeout_ms);
    println!("confluence.page_limit: {}", confluence.page_limit);
    println!("generator.strategy: {}", generator.strategy.as_str());
    println!(
        "generator.api_key: {}",
        mask_secret(generator.api_key.as_deref())
    );
    println!("generator.api_url: {}", generator.api_url);
    println!("generator.model: {}", generator.model);
    println!("generator.max_tokens: {}", generator.max_tokens);
    println!("generator.temperature: {}", generator.temperature);
    println!(
        "generator.content_budget_chars: {}",
        generator.content_budget_chars
    );
    println!(
        "generator.vocabulary_hint_limit: {}",
        generator.vocabulary_hint_limit
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;
    println!("db migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("applied: {}", report.applied.len());
    for migration in &report.applied {
        println!(
            "applied.migration: v{:03}_{}",
            migration.version, migration.name
        );
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_spaces(runtime: &RuntimeOptions, args: SpacesArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let spaces = session.lifecycle().ensure_spaces(args.refresh)?;
    println!("spaces.count: {}", spaces.len());
    for space in &spaces {
        println!(
            "space: {} | {} | last_indexed={}",
            space.key,
            space.name,
            space.last_indexed.as_deref().unwrap_or("never")
        );
    }
    session.finish(runtime);
    Ok(())
}

fn run_clusters(runtime: &RuntimeOptions, space_key: &str) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let clusters = session.lifecycle().clusters(space_key)?;
    println!("space: {space_key}");
    println!("cluster_label: {}", session.marker_label);
    print_pages("clusters", &clusters);
    session.finish(runtime);
    Ok(())
}

fn run_reindex(runtime: &RuntimeOptions, args: ReindexArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let report = session.lifecycle().reindex(&args.space_key, args.fetch)?;
    println!("reindex");
    println!("space: {}", report.space_key);
    println!("removed_pages: {}", report.removed);
    println!(
        "fetched_pages: {}",
        report
            .fetched
            .map(|count| count.to_string())
            .unwrap_or_else(|| "deferred".to_string())
    );
    session.finish(runtime);
    Ok(())
}

fn run_labels(runtime: &RuntimeOptions, args: LabelsArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let vocabulary = session.lifecycle().label_vocabulary(&args.space_key)?;
    println!("space: {}", args.space_key);
    println!("labels.count: {}", vocabulary.len());
    let limit = args.limit.unwrap_or(vocabulary.len());
    for (label, count) in vocabulary.iter().take(limit) {
        println!("label: {label} | {count}");
    }
    session.finish(runtime);
    Ok(())
}

fn run_orphans(runtime: &RuntimeOptions, space_key: &str) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let orphans = session.lifecycle().orphans(space_key)?;
    println!("space: {space_key}");
    print_pages("orphans", &orphans);
    session.finish(runtime);
    Ok(())
}

fn run_cluster(runtime: &RuntimeOptions, cluster_id: &str) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let detail = match session.lifecycle().cluster_detail(cluster_id) {
        Ok(detail) => detail,
        Err(error) => return report_notice(error),
    };
    println!("cluster: {} | {}", detail.cluster.id, detail.cluster.title);
    println!("space: {}", detail.cluster.space_key);
    println!(
        "directory_labels: {}",
        join_or_none(&detail.directory_labels)
    );
    print_pages("members", &detail.members);
    println!("pending.count: {}", detail.pending.len());
    for view in &detail.pending {
        let suggestion = &view.suggestion;
        println!(
            "pending: #{} | {} | {} | {:.2} | {}",
            suggestion.id,
            view.page_title,
            suggestion.suggestion_text,
            suggestion.confidence_score,
            suggestion.reason.as_deref().unwrap_or("-")
        );
    }
    session.finish(runtime);
    Ok(())
}

fn run_suggest(runtime: &RuntimeOptions, args: SuggestArgs) -> Result<()> {
    let requested = args
        .strategy
        .as_deref()
        .map(StrategyChoice::parse)
        .transpose()?;
    let mut session = Session::open(runtime)?;
    let settings = session.config.generator_settings()?;
    let report = match session
        .lifecycle()
        .regenerate_with_settings(&args.cluster_id, &settings, requested)
    {
        Ok(report) => report,
        Err(error) => return report_notice(error),
    };
    println!("suggest");
    println!("cluster: {}", report.cluster_id);
    println!("strategy: {}", report.strategy);
    println!("candidate_pages: {}", report.candidate_pages);
    println!("removed_suggestions: {}", report.removed);
    println!("created_suggestions: {}", report.created.len());
    for row in &report.created {
        println!(
            "created: #{} | page {} | {} | {:.2}",
            row.id, row.page_id, row.label, row.confidence
        );
    }
    println!("failed_pages: {}", report.failures.len());
    for failure in &report.failures {
        println!("failed: page {} | {}", failure.page_id, failure.reason);
    }
    session.finish(runtime);
    Ok(())
}

fn run_apply(runtime: &RuntimeOptions, ids: &[i64]) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let report = session.lifecycle().apply(ids);
    println!("apply");
    println!("success_count: {}", report.success_count);
    println!("error_count: {}", report.error_count);
    println!("skipped_count: {}", report.skipped_count);
    for outcome in &report.outcomes {
        println!(
            "outcome: #{} | {} | {}",
            outcome.id,
            outcome.action,
            outcome.detail.as_deref().unwrap_or("-")
        );
    }
    session.finish(runtime);
    Ok(())
}

/// Everything a cache-backed command needs, resolved once.
struct Session {
    paths: ResolvedPaths,
    config: LabelConfig,
    marker_label: String,
    store: SqliteStore,
    source: LazyConfluenceClient,
}

impl Session {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let config = load_config(&paths.config_path)?;
        let store = SqliteStore::open(&paths)?;
        let source = LazyConfluenceClient::new(config.confluence_settings());
        Ok(Self {
            marker_label: config.cluster_label(),
            paths,
            config,
            store,
            source,
        })
    }

    fn lifecycle(&mut self) -> LabelLifecycle<'_, SqliteStore, LazyConfluenceClient> {
        LabelLifecycle::new(&self.store, &mut self.source, self.marker_label.clone())
    }

    fn finish(self, runtime: &RuntimeOptions) {
        tracing::debug!(
            source_requests = self.source.request_count(),
            "command finished"
        );
        print_diagnostics(runtime, &self.paths);
    }
}

/// Not-found and configuration conditions end the command with a notice
/// instead of an error.
fn report_notice(error: LabelError) -> Result<()> {
    match error {
        LabelError::ClusterNotFound(_) => {
            println!("notice: {error}");
            println!("hint: list clusters of the space first so its pages are cached");
            Ok(())
        }
        LabelError::GeneratorNotConfigured(_) => {
            println!("notice: {error}");
            println!("hint: set ANTHROPIC_API_KEY or pass --strategy rule");
            Ok(())
        }
        LabelError::Other(error) => Err(error),
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_pages(heading: &str, pages: &[Page]) {
    println!("{heading}.count: {}", pages.len());
    if pages.is_empty() {
        println!("{heading}: <none>");
        return;
    }
    for page in pages {
        println!(
            "{heading}.page: {} | {} | labels={}",
            page.id,
            page.title,
            join_or_none(&page.labels)
        );
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(", ")
    }
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() { "<not set>" } else { value }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_apply_ids_and_global_flags() {
        let cli = Cli::try_parse_from(["wikilabel", "-v", "apply", "3", "7"]).expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Apply(ApplyArgs { ids })) => assert_eq!(ids, vec![3, 7]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn apply_requires_at_least_one_id() {
        assert!(Cli::try_parse_from(["wikilabel", "apply"]).is_err());
    }

    #[test]
    fn suggest_accepts_a_strategy_override() {
        let cli = Cli::try_parse_from(["wikilabel", "suggest", "123", "--strategy", "rule"])
            .expect("parse");
        match cli.command {
            Some(Commands::Suggest(args)) => {
                assert_eq!(args.cluster_id, "123");
                assert_eq!(args.strategy.as_deref(), Some("rule"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
