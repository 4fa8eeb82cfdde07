//! CLI entry point for the subreddit similarity index engine.
//!
//! Builds per-subreddit indexes from a JSON-lines post dump and scores new
//! posts against them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{
    Parser, Subcommand, ValueEnum,
    builder::styling::{AnsiColor, Effects, Styles},
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use modsim::display::{
    TableBuilder, create_build_summary_table, create_fit_table, create_neighbor_table,
    create_progress_bar, create_spinner,
};
use modsim::posts::{group_by_subreddit, read_posts_jsonl};
use modsim::vector::{DuplicatePolicy, IndexSource};
use modsim::{
    Embedder, FastEmbedder, IndexCache, IndexError, IndexStore, PostSimilarityRequest, Publisher,
    Settings, SimilarityEngine, SimilarityResult, SubredditFitRequest,
};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Subreddit similarity index engine
#[derive(Parser)]
#[command(
    name = "modsim",
    version = env!("CARGO_PKG_VERSION"),
    about = "Per-subreddit similarity indexes for post moderation",
    long_about = "Build ANN indexes from historical subreddit posts and score new posts by similarity to them.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the index directory
    #[arg(long, global = true)]
    index_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DuplicateArg {
    Reject,
    LastWriteWins,
}

impl From<DuplicateArg> for DuplicatePolicy {
    fn from(arg: DuplicateArg) -> Self {
        match arg {
            DuplicateArg::Reject => DuplicatePolicy::Reject,
            DuplicateArg::LastWriteWins => DuplicatePolicy::LastWriteWins,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write a default settings.toml")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,

        /// Write the per-user file instead of .modsim/settings.toml
        #[arg(long)]
        global: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Build and publish indexes from a JSON-lines post dump")]
    Build {
        /// JSON-lines file, one submission per line
        #[arg(short, long)]
        input: PathBuf,

        /// Only build these subreddits (repeatable); default is every subreddit in the dump
        #[arg(short, long = "subreddit")]
        subreddits: Vec<String>,

        /// Force the number of inverted lists (clamped to the post count)
        #[arg(long)]
        nlist: Option<usize>,

        /// How to treat repeated submission ids
        #[arg(long, value_enum)]
        duplicates: Option<DuplicateArg>,

        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },

    #[command(about = "Score one post against one subreddit")]
    Query {
        #[arg(short, long)]
        subreddit: String,

        #[arg(short, long)]
        title: String,

        /// Post body
        #[arg(long, default_value = "")]
        text: String,

        /// Neighbors to return
        #[arg(short)]
        k: Option<usize>,

        /// Inverted lists to search
        #[arg(long, visible_alias = "nprobe")]
        search_breadth: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Rank several subreddits by how well a post fits them")]
    Fit {
        #[arg(short, long)]
        title: String,

        #[arg(long, default_value = "")]
        text: String,

        /// Subreddits to compare (comma separated or repeated)
        #[arg(short, long = "subreddit", value_delimiter = ',', required = true)]
        subreddits: Vec<String>,

        #[arg(short)]
        k: Option<usize>,

        #[arg(long, visible_alias = "nprobe")]
        search_breadth: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    #[command(about = "Score every post of a JSON-lines file against one subreddit")]
    Score {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        subreddit: String,

        #[arg(short)]
        k: Option<usize>,

        #[arg(long, visible_alias = "nprobe")]
        search_breadth: Option<usize>,
    },

    #[command(about = "List subreddits with a stored index")]
    List {
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Show statistics of a stored index")]
    Inspect {
        subreddit: String,

        #[arg(long)]
        json: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        if let Some(index_err) = err.downcast_ref::<IndexError>() {
            for suggestion in index_err.recovery_suggestions() {
                eprintln!("  - {suggestion}");
            }
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;
    if let Some(dir) = &cli.index_dir {
        settings.index_dir = dir.clone();
    }

    init_tracing(&settings);

    match cli.command {
        Commands::Init { force, global } => init(&cli.config, force, global),
        Commands::Config => {
            let source = cli.config.clone().unwrap_or_else(Settings::config_path);
            println!("# loaded from {}", source.display());
            print!(
                "{}",
                toml::to_string_pretty(&settings).context("failed to render settings")?
            );
            Ok(())
        }
        Commands::Build {
            input,
            subreddits,
            nlist,
            duplicates,
            quiet,
        } => build(&settings, &input, &subreddits, nlist, duplicates, quiet),
        Commands::Query {
            subreddit,
            title,
            text,
            k,
            search_breadth,
            json,
        } => {
            let engine = engine(&settings)?;
            let request = PostSimilarityRequest {
                post_title: title,
                post_text: text,
                subreddit,
                k: k.unwrap_or(settings.query.k),
                search_breadth: search_breadth.unwrap_or(settings.query.search_breadth),
            };
            let result = engine.query_post(&request)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(())
        }
        Commands::Fit {
            title,
            text,
            subreddits,
            k,
            search_breadth,
            json,
        } => {
            let engine = engine(&settings)?;
            let request = SubredditFitRequest {
                post_title: title,
                post_text: text,
                subreddits,
                k: k.unwrap_or(settings.query.k),
                search_breadth: search_breadth.unwrap_or(settings.query.search_breadth),
            };
            let fits = engine.fit(&request)?;
            if json {
                let rows: Vec<OutcomeRow> = fits
                    .into_iter()
                    .map(|fit| OutcomeRow::new(fit.subreddit, fit.result))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{}", create_fit_table(&fits));
            }
            Ok(())
        }
        Commands::Score {
            input,
            subreddit,
            k,
            search_breadth,
        } => {
            let engine = engine(&settings)?;
            let posts = read_posts_jsonl(&input)?;
            let scores = engine.score_posts(
                &subreddit,
                &posts,
                k.unwrap_or(settings.query.k),
                search_breadth.unwrap_or(settings.query.search_breadth),
            )?;
            for score in scores {
                let row = OutcomeRow::new(score.submission_id, score.result);
                println!("{}", serde_json::to_string(&row)?);
            }
            Ok(())
        }
        Commands::List { json } => {
            let store = settings.index_store();
            let subreddits = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&subreddits)?);
            } else if subreddits.is_empty() {
                println!("No indexes in {}", store.root().display());
            } else {
                let mut table = TableBuilder::new().set_headers(vec!["Subreddit", "Vectors", "Lists"]);
                for name in &subreddits {
                    let header = store.header(name)?;
                    table = table.add_row(vec![
                        name.clone(),
                        header.vector_count.to_string(),
                        header.nlist.to_string(),
                    ]);
                }
                println!("{}", table.build());
            }
            Ok(())
        }
        Commands::Inspect { subreddit, json } => inspect(&settings.index_store(), &subreddit, json),
    }
}

/// `RUST_LOG` wins; otherwise the configured level. Logs go to stderr so
/// JSON on stdout stays clean.
fn init_tracing(settings: &Settings) {
    let default_level = if settings.debug {
        "debug"
    } else {
        settings.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn init(explicit: &Option<PathBuf>, force: bool, global: bool) -> Result<()> {
    let path = match explicit {
        Some(path) => path.clone(),
        None if global => dirs::home_dir()
            .context("cannot determine the home directory")?
            .join(".reddit-auto-mod/settings.toml"),
        None => PathBuf::from(".modsim/settings.toml"),
    };
    let written = Settings::init_config_file(&path, force)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("Created configuration file at: {}", written.display());
    Ok(())
}

fn load_embedder(settings: &Settings) -> Result<FastEmbedder> {
    let spinner = create_spinner(&format!("Loading embedding model {}", settings.embedding.model));
    let embedder = FastEmbedder::new(
        &settings.embedding.model,
        settings.embedding.cache_dir.clone(),
        settings.embedding.show_download_progress,
    );
    spinner.finish_and_clear();
    Ok(embedder?)
}

fn engine(settings: &Settings) -> Result<SimilarityEngine> {
    let embedder: Arc<dyn Embedder> = Arc::new(load_embedder(settings)?);
    let source: Arc<dyn IndexSource> = Arc::new(settings.index_store());
    Ok(SimilarityEngine::new(Arc::new(IndexCache::new(source)), embedder))
}

fn build(
    settings: &Settings,
    input: &Path,
    only: &[String],
    nlist: Option<usize>,
    duplicates: Option<DuplicateArg>,
    quiet: bool,
) -> Result<()> {
    let posts = read_posts_jsonl(input)?;
    let groups = group_by_subreddit(posts, only);
    if groups.is_empty() {
        bail!("no posts to index in {}", input.display());
    }

    let mut builder = settings.index_builder();
    if let Some(nlist) = nlist {
        builder = builder.with_nlist(nlist);
    }
    if let Some(policy) = duplicates {
        builder = builder.with_duplicate_policy(policy.into());
    }

    let embedder = load_embedder(settings)?;
    let store = settings.index_store();
    let publisher = Publisher::new(&builder, &embedder, &store)
        .with_batch_size(settings.build.embed_batch_size);

    let mut reports = Vec::new();
    let mut failures = Vec::new();
    for (subreddit, posts) in &groups {
        let progress = (!quiet).then(|| {
            create_progress_bar(posts.len() as u64, &format!("embedding r/{subreddit}"))
        });
        let outcome = publisher.publish(subreddit, posts, |done| {
            if let Some(pb) = &progress {
                pb.set_position(done as u64);
            }
        });
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        match outcome {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::error!(subreddit = %subreddit, error = %e, "build failed");
                failures.push((subreddit.clone(), e.to_string()));
            }
        }
    }

    println!("{}", create_build_summary_table(&reports, &failures));
    if !failures.is_empty() {
        bail!("{} of {} builds failed", failures.len(), groups.len());
    }
    Ok(())
}

fn inspect(store: &IndexStore, subreddit: &str, json: bool) -> Result<()> {
    let stored = store.load(subreddit)?;
    let sizes = stored.index.list_sizes();
    let info = IndexInfo {
        subreddit: subreddit.to_string(),
        vectors: stored.index.vector_count(),
        dimension: stored.index.dimension().get(),
        nlist: stored.index.nlist(),
        smallest_list: sizes.iter().copied().min().unwrap_or(0),
        largest_list: sizes.iter().copied().max().unwrap_or(0),
        empty_lists: sizes.iter().filter(|&&s| s == 0).count(),
        built_at: stored.built_at.to_rfc3339(),
        stamp: stored.stamp.to_hex(),
        path: store.index_path_for(subreddit, &stored.stamp).display().to_string(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        let table = TableBuilder::new()
            .set_headers(vec!["Field", "Value"])
            .add_row(vec!["Subreddit".into(), info.subreddit])
            .add_row(vec!["Vectors".into(), info.vectors.to_string()])
            .add_row(vec!["Dimension".into(), info.dimension.to_string()])
            .add_row(vec!["Lists".into(), info.nlist.to_string()])
            .add_row(vec![
                "List sizes".into(),
                format!("{}..={}", info.smallest_list, info.largest_list),
            ])
            .add_row(vec!["Empty lists".into(), info.empty_lists.to_string()])
            .add_row(vec!["Built at".into(), info.built_at])
            .add_row(vec!["Stamp".into(), info.stamp])
            .add_row(vec!["File".into(), info.path]);
        println!("{}", table.build());
    }
    Ok(())
}

fn print_result(result: &SimilarityResult) {
    println!(
        "r/{}  score {:.4}  (distance avg {:.4}, min {:.4}, max {:.4})",
        result.subreddit,
        result.similarity_score,
        result.avg_distance,
        result.min_distance,
        result.max_distance
    );
    if !result.neighbors.is_empty() {
        println!("{}", create_neighbor_table(result));
    }
}

#[derive(Serialize)]
struct IndexInfo {
    subreddit: String,
    vectors: usize,
    dimension: usize,
    nlist: usize,
    smallest_list: usize,
    largest_list: usize,
    empty_lists: usize,
    built_at: String,
    stamp: String,
    path: String,
}

/// JSON form of a per-item outcome.
#[derive(Serialize)]
struct OutcomeRow {
    id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<SimilarityResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl OutcomeRow {
    fn new(id: String, outcome: Result<SimilarityResult, IndexError>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                status: "OK",
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                id,
                status: e.status_code(),
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}
