//! BELB Command Line Interface
//!
//! Builds knowledge bases and corpora below a data directory and queries
//! built knowledge bases.
//!
//! # Usage
//!
//! ```bash
//! # Build two knowledge bases, two at a time
//! belb --dir /data/belb kbs build ncbi_gene ctd_diseases --workers 2
//!
//! # Licensed resources need a local copy
//! belb --dir /data/belb kbs build umls --umls /data/umls/2023AA/META
//!
//! # Query
//! belb --dir /data/belb kbs resolve ncbi_gene 100
//! belb --dir /data/belb kbs homonyms ncbi_gene --kind identifier --taxon 9606
//!
//! # Align a corpus, split into sentences
//! belb --dir /data/belb corpora build gnormplus --sentences
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use belb::build::expand_names as expand_kb_names;
use belb::corpora::build::expand_names as expand_corpus_names;
use belb::resources::{self, ResourceKind};
use belb::{BelbConfig, CorpusBuildOptions, CorpusBuilder, KbBuildOptions, KbBuilder, KbReader};

#[derive(Parser)]
#[command(name = "belb")]
#[command(version)]
#[command(about = "Build and query biomedical entity linking knowledge bases and corpora")]
struct Cli {
    /// Data directory holding `raw/` and `processed/`
    #[arg(long, env = "BELB_DIR", global = true, default_value = ".")]
    dir: PathBuf,

    /// YAML configuration file
    #[arg(long, env = "BELB_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Knowledge base commands
    Kbs {
        #[command(subcommand)]
        command: KbCommands,
    },

    /// Corpus commands
    Corpora {
        #[command(subcommand)]
        command: CorpusCommands,
    },

    /// List every known resource
    List,
}

#[derive(Subcommand)]
enum KbCommands {
    /// Fetch, parse and store knowledge bases
    Build {
        /// Knowledge base names, or `all`
        #[arg(required = true)]
        names: Vec<String>,

        /// Resources built concurrently
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// UMLS `META` directory
        #[arg(long)]
        umls: Option<PathBuf>,

        /// Directory holding the dbSNP JSON dumps
        #[arg(long)]
        dbsnp: Option<PathBuf>,

        /// Download again even if raw files exist
        #[arg(long)]
        overwrite: bool,

        /// Do not download, use raw files already present
        #[arg(long)]
        offline: bool,
    },

    /// Print the entity record of an identifier
    Lookup { kb: String, identifier: String },

    /// Resolve an identifier to its current form
    Resolve { kb: String, identifier: String },

    /// List names or identifiers that cannot be told apart
    Homonyms {
        kb: String,

        #[arg(long, value_enum, default_value_t = HomonymKind::Name)]
        kind: HomonymKind,

        /// Restrict identifier homonyms to these NCBI Taxonomy ids
        #[arg(long)]
        taxon: Vec<String>,

        /// Maximum name homonyms listed
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HomonymKind {
    /// Names shared by several identifiers
    Name,
    /// Identifiers with identical names, attribute and species
    Identifier,
    /// Names shared across species
    Foreign,
}

#[derive(Subcommand)]
enum CorpusCommands {
    /// Fetch, parse and align corpora against their knowledge bases
    Build {
        /// Corpus names, or `all`
        #[arg(required = true)]
        names: Vec<String>,

        /// Split passages into sentences
        #[arg(long)]
        sentences: bool,

        /// Corpora built concurrently
        #[arg(long, default_value_t = 1)]
        workers: usize,

        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        offline: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "belb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => BelbConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => BelbConfig::default(),
    };

    match cli.command {
        Commands::Kbs { command } => match command {
            KbCommands::Build {
                names,
                workers,
                umls,
                dbsnp,
                overwrite,
                offline,
            } => {
                let options = KbBuildOptions {
                    overwrite,
                    offline,
                    umls_dir: umls,
                    dbsnp_dir: dbsnp,
                };
                cmd_kbs_build(&cli.dir, config, options, &names, workers).await
            }
            KbCommands::Lookup { kb, identifier } => cmd_lookup(&cli.dir, &config, &kb, &identifier).await,
            KbCommands::Resolve { kb, identifier } => cmd_resolve(&cli.dir, &config, &kb, &identifier).await,
            KbCommands::Homonyms {
                kb,
                kind,
                taxon,
                limit,
            } => cmd_homonyms(&cli.dir, &config, &kb, kind, &taxon, limit).await,
        },
        Commands::Corpora { command } => match command {
            CorpusCommands::Build {
                names,
                sentences,
                workers,
                overwrite,
                offline,
            } => {
                let options = CorpusBuildOptions {
                    sentences,
                    offline,
                    overwrite,
                };
                cmd_corpora_build(&cli.dir, config, options, &names, workers).await
            }
        },
        Commands::List => {
            cmd_list(&cli.dir);
            Ok(())
        }
    }
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

async fn cmd_kbs_build(
    dir: &Path,
    config: BelbConfig,
    options: KbBuildOptions,
    names: &[String],
    workers: usize,
) -> Result<()> {
    let names = expand_kb_names(names, &options)?;
    let builder = KbBuilder::new(dir, config, options);
    let results = builder.build_all(&names, workers).await;

    let mut failed = Vec::new();
    for (name, result) in results {
        match result {
            Ok(summary) => println!(
                "{name}: {} entities, checksum {}",
                summary.counts.get("entities").copied().unwrap_or(0),
                summary.checksum
            ),
            Err(_) => failed.push(name),
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("failed to build: {}", failed.join(", "))
    }
}

async fn cmd_corpora_build(
    dir: &Path,
    config: BelbConfig,
    options: CorpusBuildOptions,
    names: &[String],
    workers: usize,
) -> Result<()> {
    let names = expand_corpus_names(names)?;
    let builder = CorpusBuilder::new(dir, config, options);
    let results = builder.build_all(&names, workers).await;

    let mut failed = Vec::new();
    for (name, result) in results {
        match result {
            Ok(summaries) => {
                for summary in summaries {
                    let kept: u64 = summary.stats.values().map(|s| s.annotations_out).sum();
                    println!("{name} ({}): {kept} annotations in {}", summary.category, summary.dir.display());
                }
            }
            Err(_) => failed.push(name),
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("failed to build: {}", failed.join(", "))
    }
}

async fn cmd_lookup(dir: &Path, config: &BelbConfig, kb: &str, identifier: &str) -> Result<()> {
    let reader = KbReader::open(dir, kb, config).await?;
    let record = reader.lookup(identifier).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_resolve(dir: &Path, config: &BelbConfig, kb: &str, identifier: &str) -> Result<()> {
    let reader = KbReader::open(dir, kb, config).await?;
    let resolution = reader.resolve(identifier).await?;
    println!("{}", serde_json::to_string_pretty(&resolution)?);
    Ok(())
}

async fn cmd_homonyms(
    dir: &Path,
    config: &BelbConfig,
    kb: &str,
    kind: HomonymKind,
    taxa: &[String],
    limit: usize,
) -> Result<()> {
    let reader = KbReader::open(dir, kb, config).await?;
    let output = match kind {
        HomonymKind::Name => serde_json::to_string_pretty(&reader.name_homonyms(limit).await?)?,
        HomonymKind::Identifier => {
            let taxa: Vec<&str> = taxa.iter().map(String::as_str).collect();
            let filter = (!taxa.is_empty()).then_some(taxa.as_slice());
            serde_json::to_string_pretty(&reader.identifier_homonyms(filter).await?)?
        }
        HomonymKind::Foreign => serde_json::to_string_pretty(&reader.foreign_name_homonyms().await?)?,
    };
    println!("{output}");
    Ok(())
}

fn cmd_list(dir: &Path) {
    for kind in [ResourceKind::Kb, ResourceKind::Corpus] {
        println!("{}:", kind.dir_name());
        for name in resources::names(kind) {
            let Ok(resource) = resources::get(name, kind) else {
                continue;
            };
            let categories: Vec<_> = resource.categories.iter().map(|c| c.as_str()).collect();
            let state = if kind == ResourceKind::Kb
                && belb::StatusMarker::is_up(&resource.processed_dir(dir))
            {
                "built"
            } else if resource.local {
                "local"
            } else {
                ""
            };
            println!("  {name:<16} {:<24} {state}", categories.join(","));
        }
    }
}
