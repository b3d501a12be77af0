use clap::{Parser, Subcommand};
use responsive_images::cache::DedupStats;
use responsive_images::config::{Options, SvgShortCircuit, stock_options_toml};
use responsive_images::remote::{HttpAssetCache, RemoteCache};
use responsive_images::{
    Deriver, FormatRequest, FullStatsPlan, Source, WidthRequest, logging, output,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Option overrides shared by commands that plan outputs.
///
/// Every flag left unset keeps the value from `--config` (or the default).
#[derive(clap::Args, Clone)]
struct OptionArgs {
    /// Output width in pixels, or `auto` for the source width (repeatable)
    #[arg(long = "width", value_name = "N")]
    widths: Vec<WidthRequest>,

    /// Output formats, e.g. `webp,jpeg` or `auto` (repeatable)
    #[arg(long = "format", value_name = "F")]
    formats: Vec<String>,

    /// Directory outputs are written to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// URL prefix for output URLs
    #[arg(long)]
    url_path: Option<String>,

    /// What an `svg` output does for SVG sources: off, on or size
    #[arg(long, value_name = "MODE", value_parser = parse_short_circuit)]
    svg_short_circuit: Option<SvgShortCircuit>,

    /// Apply EXIF orientation to every output
    #[arg(long)]
    fix_orientation: bool,
}

/// Flags for `derive`.
#[derive(clap::Args, Clone)]
struct DeriveArgs {
    /// Source files or http(s) URLs
    #[arg(required = true)]
    sources: Vec<String>,

    #[command(flatten)]
    options: OptionArgs,

    /// Produce outputs in memory only, writing nothing
    #[arg(long)]
    dry_run: bool,

    /// Plan outputs without encoding anything
    #[arg(long)]
    stats_only: bool,

    /// Re-encode outputs even when they already exist on disk
    #[arg(long)]
    no_cache: bool,

    /// Maximum derivations running at once
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Print plans as JSON instead of a listing
    #[arg(long)]
    json: bool,
}

/// Flags for `stats`.
#[derive(clap::Args, Clone)]
struct StatsArgs {
    /// Source files
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    #[command(flatten)]
    options: OptionArgs,

    /// Print plans as JSON instead of a listing
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
#[command(name = "responsive-images")]
#[command(about = "Derive responsive image sets from source images")]
#[command(long_about = "\
Derive responsive image sets from source images

Each source is resized to every requested width and encoded in every
requested format. Outputs are named after a hash of the source content, so
unchanged sources map to the same files across runs:

  img/
  ├── 5P3yLKp7Ra-640.webp
  ├── 5P3yLKp7Ra-640.jpeg
  ├── 5P3yLKp7Ra-1280.webp
  └── 5P3yLKp7Ra-1280.jpeg

Widths larger than the source are dropped, with one source-width output
added in their place when the source is noticeably larger than the largest
remaining width. SVG sources may be upscaled.

Run 'responsive-images gen-config' to generate a documented options file.")]
#[command(version)]
struct Cli {
    /// Options file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for this crate (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Derive every output for the given sources
    Derive(DeriveArgs),
    /// Plan outputs for local sources without writing anything
    Stats(StatsArgs),
    /// Print a stock options file with all keys documented
    GenConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match cli.command {
        Command::Derive(args) => {
            let mut options = load_options(cli.config.as_deref(), &args.options)?;
            options.dry_run |= args.dry_run;
            options.stats_only |= args.stats_only;
            if args.no_cache {
                options.use_cache = false;
            }
            if args.concurrency.is_some() {
                options.concurrency = args.concurrency;
            }
            options.validate()?;

            let remote = if args.sources.iter().any(|s| is_url(s)) {
                let cache: Arc<dyn RemoteCache> = Arc::new(HttpAssetCache::new()?);
                Some(cache)
            } else {
                None
            };

            let deriver = Deriver::global();
            let jobs = args.sources.iter().map(|src| {
                let source = to_source(src, remote.as_ref());
                let options = options.clone();
                async move { (src.as_str(), deriver.derive(source, options).await) }
            });
            let results = futures::future::join_all(jobs).await;

            let dedup = deriver.cache().stats();
            let failed = report(results, args.json, Some(dedup))?;
            if failed > 0 {
                return Err(format!("{failed} of {} sources failed", args.sources.len()).into());
            }
        }
        Command::Stats(args) => {
            let options = load_options(cli.config.as_deref(), &args.options)?;
            let deriver = Deriver::global();
            let results = args
                .sources
                .iter()
                .map(|path| {
                    let src = path.to_str().unwrap_or("<non-utf8 path>");
                    (src, deriver.stats_sync(path.as_path(), options.clone()))
                })
                .collect();
            let failed = report(results, args.json, None)?;
            if failed > 0 {
                return Err(format!("{failed} of {} sources failed", args.sources.len()).into());
            }
        }
        Command::GenConfig => {
            print!("{}", stock_options_toml());
        }
    }

    Ok(())
}

/// Print every plan, and every error to stderr. Returns the failure count.
///
/// Results keep their command-line order; a source listed twice is reported
/// twice.
fn report(
    results: Vec<(&str, Result<FullStatsPlan, responsive_images::DeriveError>)>,
    json: bool,
    dedup: Option<DedupStats>,
) -> Result<usize, Box<dyn std::error::Error>> {
    let sources = results.len();
    let mut plans = Vec::new();
    for (src, result) in results {
        match result {
            Ok(plan) => plans.push((src, plan)),
            Err(e) => eprintln!("{src}: {e}"),
        }
    }
    let failed = sources - plans.len();

    if json {
        println!("{}", serde_json::to_string_pretty(&output::plans_json(&plans))?);
    } else {
        for (src, plan) in &plans {
            output::print_plan(src, plan);
        }
        if let Some(dedup) = dedup {
            let outputs = plans.iter().map(|(_, plan)| plan.len()).sum();
            println!(
                "{}",
                output::format_summary(sources, outputs, failed, &dedup)
            );
        }
    }
    Ok(failed)
}

/// Options file (or defaults) with command-line overrides applied.
fn load_options(
    config: Option<&Path>,
    args: &OptionArgs,
) -> Result<Options, Box<dyn std::error::Error>> {
    let mut options = match config {
        Some(path) => Options::load(path)?,
        None => Options::default(),
    };
    if !args.widths.is_empty() {
        options.widths = args.widths.clone();
    }
    if !args.formats.is_empty() {
        let mut formats = Vec::new();
        for list in &args.formats {
            formats.extend(FormatRequest::parse_list(list)?);
        }
        options.formats = formats;
    }
    if let Some(dir) = &args.output_dir {
        options.output_dir = dir.clone();
    }
    if let Some(url_path) = &args.url_path {
        options.url_path = url_path.clone();
    }
    if let Some(mode) = args.svg_short_circuit {
        options.svg_short_circuit = mode;
    }
    options.fix_orientation |= args.fix_orientation;
    Ok(options)
}

fn parse_short_circuit(value: &str) -> Result<SvgShortCircuit, String> {
    match value.to_ascii_lowercase().as_str() {
        "off" | "false" => Ok(SvgShortCircuit::Off),
        "on" | "true" => Ok(SvgShortCircuit::On),
        "size" => Ok(SvgShortCircuit::Size),
        other => Err(format!("expected off, on or size, got {other:?}")),
    }
}

fn is_url(src: &str) -> bool {
    src.starts_with("http://") || src.starts_with("https://")
}

fn to_source(src: &str, remote: Option<&Arc<dyn RemoteCache>>) -> Source {
    match remote {
        Some(cache) if is_url(src) => Source::remote(src, Arc::clone(cache)),
        _ => Source::path(src),
    }
}
