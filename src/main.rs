use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use framecull::config::Settings;
use framecull::dataset::{Dataset, FilterConfig, filter_empty_frames};
use framecull::dedup::{DedupConfig, DedupMethod, DuplicateSelector};
use framecull::download::{CvatClient, DatasetKind, DownloadOutcome, Downloader, ExportRequest};
use framecull::formats::{DatasetFormat, DatumaroFormat};
use framecull::hash::PerceptualHasher;
use framecull::history::{self, RunRecord};
use framecull::merge::MergeConfig;
use framecull::pipeline::{MergeMode, Orchestrator, PipelineOptions, RunState, SourceReport, SourceStage};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "framecull",
    version,
    about = "Cull near-duplicate frames and merge annotated datasets"
)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: `~/.framecull.json`)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write into non-empty output directories without asking
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Remove near-duplicate frames from a dataset
    Dedup {
        /// sequential, random or exhaustive (or 1, 2, 3)
        #[arg(short, long)]
        method: Option<String>,
        /// Frames closer than this Hamming distance are duplicates [default: 10]
        #[arg(short, long)]
        threshold: Option<i64>,
        /// Share of kept frames compared by the random method [default: 0.7]
        #[arg(short, long)]
        ratio: Option<f64>,
        /// Seed for the random method
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short, long, value_name = "DIR", default_value = "unique")]
        output: PathBuf,
        /// Copy images into the output dataset
        #[arg(long)]
        save_media: bool,
        /// Output layout (default: same as the input)
        #[arg(long, value_name = "FORMAT")]
        output_format: Option<String>,
        /// Dataset directory or zip archive
        dataset: PathBuf,
    },

    /// Drop frames without usable annotations
    Filter {
        /// Also drop occluded boxes
        #[arg(long)]
        filter_occluded: bool,
        #[arg(short, long, value_name = "DIR", default_value = "filtered")]
        output: PathBuf,
        #[arg(long)]
        save_media: bool,
        dataset: PathBuf,
    },

    /// Build consensus annotations from several annotated copies of the same frames
    Merge {
        #[arg(short, long, value_name = "DIR", default_value = "merged")]
        output: PathBuf,
        /// Keep frames without annotations
        #[arg(long)]
        no_filter_empty: bool,
        #[arg(long)]
        filter_occluded: bool,
        /// Keep intermediate datasets for inspection
        #[arg(long)]
        debug: bool,
        /// Copy images into the output dataset (always done for zip inputs)
        #[arg(long)]
        save_media: bool,
        /// Minimum number of sources agreeing on a box [default: 0, no minimum]
        #[arg(long)]
        quorum: Option<usize>,
        /// Largest 1 - IoU between boxes of one object [default: 0.25]
        #[arg(long)]
        pairwise_dist: Option<f64>,
        /// Drop merged boxes below this confidence [default: 0.0]
        #[arg(long)]
        output_conf_thresh: Option<f64>,
        #[arg(required = true)]
        datasets: Vec<PathBuf>,
    },

    /// Concatenate datasets into one with contiguous item ids
    Concat {
        #[arg(short, long, value_name = "DIR", default_value = "concatenated")]
        output: PathBuf,
        #[arg(long)]
        no_filter_empty: bool,
        #[arg(long)]
        filter_occluded: bool,
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        save_media: bool,
        #[arg(required = true)]
        datasets: Vec<PathBuf>,
    },

    /// Export datasets from a CVAT server
    Download {
        /// Server url, e.g. `http://localhost:8080/`
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(short, long, default_value = framecull::download::DEFAULT_FORMAT)]
        format: String,
        /// Ids are project ids
        #[arg(long, conflicts_with_all = ["task", "job"])]
        project: bool,
        /// Ids are task ids (the default)
        #[arg(long, conflicts_with = "job")]
        task: bool,
        /// Ids are job ids
        #[arg(long)]
        job: bool,
        /// Keep the downloaded archives packed
        #[arg(long)]
        no_unzip: bool,
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        output: PathBuf,
        #[arg(required = true)]
        ids: Vec<u64>,
    },

    /// Work with the run history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all recorded runs
    List {
        /// Output directory holding `.history.jsonl`
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Commands::Dedup {
            method,
            threshold,
            ratio,
            seed,
            output,
            save_media,
            output_format,
            dataset,
        } => {
            let defaults = &settings.dedup;
            let method = match method.or_else(|| defaults.method.clone()) {
                Some(name) => DedupMethod::from_name(&name)?,
                None => DedupMethod::default(),
            };
            let mut config = DedupConfig::new(
                method,
                threshold.or(defaults.threshold).unwrap_or(framecull::dedup::DEFAULT_THRESHOLD),
            )
            .with_ratio(ratio.or(defaults.ratio).unwrap_or(framecull::dedup::DEFAULT_RATIO));
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            let selector = DuplicateSelector::new(&config)?;

            if !confirm_overwrite(&output, cli.yes)? {
                println!("⚠️  Nothing written.");
                return Ok(());
            }

            println!("▶ Deduplicating {} ({})", dataset.display(), method);
            let orchestrator = Orchestrator::new(PipelineOptions::default())?;
            let (input, detected) = orchestrator
                .import(&dataset)
                .with_context(|| format!("Failed to import {}", dataset.display()))?;
            let format = orchestrator
                .registry()
                .by_name(output_format.as_deref().unwrap_or(detected))?;

            let bar = ProgressBar::new(input.len() as u64);
            bar.set_style(ProgressStyle::with_template(
                "{spinner:.green} hashing [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?);
            let hasher = PerceptualHasher::new();
            let outcome = benchmark("hashing and scanning", || {
                selector.run(&input, &hasher, || bar.inc(1))
            })?;
            bar.finish_and_clear();

            export(&orchestrator, &outcome.dataset, format, &output, save_media)?;
            println!(
                "✅ Kept {} of {} frame(s), removed {} duplicate(s) → {}",
                outcome.kept(),
                input.len(),
                outcome.duplicates(),
                output.display()
            );
            record(
                &output,
                RunRecord::new("dedup", &[dataset], &output, RunState::Completed).with_counts(
                    outcome.kept(),
                    outcome.dataset.total_annotations(),
                    outcome.duplicates(),
                ),
            );
        }

        Commands::Filter {
            filter_occluded,
            output,
            save_media,
            dataset,
        } => {
            if !confirm_overwrite(&output, cli.yes)? {
                println!("⚠️  Nothing written.");
                return Ok(());
            }

            println!("▶ Filtering empty frames in {}", dataset.display());
            let orchestrator = Orchestrator::new(PipelineOptions::default())?;
            let (input, detected) = orchestrator
                .import(&dataset)
                .with_context(|| format!("Failed to import {}", dataset.display()))?;
            let before = input.len();
            let outcome = filter_empty_frames(input, &filter_config(filter_occluded));

            let format = orchestrator.registry().by_name(detected)?;
            export(&orchestrator, &outcome.dataset, format, &output, save_media)?;
            println!(
                "✅ Kept {} of {} frame(s), pruned {} box(es) → {}",
                outcome.len(),
                before,
                outcome.pruned_annotations,
                output.display()
            );
            record(
                &output,
                RunRecord::new("filter", &[dataset], &output, RunState::Completed).with_counts(
                    outcome.len(),
                    outcome.dataset.total_annotations(),
                    outcome.removed_items,
                ),
            );
        }

        Commands::Merge {
            output,
            no_filter_empty,
            filter_occluded,
            debug,
            save_media,
            quorum,
            pairwise_dist,
            output_conf_thresh,
            datasets,
        } => {
            let defaults = &settings.merge;
            let config = MergeConfig::default()
                .with_quorum(quorum.or(defaults.quorum).unwrap_or(framecull::merge::DEFAULT_QUORUM))
                .with_pairwise_dist(
                    pairwise_dist
                        .or(defaults.pairwise_dist)
                        .unwrap_or(framecull::merge::DEFAULT_PAIRWISE_DIST),
                )
                .with_output_conf_thresh(
                    output_conf_thresh
                        .or(defaults.output_conf_thresh)
                        .unwrap_or(framecull::merge::DEFAULT_OUTPUT_CONF_THRESH),
                );
            config.validate()?;

            println!("▶ Merging {} dataset(s) by consensus", datasets.len());
            let options = pipeline_options(no_filter_empty, filter_occluded, debug);
            let mode = MergeMode::Consensus(config);
            run_pipeline("merge", &datasets, &output, options, mode, save_media, cli.yes)?;
        }

        Commands::Concat {
            output,
            no_filter_empty,
            filter_occluded,
            debug,
            save_media,
            datasets,
        } => {
            println!("▶ Concatenating {} dataset(s)", datasets.len());
            let options = pipeline_options(no_filter_empty, filter_occluded, debug);
            run_pipeline("concat", &datasets, &output, options, MergeMode::Accumulate, save_media, cli.yes)?;
        }

        Commands::Download {
            url,
            username,
            password,
            format,
            project,
            task: _,
            job,
            no_unzip,
            output,
            ids,
        } => {
            let url = url
                .or(settings.url)
                .context("No CVAT url given; pass --url or set \"url\" in the settings file")?;
            let kind = if project {
                DatasetKind::Project
            } else if job {
                DatasetKind::Job
            } else {
                DatasetKind::Task
            };
            let client = CvatClient::new(url)
                .with_credentials(username.or(settings.username), password.or(settings.password));
            let requests: Vec<ExportRequest> = ids
                .iter()
                .map(|&id| ExportRequest::new(kind, id, format.clone()))
                .collect();

            println!(
                "▶ Exporting {} {}(s) as {} from {}",
                requests.len(),
                kind,
                format,
                client.base_url()
            );
            fs::create_dir_all(&output)
                .with_context(|| format!("Failed to create directory {:?}", output))?;
            let downloader = Downloader::new(client, &output)
                .with_unzip(!no_unzip)
                .with_progress(MultiProgress::new());

            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            let reports = runtime.block_on(async {
                let cancel = CancellationToken::new();
                let trigger = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("⚠️  Interrupted, cancelling downloads…");
                        trigger.cancel();
                    }
                });
                downloader.run(requests, &cancel).await
            });

            let mut failed = 0;
            for report in &reports {
                match &report.result {
                    Ok(DownloadOutcome::Downloaded { path, bytes }) => {
                        println!("   ✅ {} ({} bytes) → {}", report.request.id, bytes, path.display())
                    }
                    Ok(DownloadOutcome::Skipped { path }) => {
                        println!("   ▶ {} already exists, skipping", path.display())
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("   ⚠️  Failed exporting dataset {}: {}", report.request.id, e)
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} download(s) failed", failed, reports.len());
            }
        }

        Commands::History { command } => match command {
            HistoryCmd::List { path } => {
                let records = history::load(&path).with_context(|| {
                    format!("Could not open history file {:?}", history::history_path(&path))
                })?;

                println!("🗂️  Run History:");
                for (i, rec) in records {
                    println!(
                        "[{}] {} {}\n     inputs: {:?}\n     output: {}\n     state: {:?}, items: {}, boxes: {}, removed: {}\n",
                        i,
                        rec.timestamp,
                        rec.command,
                        rec.inputs,
                        rec.output,
                        rec.state,
                        rec.items,
                        rec.annotations,
                        rec.removed
                    );
                }
            }
        },
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn filter_config(filter_occluded: bool) -> FilterConfig {
    FilterConfig {
        drop_occluded: filter_occluded,
        ..FilterConfig::default()
    }
}

fn pipeline_options(no_filter_empty: bool, filter_occluded: bool, debug: bool) -> PipelineOptions {
    let options = if no_filter_empty {
        PipelineOptions::default()
    } else {
        PipelineOptions::filtered(filter_config(filter_occluded))
    };
    options.with_debug(debug)
}

/// Prepare and combine `datasets`, then write the result to `output` in
/// Datumaro layout.
fn run_pipeline(
    command: &str,
    datasets: &[PathBuf],
    output: &Path,
    options: PipelineOptions,
    mode: MergeMode,
    save_media: bool,
    assume_yes: bool,
) -> Result<()> {
    if !confirm_overwrite(output, assume_yes)? {
        println!("⚠️  Nothing written.");
        return Ok(());
    }

    let orchestrator = Orchestrator::new(options)?;
    let summary = match benchmark(command, || orchestrator.run(datasets, &mode)) {
        Ok(summary) => summary,
        Err(e) => {
            record(output, RunRecord::new(command, datasets, output, RunState::Aborted));
            return Err(e).with_context(|| format!("{} aborted", command));
        }
    };

    for report in &summary.sources {
        print_source(report);
    }
    export(&orchestrator, &summary.dataset, &DatumaroFormat, output, save_media)?;
    if orchestrator.scratch().keeps_files() {
        println!("⚠️  Intermediate datasets kept in {}", orchestrator.scratch().root().display());
    }

    let skipped = summary
        .sources
        .iter()
        .filter(|r| r.stage == SourceStage::Skipped)
        .count();
    println!(
        "✅ Wrote {} frame(s) with {} box(es) → {}",
        summary.dataset.len(),
        summary.dataset.total_annotations(),
        output.display()
    );
    record(
        output,
        RunRecord::new(command, datasets, output, RunState::Merged).with_counts(
            summary.dataset.len(),
            summary.dataset.total_annotations(),
            skipped,
        ),
    );
    Ok(())
}

fn print_source(report: &SourceReport) {
    match (&report.stage, &report.id_range) {
        (SourceStage::Skipped, _) => println!(
            "   ⚠️  {} ({}): no annotated frames, skipped",
            report.path.display(),
            report.format
        ),
        (_, Some(ids)) => println!(
            "   ▶ {} ({}): {} frame(s), {} dropped, ids {}..{}",
            report.path.display(),
            report.format,
            report.imported_items,
            report.removed_items,
            ids.start,
            ids.end
        ),
        (_, None) => println!(
            "   ▶ {} ({}): {} frame(s)",
            report.path.display(),
            report.format,
            report.imported_items
        ),
    }
}

fn export(
    orchestrator: &Orchestrator,
    dataset: &Dataset,
    format: &dyn DatasetFormat,
    output: &Path,
    save_media: bool,
) -> Result<()> {
    let copied = orchestrator
        .write_output(format, dataset, output, save_media)
        .with_context(|| format!("Failed to write {} dataset to {:?}", format.name(), output))?;
    if copied && !save_media {
        println!("⚠️  Media copied into {} so the output stays readable", output.display());
    }
    Ok(())
}

/// Ask before writing into a directory that already has content.
fn confirm_overwrite(output: &Path, assume_yes: bool) -> Result<bool> {
    let occupied = output.is_dir()
        && fs::read_dir(output)
            .with_context(|| format!("Failed to read directory {:?}", output))?
            .next()
            .is_some();
    if !occupied || assume_yes {
        return Ok(true);
    }
    let answer = Confirm::new()
        .with_prompt(format!("{} is not empty. Write into it anyway?", output.display()))
        .default(false)
        .interact()?;
    Ok(answer)
}

/// Append a run to the output's history. Failures only warn.
fn record(output: &Path, record: RunRecord) {
    let result = fs::create_dir_all(output).and_then(|_| history::append(output, &record));
    if let Err(e) = result {
        log::warn!("Failed to record history in {}: {}", output.display(), e);
    }
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
