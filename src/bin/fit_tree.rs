use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use serde::Serialize;

use tree_fitter_rs::{DecayTree, FitConfig, FitSummary, Fitter};

#[derive(Parser, Debug)]
#[command(about = "Fit decay trees read from JSON files")]
struct Args {
    /// Decay tree descriptions (JSON)
    #[arg(required = true)]
    trees: Vec<PathBuf>,

    /// Fit configuration (JSON); missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the maximum number of global passes
    #[arg(long)]
    max_passes: Option<usize>,

    /// Fold the kinematic, geometric and mass constraints into one update
    #[arg(long, default_value_t = false)]
    merge: bool,

    /// Make each decaying particle's four-momentum the sum of its daughters' after the fit
    #[arg(long, default_value_t = false)]
    force_p4_sum: bool,

    /// Pretty-print the JSON reports
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Serialize)]
struct FitReport {
    input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<FitSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn load_config(args: &Args) -> Result<FitConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            FitConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FitConfig::default(),
    };
    if let Some(max_passes) = args.max_passes {
        config.max_passes = max_passes;
    }
    config.merge_constraints |= args.merge;
    config.force_p4_sum |= args.force_p4_sum;
    Ok(config)
}

/// Setup problems are errors; a fit that ran but failed still reports the
/// state it reached.
fn fit_file(path: &Path, config: &FitConfig) -> Result<FitReport> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let tree = DecayTree::from_json(&text)
        .with_context(|| format!("building tree from {}", path.display()))?;
    let mut fitter = Fitter::new(tree, config.clone())?;

    let input = path.display().to_string();
    Ok(match fitter.fit() {
        Ok(summary) => FitReport {
            input,
            summary: Some(summary),
            error: None,
        },
        Err(e) => FitReport {
            input,
            summary: Some(fitter.get_summary()),
            error: Some(e.to_string()),
        },
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;
    info!("fitting {} tree(s)", args.trees.len());

    let reports: Vec<FitReport> = crossbeam::scope(|scope| {
        let handles: Vec<_> = args
            .trees
            .iter()
            .map(|path| {
                let config = &config;
                scope.spawn(move |_| {
                    fit_file(path, config).unwrap_or_else(|e| {
                        error!("{}: {:#}", path.display(), e);
                        FitReport {
                            input: path.display().to_string(),
                            summary: None,
                            error: Some(format!("{:#}", e)),
                        }
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(&args.trees)
            .map(|(handle, path)| {
                handle.join().unwrap_or_else(|_| FitReport {
                    input: path.display().to_string(),
                    summary: None,
                    error: Some("fit thread panicked".to_string()),
                })
            })
            .collect()
    })
    .map_err(|_| anyhow::anyhow!("fit worker panicked"))?;

    let mut failures = 0;
    for report in &reports {
        if report.error.is_some() {
            failures += 1;
        }
        let line = if args.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        println!("{}", line);
    }
    info!("{} fitted, {} failed", reports.len() - failures, failures);
    Ok(())
}
