// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for registering computations and provisioning worktrees.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for registering computations and provisioning worktrees.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use remake_spec::{read_list, PatternPath};

use remake::glob::parse_patterns;
use remake::make::parse_parameters;
use remake::{
    init_logging, make, provide, remove, ConfigStack, Dataset, GitSignatureVerifier,
    MakeRequest, ProvisionOutcome, RemakeError, Status, StatusRecord,
};

#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "Register and provision on-demand computations",
    long_about = None
)]
struct Cli {
    /// Root of the dataset to operate on.
    #[arg(short = 'd', long, default_value = ".")]
    dataset: PathBuf,

    /// Configuration override applied before every other source.
    #[arg(short = 'c', long = "config", value_name = "NAME=VALUE")]
    config: Vec<String>,

    /// Enable debug logging.
    #[arg(short = 'v', long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a computation and attach compute pointers to its outputs.
    Make(MakeArgs),
    /// Create a worktree holding the given inputs, or delete one.
    Provision(ProvisionArgs),
}

#[derive(Debug, Args)]
struct MakeArgs {
    /// Name of the method template under .datalad/make/methods.
    template: String,

    /// Label used to prioritise between competing computations.
    #[arg(long)]
    label: Option<String>,

    /// Revision to provision inputs from.
    #[arg(short = 'b', long)]
    branch: Option<String>,

    /// Input pattern, relative to the dataset root.
    #[arg(short = 'i', long = "input", value_name = "PATTERN")]
    inputs: Vec<String>,

    /// File listing input patterns, one per line.
    #[arg(short = 'I', long, value_name = "FILE")]
    input_list: Option<PathBuf>,

    /// Output pattern, relative to the dataset root.
    #[arg(short = 'o', long = "output", value_name = "PATTERN")]
    outputs: Vec<String>,

    /// File listing output patterns, one per line.
    #[arg(short = 'O', long, value_name = "FILE")]
    output_list: Option<PathBuf>,

    /// Template parameter binding.
    #[arg(short = 'p', long = "parameter", value_name = "NAME=VALUE")]
    parameters: Vec<String>,

    /// File listing parameter bindings, one per line.
    #[arg(short = 'P', long, value_name = "FILE")]
    parameter_list: Option<PathBuf>,

    /// Capture the command's stdout in this dataset file.
    #[arg(long, value_name = "PATH")]
    stdout: Option<String>,

    /// Only register the computation; outputs are produced on first access.
    #[arg(long, default_value_t = false)]
    prospective_execution: bool,

    /// Run the template without verifying its signature.
    #[arg(long, default_value_t = false)]
    allow_untrusted_execution: bool,
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    /// Revision to check out.
    #[arg(short = 'b', long, conflicts_with = "delete")]
    branch: Option<String>,

    /// Empty directory to create the worktree in.
    #[arg(long, value_name = "DIR", conflicts_with = "delete")]
    worktree_dir: Option<PathBuf>,

    /// Input pattern, relative to the dataset root.
    #[arg(short = 'i', long = "input", value_name = "PATTERN")]
    inputs: Vec<String>,

    /// File listing input patterns, one per line.
    #[arg(short = 'I', long, value_name = "FILE")]
    input_list: Option<PathBuf>,

    /// Remove a previously provisioned worktree.
    #[arg(long, value_name = "WORKTREE")]
    delete: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let dataset = Dataset::open(&cli.dataset)
        .with_context(|| format!("cannot open dataset {}", cli.dataset.display()))?;
    let overrides = parse_parameters(&cli.config).context("invalid --config value")?;

    match cli.command {
        Command::Make(args) => run_make(&dataset, &overrides, args),
        Command::Provision(args) => run_provision(&dataset, args),
    }
}

fn run_make(
    dataset: &Dataset,
    overrides: &BTreeMap<String, String>,
    args: MakeArgs,
) -> Result<()> {
    let inputs = collect_items(args.inputs, args.input_list.as_deref())?;
    let outputs = collect_items(args.outputs, args.output_list.as_deref())?;
    let parameters = collect_items(args.parameters, args.parameter_list.as_deref())?;
    let stdout = args
        .stdout
        .as_deref()
        .map(PatternPath::new)
        .transpose()
        .context("invalid --stdout path")?;

    let request = MakeRequest {
        template: args.template,
        label: args.label,
        branch: args.branch,
        inputs: parse_patterns(&inputs),
        outputs: parse_patterns(&outputs),
        parameters: parse_parameters(&parameters)?,
        stdout,
        prospective: args.prospective_execution,
        allow_untrusted_execution: args.allow_untrusted_execution,
    };
    let config = ConfigStack::load(dataset.path(), overrides)?;
    match make(dataset, &request, &config, &GitSignatureVerifier) {
        Ok(records) => emit(&records),
        Err(RemakeError::DirtyDataset { dataset: path, entries }) => {
            let records: Vec<StatusRecord> = entries
                .iter()
                .map(|entry| StatusRecord::dirty(&path, entry))
                .collect();
            emit(&records)?;
            bail!("dataset {} has unclean inputs", path.display())
        }
        Err(err) => Err(err).context(format!("make {} failed", request.template)),
    }
}

fn run_provision(dataset: &Dataset, args: ProvisionArgs) -> Result<()> {
    if let Some(worktree) = args.delete {
        remove(dataset, &worktree)
            .with_context(|| format!("cannot remove worktree {}", worktree.display()))?;
        info!("removed worktree {}", worktree.display());
        return emit(&[StatusRecord::new("provision", Status::Ok, worktree)
            .with_message("worktree removed")]);
    }

    let inputs = parse_patterns(&collect_items(args.inputs, args.input_list.as_deref())?);
    let outcome = provide(
        dataset,
        &inputs,
        args.branch.as_deref(),
        args.worktree_dir.as_deref(),
    )?;
    match outcome {
        ProvisionOutcome::Provisioned(path) => {
            emit(&[StatusRecord::new("provision", Status::Ok, path)])
        }
        ProvisionOutcome::Dirty(entries) => {
            let records: Vec<StatusRecord> = entries
                .iter()
                .map(|entry| StatusRecord::dirty(dataset.path(), entry))
                .collect();
            emit(&records)?;
            bail!("dataset {} has unclean inputs", dataset.path().display())
        }
    }
}

fn collect_items(mut items: Vec<String>, list: Option<&Path>) -> Result<Vec<String>> {
    let listed = read_list(list).with_context(|| {
        format!(
            "cannot read list file {}",
            list.unwrap_or(Path::new("")).display()
        )
    })?;
    items.extend(listed);
    Ok(items)
}

fn emit(records: &[StatusRecord]) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for record in records {
        writeln!(out, "{}", record.to_json_line()?)?;
    }
    out.flush()?;
    Ok(())
}
