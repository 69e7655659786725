mod annotation;
mod bytecode;
mod classfile;
mod classpath;
mod descriptor;
mod error;
mod ir;
mod opcodes;
mod output;
mod pointcut;
mod report;
mod scan;
#[cfg(test)]
mod testing;
mod weave;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::annotation::{AnnotationScanner, DEFAULT_ANNOTATION_PACKAGE, Vocabulary};
use crate::classpath::ClassIndex;
use crate::output::{weave_input, write_input};
use crate::report::{PointcutCounts, RunReport};
use crate::scan::{InputSource, read_classpath, read_inputs};
use crate::weave::Weaver;

/// CLI arguments for weft execution.
#[derive(Parser, Debug)]
#[command(
    name = "weft",
    about = "Compile-time aspect weaving for JVM class files and JAR files.",
    version
)]
struct Cli {
    /// Class directory, archive or class file to weave. Repeatable.
    #[arg(long, value_name = "PATH", required = true)]
    input: Vec<PathBuf>,
    /// Directory receiving one woven copy per input.
    #[arg(long, value_name = "DIR")]
    output: PathBuf,
    /// Libraries used only to resolve types.
    #[arg(long, value_name = "PATH")]
    classpath: Vec<PathBuf>,
    /// Package prefix never woven, e.g. `com.example.generated`.
    #[arg(long = "exclude-package", value_name = "PKG")]
    exclude_package: Vec<String>,
    /// Package holding the aspect annotations.
    #[arg(long, value_name = "PKG", default_value = DEFAULT_ANNOTATION_PACKAGE)]
    annotation_package: String,
    /// Write a JSON run report; `-` for stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    run(cli)
}

/// `WEFT_LOG` overrides the level picked from the flags.
fn init_tracing(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    validate(&cli)?;
    let started_at = Instant::now();

    let inputs = read_inputs(&cli.input)?;
    let libraries = read_classpath(&cli.classpath)?;
    let index = ClassIndex::build(
        inputs
            .iter()
            .flat_map(|input| input.classes.iter())
            .chain(libraries.iter()),
    );
    tracing::info!(classes = index.len(), "indexed classes");

    let vocabulary = Vocabulary::new(&cli.annotation_package);
    let mut scanner = AnnotationScanner::new(&vocabulary, &index);
    for input in &inputs {
        for entry in &input.classes {
            scanner
                .scan_class(&entry.location, &entry.bytes)
                .with_context(|| format!("scan {}", input.path.display()))?;
        }
    }
    let aspects = scanner.aspect_count();
    let model = scanner.finish();
    let pointcuts = PointcutCounts::from_model(&model);
    tracing::info!(
        aspects,
        call = pointcuts.call,
        execute = pointcuts.execute,
        super_execute = pointcuts.super_execute,
        "collected pointcuts"
    );
    if model.is_empty() {
        tracing::warn!("no advice found, inputs are copied unchanged");
    }

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("failed to create {}", cli.output.display()))?;
    let weaver = Weaver::new(&model, &index, &cli.exclude_package);
    let mut reports = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let mut woven = weave_input(input, &weaver)?;
        write_input(input, &mut woven, &cli.output)?;
        reports.push(woven.report);
    }
    let report = RunReport {
        aspects,
        pointcuts,
        inputs: reports,
    };
    tracing::info!(
        woven = report.woven_count(),
        failed = report.failed_count(),
        "weaving finished"
    );

    if let Some(path) = cli.report.as_deref() {
        let mut writer = output_writer(path)?;
        report.write_json(&mut writer)?;
    }

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} classes={} inputs={}",
            started_at.elapsed().as_millis(),
            class_count(&inputs),
            inputs.len()
        );
    }

    Ok(())
}

fn validate(cli: &Cli) -> Result<()> {
    for input in &cli.input {
        if !input.exists() {
            anyhow::bail!("input not found: {}", input.display());
        }
    }
    for entry in &cli.classpath {
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
    }
    // Outputs are named after their inputs.
    let mut names = HashSet::new();
    for input in &cli.input {
        let name = input
            .file_name()
            .with_context(|| format!("input has no file name: {}", input.display()))?;
        if !names.insert(name.to_os_string()) {
            anyhow::bail!("duplicate input file name: {}", name.to_string_lossy());
        }
    }
    Ok(())
}

fn class_count(inputs: &[InputSource]) -> usize {
    inputs.iter().map(|input| input.classes.len()).sum()
}

fn output_writer(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    Ok(Box::new(
        File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
    ))
}
