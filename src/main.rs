//! Phenostream CLI: run a pipeline configuration over an image timestream.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use phenostream::execution::PROGRESS_TARGET;
use phenostream::prelude::*;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "phenostream", version, about = "Plant phenotyping over image timestreams")]
struct Args {
    /// Input timestream directory
    #[arg(short, long, value_name = "DIR", required_unless_present = "list_stages")]
    input: Option<PathBuf>,
    /// Output root; overrides general.outputPath
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Pipeline configuration (defaults to <input>/_data/pipeline.yml)
    #[arg(short, long, value_name = "FILE")]
    pipeline: Option<PathBuf>,
    /// Timestream configuration merged into the `general` section
    #[arg(short, long = "timestream-config", value_name = "FILE")]
    timestream_config: Option<PathBuf>,
    /// 0 off, 1 info, 2 info with timestamps, 3 debug
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=3))]
    verbosity: u8,
    /// Also write the log to this file
    #[arg(long, value_name = "FILE")]
    logfile: Option<PathBuf>,
    /// Reprocess frames the outputs already hold
    #[arg(long)]
    recalculate: bool,
    /// Configuration overrides, e.g. `general.visualise=true,pipeline.2.minScore=0.4`
    #[arg(long, value_name = "KEY=VALUE[,KEY=VALUE]")]
    set: Option<String>,
    /// List the available stages and exit
    #[arg(long)]
    list_stages: bool,
}

fn init_logging(verbosity: u8, logfile: Option<&Path>) {
    let level = match verbosity {
        0 => LevelFilter::Off,
        1 | 2 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let timestamps = verbosity >= 2;

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LevelFilter::Off)
        .filter_module("phenostream", level)
        .filter(Some(PROGRESS_TARGET), level);

    let mut to_file = false;
    if let Some(path) = logfile {
        match File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
                to_file = true;
            }
            Err(e) => eprintln!("cannot open log file {}: {}", path.display(), e),
        }
    }

    builder.format(move |buf, record| {
        if record.target() == PROGRESS_TARGET && !to_file {
            write!(buf, "\r{}", record.args())?;
            return buf.flush();
        }
        if timestamps {
            writeln!(
                buf,
                "{} {:<5} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        } else {
            writeln!(buf, "{:<5} {}", record.level(), record.args())
        }
    });

    if let Err(e) = builder.try_init() {
        eprintln!("logging disabled: {}", e);
    }
}

fn list_stages() {
    let registry = StageRegistry::with_builtins();
    println!("Available stages ({} total):", registry.len());
    for category in registry.categories() {
        println!();
        println!("  {:?}", category);
        for id in registry.stages_by_category(*category) {
            let Some(metadata) = registry.get_metadata(id) else {
                continue;
            };
            println!(
                "    {} - {} [{} -> {}]",
                metadata.id,
                metadata.description,
                PortType::list_display(&metadata.expects),
                PortType::list_display(&metadata.returns)
            );
            for param in &metadata.parameters {
                let default = match &param.default_value {
                    None => "required".to_string(),
                    Some(v) if v.is_null() => "optional".to_string(),
                    Some(v) => format!("default {}", serde_yml::to_string(v).unwrap_or_default().trim()),
                };
                println!("        {} ({}, {}) {}", param.name, param.arg_type, default, param.description);
            }
        }
    }
}

fn load_config(args: &Args, input: &Path) -> Result<PipelineConfig> {
    let pipeline_path = args
        .pipeline
        .clone()
        .unwrap_or_else(|| input.join("_data").join("pipeline.yml"));
    let mut config = Config::load(&pipeline_path)
        .with_context(|| format!("cannot load pipeline configuration {}", pipeline_path.display()))?;

    if let Some(path) = &args.timestream_config {
        let ts_config = Config::load(path)
            .with_context(|| format!("cannot load timestream configuration {}", path.display()))?;
        config.merge_into("general", &ts_config)?;
    }

    let output_root = match (&args.output, config.get_value("general.outputPath")) {
        (Some(dir), _) => Some(dir.clone()),
        (None, Some(_)) => None,
        (None, None) => Some(input.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))),
    };
    if let Some(dir) = output_root {
        config.set("general.outputPath", serde_yml::Value::String(dir.display().to_string()))?;
    }

    if let Some(overrides) = &args.set {
        config.apply_overrides(overrides).context("invalid --set")?;
    }
    config.lock();
    Ok(PipelineConfig::from_config(&config)?)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity, args.logfile.as_deref());

    if args.list_stages {
        list_stages();
        return Ok(());
    }
    let Some(input_dir) = args.input.clone() else {
        bail!("--input is required");
    };

    let input = Timestream::load(&input_dir)
        .with_context(|| format!("cannot open timestream {}", input_dir.display()))?;
    let config = load_config(&args, &input_dir)?;
    log::info!(
        "running {} stages over '{}'",
        config.stages.len(),
        input.name()
    );

    let registry = StageRegistry::with_builtins();
    let mut runner = PipelineRunner::build(&config, &registry, &input).context("cannot build the pipeline")?;
    let summary = runner.run(&input, &RunOptions::new().with_recalculate(args.recalculate))?;

    log::info!(
        "{} frames processed, {} dropped, {} already done",
        summary.processed,
        summary.dropped_total(),
        summary.resumed
    );
    for (kind, count) in &summary.dropped {
        log::info!("  {}: {}", kind, count);
    }
    Ok(())
}
