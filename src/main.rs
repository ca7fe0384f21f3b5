//! escjit - escape analysis and its transforms over a JIT IR
//!
//! # Usage
//!
//! ```bash
//! # Optimize a JSON module and print what changed
//! escjit opt module.json --report
//!
//! # Use an options file and keep the callee summaries
//! escjit opt module.json --config escape.toml --save-summaries cache.esum
//!
//! # Run one of the built-in samples
//! escjit demo passed-twice --show-ir
//!
//! # Inspect a saved summary cache
//! escjit summaries cache.esum
//! ```

use clap::{Parser, Subcommand};
use compiler::ir::dump::dump_function;
use compiler::ir::escape::{EscapeAnalysisPass, EscapeOptions, EscapeReport, SummaryCache};
use compiler::ir::optimization::{OptimizationPass, PassManager};
use compiler::ir::IrModule;
use compiler::logging;
use compiler::samples::Scenario;
use log::info;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "escjit")]
#[command(version = "0.1.0")]
#[command(about = "Connection-graph escape analysis for a managed-language JIT IR", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run escape analysis and its transforms over a JSON module
    Opt {
        /// Path to the module in JSON form
        module: PathBuf,

        /// TOML file with an [escape] table
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print every method before and after
        #[arg(long)]
        show_ir: bool,

        /// Print per-object escape states
        #[arg(long)]
        report: bool,

        /// Summary cache to load before and save after the run
        #[arg(long)]
        save_summaries: Option<PathBuf>,

        /// Where to write the optimized module
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Optimize one of the built-in sample modules
    Demo {
        /// sum-of-fields, static-store, local-lock, passed-twice, this-lock,
        /// virtual-lock or final-reads
        scenario: Scenario,

        /// Print the sample before and after
        #[arg(long)]
        show_ir: bool,

        /// Write the unoptimized sample module as JSON instead
        #[arg(long)]
        emit: Option<PathBuf>,
    },

    /// List the summaries stored in a cache file
    Summaries {
        /// Path to a file written by --save-summaries
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init_with_level(logging::level_for_verbosity(cli.verbose));

    let result = match cli.command {
        Commands::Opt {
            module,
            config,
            show_ir,
            report,
            save_summaries,
            output,
        } => optimize_file(module, config, show_ir, report, save_summaries, output),
        Commands::Demo {
            scenario,
            show_ir,
            emit,
        } => run_demo(scenario, show_ir, emit),
        Commands::Summaries { file, json } => show_summaries(file, json),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_options(config: Option<PathBuf>) -> Result<EscapeOptions, String> {
    let options = match config {
        Some(path) => EscapeOptions::from_file(&path).map_err(|e| e.to_string())?,
        None => EscapeOptions::default(),
    };
    Ok(options.with_env_overrides())
}

fn optimize_file(
    file: PathBuf,
    config: Option<PathBuf>,
    show_ir: bool,
    report: bool,
    save_summaries: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<(), String> {
    let options = load_options(config)?;
    let source = std::fs::read_to_string(&file)
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let mut module =
        IrModule::from_json(&source).map_err(|e| format!("Invalid module {}: {}", file.display(), e))?;
    module
        .verify()
        .map_err(|e| format!("Module {} is malformed: {}", file.display(), e))?;

    let cache = Arc::new(SummaryCache::new());
    if let Some(path) = &save_summaries {
        if path.exists() {
            let loaded = cache.load(path).map_err(|e| e.to_string())?;
            info!("{} summaries loaded from {}", loaded, path.display());
        }
    }

    let reports = optimize(&mut module, options, cache.clone(), show_ir)?;
    print_reports(&reports, report);

    if let Some(path) = &save_summaries {
        cache.save(path).map_err(|e| e.to_string())?;
        println!("{} summaries saved to {}", cache.len(), path.display());
    }
    if let Some(path) = output {
        let json = module
            .to_json()
            .map_err(|e| format!("Failed to serialize module: {}", e))?;
        std::fs::write(&path, json).map_err(|e| format!("Failed to write output: {}", e))?;
        println!("Optimized module written to {}", path.display());
    }
    Ok(())
}

fn optimize(
    module: &mut IrModule,
    options: EscapeOptions,
    cache: Arc<SummaryCache>,
    show_ir: bool,
) -> Result<Vec<EscapeReport>, String> {
    if show_ir {
        println!("--- before ---");
        for function in module.functions.values() {
            println!("{}", dump_function(function));
        }
    }

    let mut pass = EscapeAnalysisPass::with_cache(options, cache.clone());
    let result = pass.run_on_module(module);
    let cleanup = PassManager::cleanup().run(module);
    module
        .verify()
        .map_err(|e| format!("Optimized module is malformed: {}", e))?;

    if show_ir {
        println!("--- after ---");
        for function in module.functions.values() {
            println!("{}", dump_function(function));
        }
    }

    let mut stats: Vec<_> = result.stats.iter().collect();
    stats.sort();
    for (key, value) in stats {
        println!("  {:<22} {}", key, value);
    }
    println!(
        "  {:<22} {}",
        "instructions_removed",
        result.instructions_eliminated + cleanup.instructions_eliminated
    );
    println!("  {:<22} {}", "summary_cache", cache.stats());
    Ok(pass.take_reports())
}

fn print_reports(reports: &[EscapeReport], detailed: bool) {
    for report in reports {
        let marker = if report.changed() { "*" } else { " " };
        println!(
            "{} {} ({} monitors removed, {} guarded, {} scalarized, {} final fields)",
            marker,
            report.method,
            report.monitors.removed,
            report.monitors.this_guarded + report.monitors.virtual_guarded,
            report.scalar.local + report.scalar.escaped,
            report.scalar.final_fields
        );
        if !detailed {
            continue;
        }
        println!("    summary: {}", report.summary);
        for object in &report.objects {
            let mut flags = Vec::new();
            if object.out_escaped {
                flags.push("out");
            }
            if object.virtual_call {
                flags.push("virtual");
            }
            if object.loop_created {
                flags.push("loop");
            }
            println!(
                "    {:<6} {:<7} {:<7} {}",
                object.value.to_string(),
                object.kind.to_string(),
                object.state.to_string(),
                flags.join(",")
            );
        }
    }
}

fn run_demo(scenario: Scenario, show_ir: bool, emit: Option<PathBuf>) -> Result<(), String> {
    let mut sample = scenario
        .build()
        .ok_or_else(|| format!("Sample {} could not be built", scenario))?;

    if let Some(path) = emit {
        let json = sample
            .module
            .to_json()
            .map_err(|e| format!("Failed to serialize module: {}", e))?;
        std::fs::write(&path, json).map_err(|e| format!("Failed to write output: {}", e))?;
        println!("{} written to {}", scenario, path.display());
        return Ok(());
    }

    println!("Scenario {}", scenario);
    let options = EscapeOptions::default().with_env_overrides();
    let reports = optimize(
        &mut sample.module,
        options,
        Arc::new(SummaryCache::new()),
        show_ir,
    )?;
    print_reports(&reports, true);
    Ok(())
}

fn show_summaries(file: PathBuf, json: bool) -> Result<(), String> {
    let cache = SummaryCache::new();
    let count = cache.load(&file).map_err(|e| e.to_string())?;
    if json {
        println!("{}", cache.to_json().map_err(|e| e.to_string())?);
        return Ok(());
    }
    println!("{} summaries in {}", count, file.display());
    for summary in cache.snapshot() {
        println!("  {}", summary);
    }
    Ok(())
}
