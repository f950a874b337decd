use std::error::Error;
use std::path::Path;
use std::process;
use std::sync::Arc;

use pavlov::experiments::{assays, builtin_catalog, builtin_document, AssociativeNet};
use pavlov::generator::expand_trial_block;
use pavlov::orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
use pavlov::prng::Prng;
use pavlov::schedule::{Catalog, CatalogError};
use pavlov::stepper::{Granularity, Stepper};

const BUILTIN: &str = "builtin";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (opts, positional) = split_options(&args)?;
    let cmd = positional.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "help" | "--help" | "-h" => print_help(),
        "demo" => {
            let report = assays::renewal(opts.seed, opts.cycles_per_quarter)?;
            assays::print_report(&report);
        }
        "catalog" => println!("{}", serde_json::to_string_pretty(&builtin_document())?),
        "validate" => {
            let path = arg(&positional, 1, "validate <catalog.json>");
            validate(path);
        }
        "schedule" => {
            let path = arg(&positional, 1, "schedule <catalog.json|builtin> <condition>");
            let condition = arg(&positional, 2, "schedule <catalog.json|builtin> <condition>");
            print_schedule(&load(path)?, condition, &opts)?;
        }
        "run" => {
            let path = arg(&positional, 1, "run <catalog.json|builtin> <run>");
            let run = arg(&positional, 2, "run <catalog.json|builtin> <run>");
            run_offline(Arc::new(load(path)?), run, &opts)?;
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            process::exit(2);
        }
    }
    Ok(())
}

struct Options {
    seed: u64,
    cycles_per_quarter: usize,
    blocks: usize,
}

fn split_options(args: &[String]) -> Result<(Options, Vec<String>), Box<dyn Error>> {
    let mut opts = Options {
        seed: 1,
        cycles_per_quarter: OrchestratorConfig::default().cycles_per_quarter,
        blocks: 1,
    };
    let mut positional = Vec::new();
    let mut it = args.iter();
    while let Some(a) = it.next() {
        let mut value = || it.next().ok_or_else(|| format!("{a} needs a value"));
        match a.as_str() {
            "--seed" => opts.seed = value()?.parse()?,
            "--cycles" => opts.cycles_per_quarter = value()?.parse()?,
            "--blocks" => opts.blocks = value()?.parse()?,
            _ => positional.push(a.clone()),
        }
    }
    Ok((opts, positional))
}

fn arg<'a>(positional: &'a [String], idx: usize, usage: &str) -> &'a str {
    match positional.get(idx) {
        Some(s) => s,
        None => {
            eprintln!("usage: pavlov {}", usage);
            process::exit(2);
        }
    }
}

fn load(path: &str) -> Result<Catalog, CatalogError> {
    if path == BUILTIN {
        builtin_catalog()
    } else {
        Catalog::load(Path::new(path))
    }
}

fn print_help() {
    println!("pavlov (conditioning schedule runner)");
    println!("usage:");
    println!("  pavlov demo [--seed N] [--cycles N]         ABA renewal assay on the toy network");
    println!("  pavlov catalog                              Print the built-in catalog as JSON");
    println!("  pavlov validate <catalog.json>              Check a catalog, listing every problem");
    println!("  pavlov schedule <catalog> <condition> [--seed N] [--blocks N]");
    println!("                                              Print expanded trial-blocks");
    println!("  pavlov run <catalog> <run> [--seed N] [--cycles N]");
    println!("                                              Drive a run to completion");
    println!("  pavlov --help");
    println!("<catalog> is a JSON file or `builtin`.");
}

fn validate(path: &str) {
    match Catalog::load(Path::new(path)) {
        Ok(cat) => {
            println!(
                "ok: {} run(s), {} condition(s)",
                cat.run_names().count(),
                cat.condition_names().count()
            );
        }
        Err(CatalogError::Invalid(v)) => {
            eprintln!("{}: {}", path, v);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("{}: {}", path, e);
            process::exit(1);
        }
    }
}

fn print_schedule(cat: &Catalog, condition: &str, opts: &Options) -> Result<(), Box<dyn Error>> {
    let cond = cat
        .condition(condition)
        .ok_or_else(|| format!("unknown condition {condition:?}"))?;
    let templates = cat.templates_for(cond);
    let mut rng = Prng::new(opts.seed);

    for block in 0..opts.blocks {
        let expansion = expand_trial_block(cond, templates, &mut rng);
        println!("block {} ({} trials)", block, expansion.trials.len());
        for (i, t) in expansion.trials.iter().enumerate() {
            println!(
                "  {:3} {:<14} cs={:<3} ctx={:<5} us={} ticks={}",
                i,
                t.trial_name,
                t.cs,
                t.context,
                if t.us_present { "yes" } else { "no" },
                t.alpha_ticks
            );
        }
        for name in &expansion.degenerate_omissions {
            println!("  note: omissions for {name} round to all-or-nothing");
        }
    }
    Ok(())
}

fn run_offline(cat: Arc<Catalog>, run: &str, opts: &Options) -> Result<(), Box<dyn Error>> {
    let stepper = Arc::new(Stepper::new());
    let cfg = OrchestratorConfig {
        cycles_per_quarter: opts.cycles_per_quarter,
        seed: Some(opts.seed),
        ..Default::default()
    };
    let mut orch = Orchestrator::new(cat, run, cfg, Arc::clone(&stepper))?;
    let mut net = AssociativeNet::default();

    // Pause after every trial-block to print progress.
    stepper.start(Granularity::TrialBlock, 1)?;
    loop {
        match orch.run(&mut net)? {
            RunOutcome::Paused => {
                println!("{}", orch.snapshot());
                stepper.resume(Granularity::TrialBlock, 1)?;
            }
            RunOutcome::Completed => break,
            RunOutcome::Stopped => {
                eprintln!("run stopped early");
                break;
            }
        }
    }
    println!("{}", orch.snapshot());
    println!("cycles={} weight_updates={}", net.cycles(), net.updates());
    Ok(())
}
