//! qgraph CLI: inspect plans built from YAML pipelines or plan documents.

use clap::{Parser, Subcommand};
use qgraph_core::config::PlanConfig;
use qgraph_core::hash::Fingerprint;
use qgraph_plan::{parse_yaml_pipeline, Plan, SerializeFlags, VisitRecorder};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "qgraph")]
#[command(about = "Build, check and explain query execution plans", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the explain document for a plan
    Explain {
        /// YAML pipeline or JSON plan document
        #[arg(short, long)]
        plan: PathBuf,

        /// Rewrite nested subqueries into SUBQUERY_START/SUBQUERY_END
        #[arg(long)]
        splice: bool,

        /// Run liveness and register planning first
        #[arg(long)]
        registers: bool,

        /// Plan async prefetching and call-stack splits first
        #[arg(long)]
        hints: bool,

        /// Print the node visit order to stderr
        #[arg(long)]
        trace_walk: bool,
    },

    /// Check that a plan loads and its edges are consistent
    Validate {
        /// YAML pipeline or JSON plan document
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// Print the blake3 fingerprint of the plan
    Fingerprint {
        /// YAML pipeline or JSON plan document
        #[arg(short, long)]
        plan: PathBuf,

        /// Hash the document serialized with these comma-separated flags
        /// (details, parents, estimates, functions, registers) instead of
        /// the plan structure
        #[arg(long)]
        flags: Option<String>,
    },
}

fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
    });
}

fn main() {
    install_tracing_subscriber();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Explain {
            plan,
            splice,
            registers,
            hints,
            trace_walk,
        } => explain_plan(&plan, splice, registers, hints, trace_walk),
        Commands::Validate { plan } => validate_plan(&plan),
        Commands::Fingerprint { plan, flags } => fingerprint_plan(&plan, flags.as_deref()),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// `.json` files are plan documents; anything else is a YAML pipeline.
fn load_plan(path: &Path) -> Result<Plan, Box<dyn std::error::Error>> {
    let src = fs::read_to_string(path)?;
    let plan = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let doc: serde_json::Value = serde_json::from_str(&src)?;
        let config = PlanConfig::from_env();
        config.validate()?;
        Plan::from_document_with_config(&doc, config)?
    } else {
        parse_yaml_pipeline(&src)?
    };
    debug!(path = %path.display(), nodes = plan.len(), "loaded plan");
    Ok(plan)
}

fn parse_flags(list: &str) -> Result<SerializeFlags, String> {
    let mut flags = SerializeFlags::NONE;
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        flags |= match name {
            "details" => SerializeFlags::DETAILS,
            "parents" => SerializeFlags::PARENTS,
            "estimates" => SerializeFlags::ESTIMATES,
            "functions" => SerializeFlags::FUNCTIONS,
            "registers" => SerializeFlags::REGISTER_INFORMATION,
            other => return Err(format!("unknown serialization flag '{other}'")),
        };
    }
    Ok(flags)
}

fn explain_plan(
    path: &Path,
    splice: bool,
    registers: bool,
    hints: bool,
    trace_walk: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut plan = load_plan(path)?;
    if splice {
        plan.splice_subqueries()?;
    }
    if registers {
        plan.find_var_usage()?;
        plan.plan_registers()?;
    }
    if hints {
        plan.plan_async_prefetching();
        plan.plan_callstack_splits();
    }
    if trace_walk {
        if let Some(root) = plan.root() {
            let mut recorder = VisitRecorder::default();
            plan.walk(root, &mut recorder);
            let order: Vec<String> = recorder
                .after
                .iter()
                .map(|id| format!("{}#{}", plan.node(*id).type_name(), id.get()))
                .collect();
            eprintln!("{}", order.join(" -> "));
        }
    }
    let explain = plan.explain()?;
    println!("{}", serde_json::to_string_pretty(&explain)?);
    Ok(())
}

fn validate_plan(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let plan = load_plan(path)?;
    plan.verify()?;
    if plan.root().is_none() {
        return Err("plan has no root node".into());
    }
    println!("✓ Plan is valid ({} nodes)", plan.len());
    Ok(())
}

fn fingerprint_plan(path: &Path, flags: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let plan = load_plan(path)?;
    let fingerprint = match flags {
        Some(list) => Fingerprint::of_document(&plan.to_document(parse_flags(list)?)?)?,
        None => plan.fingerprint()?,
    };
    println!("{fingerprint}");
    Ok(())
}
