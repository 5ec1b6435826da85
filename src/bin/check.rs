//! Schema Compatibility Checker CLI
//!
//! Evaluates a writer or reader candidate against a recorded scenario without
//! touching any store.
//!
//! Scenario file (JSON):
//! ```json
//! {
//!   "policy": { "policy": "forward_transitive" },
//!   "validate_by_object_type": false,
//!   "history": [ { "schema_name": "User", "version": 0 } ],
//!   "others": [ { "schema_name": "User", "version": 0 } ],
//!   "candidate": { "schema_name": "User", "version": 0 },
//!   "role": "writer"
//! }
//! ```

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use schema_groups::{
    Compatibility, CompatibilityChecker, RegistryConfig, Role, SchemaEvolution, SchemaInfo,
    SerializationFormat, VersionInfo,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-check")]
#[command(about = "Check a candidate schema version against a compatibility policy")]
struct Cli {
    /// Scenario file, or "-" for stdin
    scenario: String,

    /// Override policy name (e.g. "backward_transitive")
    #[arg(short, long)]
    policy: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the verdict as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Deserialize)]
struct Scenario {
    #[serde(default)]
    policy: Option<Compatibility>,
    #[serde(default)]
    validate_by_object_type: Option<bool>,
    #[serde(default)]
    history: Vec<VersionInfo>,
    #[serde(default)]
    others: Vec<VersionInfo>,
    candidate: VersionInfo,
    role: Role,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let config =
        RegistryConfig::load_from(config_path.as_deref()).context("loading configuration")?;

    let raw = read_scenario(&cli.scenario)?;
    let scenario: Scenario = serde_json::from_str(&raw).context("parsing scenario")?;

    let policy = match (&cli.policy, scenario.policy) {
        (Some(name), _) => Compatibility::parse(name, None, None)?,
        (None, Some(policy)) => policy,
        (None, None) => config.groups.properties()?.compatibility,
    };
    let validate_by_object_type = scenario
        .validate_by_object_type
        .unwrap_or(config.groups.validate_by_object_type);
    debug!(policy = %policy, validate_by_object_type, "loaded scenario");

    let history: Vec<SchemaEvolution> = scenario
        .history
        .into_iter()
        .map(|version| SchemaEvolution {
            schema: SchemaInfo::new(
                version.schema_name.clone(),
                SerializationFormat::Any,
                Vec::new(),
            ),
            version,
            compatibility: policy.clone(),
            timestamp: Utc::now(),
        })
        .collect();

    let checker = CompatibilityChecker::new(&policy, &history, validate_by_object_type);
    let result = checker.check(scenario.role, &scenario.candidate, &scenario.others);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.is_compatible {
        println!("✅ {}", result.summary);
    } else {
        println!("❌ {} is incompatible under {}", scenario.candidate, policy);
        for violation in &result.violations {
            println!("  - {}", violation);
        }
    }

    Ok(result.is_compatible)
}

fn read_scenario(path: &str) -> Result<String> {
    if path == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading scenario from stdin")?;
        Ok(raw)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))
    }
}
