//! # Tasker Flow Configuration Validator
//!
//! Command-line tool for validating `tasker-flow.yaml` across environments.
//! Catches invalid thresholds and unknown strategies before a process
//! builds its integration manager or orchestrator from the file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tasker_flow::config::{ConfigManager, TaskerFlowConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const ENVIRONMENTS: [&str; 3] = ["development", "test", "production"];

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate Tasker Flow configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment whose override section is merged over the base values
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: $TASKER_CONFIG_DIR or ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every configuration section
    All,

    /// Validate and summarize one section
    Component {
        /// Section name (retry, circuit_breakers, resource_pools, queues, events, workflow, targets)
        name: String,
    },

    /// Validate the file once per known environment
    Environments,

    /// Print the merged configuration
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all_config(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Environments) => validate_environments(&cli),
        Some(Commands::Show) => show_config(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e}");
            eprintln!("❌ {e}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> anyhow::Result<ConfigManager> {
    Ok(ConfigManager::load_from_directory_with_env(
        cli.config_dir.clone(),
        environment,
    )?)
}

fn validate_all_config(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli, &cli.environment)?;
    let config = manager.config();

    if cli.format == "json" {
        println!("{}", serde_json::to_string_pretty(&summary(&manager))?);
        return Ok(());
    }

    println!("🔧 Validating Tasker Flow Configuration");
    println!("Environment: {}", manager.environment());
    println!("Config Directory: {}", manager.config_directory().display());
    println!();

    print_retry(config);
    print_circuit_breakers(config);
    print_resource_pools(config);
    print_queues(config);
    print_events(config);
    print_workflow(config);
    print_targets(config);

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(cli: &Cli, component_name: &str) -> anyhow::Result<()> {
    let manager = load(cli, &cli.environment)?;
    let config = manager.config();

    match component_name.to_lowercase().replace('-', "_").as_str() {
        "retry" => print_retry(config),
        "circuit_breakers" => print_circuit_breakers(config),
        "resource_pools" | "bulkheads" => print_resource_pools(config),
        "queues" => print_queues(config),
        "events" => print_events(config),
        "workflow" => print_workflow(config),
        "targets" => print_targets(config),
        _ => anyhow::bail!("Unknown component: {component_name}"),
    }

    println!("✅ Component '{component_name}' validation passed!");
    Ok(())
}

fn validate_environments(cli: &Cli) -> anyhow::Result<()> {
    let mut failures = 0;
    for environment in ENVIRONMENTS {
        match load(cli, environment) {
            Ok(_) => println!("  ✅ {environment}"),
            Err(e) => {
                failures += 1;
                println!("  ❌ {environment}: {e}");
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} environment(s) failed validation");
    }
    Ok(())
}

fn show_config(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli, &cli.environment)?;
    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(manager.config())?),
        _ => print!("{}", serde_yaml::to_string(manager.config())?),
    }
    Ok(())
}

fn summary(manager: &ConfigManager) -> serde_json::Value {
    let config = manager.config();
    let mut targets: Vec<_> = config.targets.keys().cloned().collect();
    targets.sort();
    serde_json::json!({
        "valid": true,
        "environment": manager.environment(),
        "configDirectory": manager.config_directory().display().to_string(),
        "retry": {
            "maxAttempts": config.retry.max_attempts,
            "baseDelayMs": config.retry.base_delay_ms,
            "maxDelayMs": config.retry.max_delay_ms,
        },
        "circuitBreakersEnabled": config.circuit_breakers.enabled,
        "resourcePools": config.resource_pools.pools.len(),
        "errorStrategy": config.workflow.error_strategy,
        "maxConcurrentSteps": config.workflow.max_concurrent_steps,
        "targets": targets,
    })
}

fn print_retry(config: &TaskerFlowConfig) {
    println!("🔁 Retry");
    println!(
        "   ✅ {} attempt(s), {}ms base delay x{} up to {}ms, jitter {}",
        config.retry.max_attempts,
        config.retry.base_delay_ms,
        config.retry.backoff_multiplier,
        config.retry.max_delay_ms,
        if config.retry.jitter_enabled { "on" } else { "off" }
    );
}

fn print_circuit_breakers(config: &TaskerFlowConfig) {
    println!("🔌 Circuit Breakers");
    if !config.circuit_breakers.enabled {
        println!("   ℹ️  Circuit breakers disabled");
        return;
    }
    let defaults = &config.circuit_breakers.default_config;
    println!(
        "   ✅ Default: open after {} failure(s), recover after {}ms, close after {} trial success(es)",
        defaults.failure_threshold, defaults.recovery_timeout_ms, defaults.half_open_success_threshold
    );
    let mut components: Vec<_> = config.circuit_breakers.component_configs.iter().collect();
    components.sort_by(|a, b| a.0.cmp(b.0));
    for (name, component) in components {
        println!(
            "   ✅ {name}: threshold {}, recovery {}ms",
            component.failure_threshold, component.recovery_timeout_ms
        );
    }
}

fn print_resource_pools(config: &TaskerFlowConfig) {
    println!("🧱 Resource Pools");
    println!(
        "   ✅ Default capacity {} with {}ms acquire timeout",
        config.resource_pools.default_capacity, config.resource_pools.acquire_timeout_ms
    );
    let mut pools: Vec<_> = config.resource_pools.pools.iter().collect();
    pools.sort();
    for (class, capacity) in pools {
        println!("   ✅ {class}: {capacity}");
    }
}

fn print_queues(config: &TaskerFlowConfig) {
    println!("📬 Queues");
    println!(
        "   ✅ Visibility timeout {}s, max size {}, max retries {}",
        config.queues.visibility_timeout_seconds, config.queues.max_size, config.queues.max_retries
    );
}

fn print_events(config: &TaskerFlowConfig) {
    println!("📡 Event Bus");
    println!(
        "   ✅ Handler timeout {}ms, observer buffer {}",
        config.events.handler_timeout_ms, config.events.observer_channel_capacity
    );
}

fn print_workflow(config: &TaskerFlowConfig) {
    println!("🎼 Workflow");
    println!(
        "   ✅ Error strategy {}, {} concurrent step(s), {}ms default step timeout",
        config.workflow.error_strategy,
        config.workflow.max_concurrent_steps,
        config.workflow.default_step_timeout_ms
    );
}

fn print_targets(config: &TaskerFlowConfig) {
    println!("🎯 Targets");
    if config.targets.is_empty() {
        println!("   ℹ️  No per-target overrides");
        return;
    }
    let mut targets: Vec<_> = config.targets.iter().collect();
    targets.sort_by(|a, b| a.0.cmp(b.0));
    for (id, target) in targets {
        println!(
            "   ✅ {id}: strategy {}, resource class {}",
            target
                .strategy
                .map(|s| s.to_string())
                .unwrap_or_else(|| "direct".to_string()),
            target.resource_class.as_deref().unwrap_or("-")
        );
    }
}
