use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod network;
pub mod outputs;
pub mod policy;
pub mod provider;
pub mod resources;
pub mod stack;
pub mod template;
pub mod writer;

use crate::config::{Config, Overrides};
use crate::context::DeploymentContext;
use crate::error::{Error, Result};
use crate::stack::StackOutputs;
use crate::template::{BootstrapTemplates, Strictness, TemplateRenderer};

/// Assemble the resource graphs of a self-hosted CI runner fleet on Fargate
#[derive(Parser, Debug)]
#[command(name = "runner-fleet-stacks", version, about, long_about = None)]
struct Cli {
    /// Configuration document
    #[arg(long, default_value = "./config/app.yml")]
    config: PathBuf,

    /// Override a configuration key, e.g. `-c Memory=1024` (repeatable)
    #[arg(short = 'c', long = "context", value_parser = config::parse_override)]
    overrides: Vec<(String, String)>,

    #[arg(long, env = "CDK_DEFAULT_ACCOUNT")]
    account: Option<String>,

    /// Falls back to the AWS default region provider chain
    #[arg(long, env = "CDK_DEFAULT_REGION")]
    region: Option<String>,

    /// Cached VPC lookups
    #[arg(long, default_value = "./config/network.yml")]
    network_context: PathBuf,

    /// Directory holding the bootstrap templates
    #[arg(long, default_value = "./templates")]
    templates: PathBuf,

    /// Output directory for graphs and stack outputs
    #[arg(long, default_value = "./stacks.out")]
    out: PathBuf,

    /// Leave unresolved placeholders in rendered templates instead of failing
    #[arg(long)]
    pass_through: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Assemble the runner stack and the task definition stack
    Synth,

    /// Assemble only the task definition stack
    ///
    /// Handles from the runner stack are needed when the task definition runs
    /// as a service. They are read from a previously written outputs file or
    /// from the deployed runner stack.
    SynthTaskDefinition {
        #[arg(long, conflicts_with = "prior_stack")]
        prior_outputs: Option<PathBuf>,

        /// Name of the deployed runner stack
        #[arg(long)]
        prior_stack: Option<String>,
    },

    /// Fetch the outputs of both deployed stacks
    FetchOutputs,

    /// Print the merged configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    return match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "assembly failed");
            ExitCode::FAILURE
        }
    };
}

async fn run(cli: Cli) -> Result<()> {
    let overrides: Overrides = cli.overrides.iter().cloned().collect();
    let config = config::load(Some(&cli.config), &overrides)?;

    return match &cli.command {
        Commands::ShowConfig => show_config(&config),
        Commands::Synth => {
            let ctx = deployment_context(&cli).await?;
            synth(&cli, &ctx, &config)
        }
        Commands::SynthTaskDefinition {
            prior_outputs,
            prior_stack,
        } => {
            let ctx = deployment_context(&cli).await?;
            let prior = match (prior_outputs, prior_stack) {
                (Some(path), _) => Some(writer::read_outputs(path)?),
                (None, Some(stack_name)) => Some(deployed_outputs(&cli, &config, stack_name).await?),
                (None, None) => None,
            };
            synth_task_definition(&cli, &ctx, &config, prior.as_ref())
        }
        Commands::FetchOutputs => fetch_outputs(&cli, &config).await,
    };
}

async fn deployment_context(cli: &Cli) -> Result<DeploymentContext> {
    let region = outputs::resolve_region(cli.region.clone()).await?;
    let account = cli.account.clone().unwrap_or_default();
    return Ok(DeploymentContext::new(account, region.as_ref())?);
}

fn renderer(cli: &Cli) -> TemplateRenderer {
    return match cli.pass_through {
        true => TemplateRenderer::new(Strictness::PassThrough),
        false => TemplateRenderer::new(Strictness::Strict),
    };
}

fn show_config(config: &Config) -> Result<()> {
    let contents = serde_yaml::to_string(config)
        .map_err(|error| config::Error::ParsingError(error.to_string()))?;
    println!("{}", contents);
    return Ok(());
}

fn synth(cli: &Cli, ctx: &DeploymentContext, config: &Config) -> Result<()> {
    let renderer = renderer(cli);
    let templates = BootstrapTemplates::load(&cli.templates)?;
    let catalog = context::load_catalog(&cli.network_context)?;

    let runner = stack::synth_runner(ctx, config, &renderer, &templates, catalog.clone())?;
    write_stack(&cli.out, &runner)?;

    let prior = runner.outputs.exported();
    let task_definition =
        stack::synth_task_definition(ctx, config, &renderer, catalog, Some(&prior))?;
    write_stack(&cli.out, &task_definition)?;
    return Ok(());
}

fn synth_task_definition(
    cli: &Cli,
    ctx: &DeploymentContext,
    config: &Config,
    prior: Option<&StackOutputs>,
) -> Result<()> {
    let catalog = context::load_catalog(&cli.network_context)?;
    let synthesized =
        stack::synth_task_definition(ctx, config, &renderer(cli), catalog, prior)?;
    return write_stack(&cli.out, &synthesized);
}

fn write_stack(out_dir: &Path, synthesized: &stack::Synthesized) -> Result<()> {
    writer::write_graph(out_dir, &synthesized.graph)?;
    writer::write_outputs(out_dir, &synthesized.outputs)?;
    tracing::info!(
        stack = %synthesized.graph.stack_name,
        resources = synthesized.graph.resources.len(),
        "synthesized stack"
    );
    return Ok(());
}

async fn deployed_outputs(cli: &Cli, config: &Config, stack_name: &str) -> Result<StackOutputs> {
    let region = outputs::resolve_region(cli.region.clone()).await?;
    let mut fetched = outputs::fetch_all(region, &[stack_name.to_string()]).await?;
    return match fetched.remove(stack_name) {
        Some(deployed) => Ok(StackOutputs::from_deployed(stack_name, config, &deployed)),
        None => Err(Error::ResourceNotFound(format!("stack {}", stack_name))),
    };
}

async fn fetch_outputs(cli: &Cli, config: &Config) -> Result<()> {
    let region = outputs::resolve_region(cli.region.clone()).await?;
    let stack_names = vec![
        config.bastion_stack_name(),
        config.task_definition_stack_name()?,
    ];
    let fetched = outputs::fetch_all(region, &stack_names).await?;
    for (stack_name, deployed) in &fetched {
        writer::write_deployed(&cli.out, stack_name, deployed)?;
    }
    return Ok(());
}
