use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use onboarding_orchestrator::{
    init_telemetry, open_store, remove_item, seed_organization, InstanceMetadata,
    OnboardingPayload, OrchestratorConfig, ShutdownCoordinator, WorkflowHost, WorkflowItem,
};

const DEFAULT_DATA_DIR: &str = ".onboarding";

#[derive(Parser)]
#[command(name = "onboarding")]
#[command(about = "Durable organization onboarding workflow")]
#[command(long_about = "Runs the onboarding workflow: verifies an organization record, gates \
                       large requests on a manager approval event, provisions users and \
                       updates the record. Instance history is persisted so interrupted \
                       instances can be resumed.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed an organization record and run one onboarding instance to completion
    Run {
        /// Organization to onboard
        #[arg(long, default_value = "TestOrg01")]
        organization: String,
        /// Number of users requested
        #[arg(long, default_value = "3")]
        users: u32,
        /// User count written to the organization record before scheduling (defaults to --users)
        #[arg(long)]
        seed_users: Option<i64>,
        /// Seconds to wait before raising the approval event for large requests
        #[arg(long, default_value = "10")]
        auto_approve_after: u64,
    },
    /// Write an organization record to the state store
    Seed {
        #[arg(long)]
        organization: String,
        #[arg(long)]
        users: i64,
    },
    /// Remove an organization record from the state store
    Reset {
        #[arg(long)]
        organization: String,
    },
    /// Show the persisted status of an instance
    Status {
        #[arg(long)]
        instance: String,
    },
    /// Raise the approval event for a suspended instance
    Approve {
        #[arg(long)]
        instance: String,
    },
    /// Resume every persisted instance that has not finished
    Resume,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config()?;
    init_telemetry(&config.observability)?;

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Run {
            organization,
            users,
            seed_users,
            auto_approve_after,
        } => runtime.block_on(run_command(
            config,
            organization,
            users,
            seed_users,
            auto_approve_after,
        )),
        Commands::Seed {
            organization,
            users,
        } => runtime.block_on(seed_command(config, organization, users)),
        Commands::Reset { organization } => {
            runtime.block_on(reset_command(config, organization))
        }
        Commands::Status { instance } => runtime.block_on(status_command(config, instance)),
        Commands::Approve { instance } => runtime.block_on(approve_command(config, instance)),
        Commands::Resume => runtime.block_on(resume_command(config)),
    }
}

/// Configuration with on-disk stores, so separate invocations share state
fn load_config() -> Result<OrchestratorConfig> {
    OrchestratorConfig::load_env_file()?;
    let mut config = OrchestratorConfig::load().context("failed to load configuration")?;

    let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    if config.state_store.file_path.is_none() {
        config.state_store.file_path = Some(data_dir.join("statestore.json"));
    }
    if config.persistence.directory.is_none() {
        config.persistence.directory = Some(data_dir.join("instances"));
    }
    Ok(config)
}

fn build_host(config: &OrchestratorConfig) -> Arc<WorkflowHost> {
    let store = open_store(&config.state_store);
    Arc::new(WorkflowHost::from_config(config, store))
}

async fn run_command(
    config: OrchestratorConfig,
    organization: String,
    users: u32,
    seed_users: Option<i64>,
    auto_approve_after: u64,
) -> Result<()> {
    println!("*** Onboarding console ({})", config.workflow.workflow_name);

    let store = open_store(&config.state_store);
    let item = WorkflowItem::new(&organization, seed_users.unwrap_or(i64::from(users)));
    println!("creating request for new organization entity: {}", item.organization);
    seed_organization(store.as_ref(), &item).await?;

    let host = Arc::new(WorkflowHost::from_config(&config, store));
    let coordinator = ShutdownCoordinator::new(host.clone());

    let instance_id = host
        .schedule_new_workflow(OnboardingPayload::new(&organization, users))
        .await?;
    println!("Scheduled onboarding instance {instance_id}");

    let approval_required = config.workflow.requires_approval(users);
    let event_name = config.workflow.approval_event_name.as_str();
    let poll_interval = config.host.status_poll_interval();

    let outcome = coordinator
        .run_until_signal(poll_until_finished(
            &host,
            &instance_id,
            approval_required.then(|| (event_name, Duration::from_secs(auto_approve_after))),
            poll_interval,
        ))
        .await?;

    match outcome {
        Some(metadata) => {
            let metadata = metadata?;
            println!("Workflow completed - result: {}", metadata.runtime_status);
            if let Some(error) = &metadata.error {
                println!("Error: {error}");
            }
            println!("Onboarding of organization is complete");
            host.metrics().log_stats();
        }
        None => println!("Interrupted; resume instance {instance_id} with `onboarding resume`"),
    }
    Ok(())
}

/// Poll until the instance finishes, raising the approval event once its delay has passed
async fn poll_until_finished(
    host: &WorkflowHost,
    instance_id: &str,
    approve: Option<(&str, Duration)>,
    poll_interval: Duration,
) -> Result<InstanceMetadata> {
    let started = Instant::now();
    let mut approval_sought = false;
    loop {
        let metadata = host.fetch_workflow_metadata(instance_id).await?;
        if metadata.runtime_status.is_terminal() {
            return Ok(metadata);
        }

        if let Some((event_name, delay)) = approve {
            if !approval_sought && started.elapsed() >= delay {
                approval_sought = true;
                println!("Raising {event_name} for {instance_id}");
                host.raise_event(instance_id, event_name, None).await?;
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}

async fn seed_command(config: OrchestratorConfig, organization: String, users: i64) -> Result<()> {
    let store = open_store(&config.state_store);
    seed_organization(store.as_ref(), &WorkflowItem::new(&organization, users)).await?;
    println!("Seeded {organization} with {users} users");
    Ok(())
}

async fn reset_command(config: OrchestratorConfig, organization: String) -> Result<()> {
    let store = open_store(&config.state_store);
    remove_item(store.as_ref(), &organization).await?;
    println!("Removed record for {organization}");
    Ok(())
}

async fn status_command(config: OrchestratorConfig, instance: String) -> Result<()> {
    let host = build_host(&config);
    let metadata = host.fetch_workflow_metadata(&instance).await?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

async fn approve_command(config: OrchestratorConfig, instance: String) -> Result<()> {
    let host = build_host(&config);
    host.raise_event(&instance, &config.workflow.approval_event_name, None)
        .await?;
    println!(
        "Raised {} for {instance}",
        config.workflow.approval_event_name
    );
    Ok(())
}

async fn resume_command(config: OrchestratorConfig) -> Result<()> {
    let host = build_host(&config);
    let coordinator = ShutdownCoordinator::new(host.clone());

    let report = host.resume_incomplete().await?;
    for instance_id in &report.terminated {
        println!("Terminated {instance_id}: history failed its integrity check");
    }
    for (instance_id, reason) in &report.skipped {
        println!("Skipped {instance_id}: {reason}");
    }
    if report.resumed.is_empty() {
        println!("No incomplete instances to resume");
        return Ok(());
    }

    let wait_limit = config.workflow.approval_timeout() + Duration::from_secs(60);
    let outcome = coordinator
        .run_until_signal(async {
            let mut results = Vec::new();
            for instance_id in &report.resumed {
                results.push(host.wait_for_completion(instance_id, wait_limit).await);
            }
            results
        })
        .await?;

    let Some(results) = outcome else {
        println!("Interrupted; resumed instances remain pending");
        return Ok(());
    };
    for result in results {
        match result {
            Ok(metadata) => println!(
                "{} - result: {}",
                metadata.instance_id, metadata.runtime_status
            ),
            Err(e) => println!("{e}"),
        }
    }
    host.metrics().log_stats();
    Ok(())
}
