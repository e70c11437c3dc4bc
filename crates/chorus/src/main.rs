//! Chorus: engagement pods for published posts
//!
//! Main binary with subcommands:
//! - `daemon`: fan-out and repost workers plus the reconciliation sweep
//! - `trigger` / `dispatch`: hand a published post to the pod
//! - `activities`, `dead-letters`, `sweep`: inspection and recovery
//! - `pod`: pod and member administration

use std::path::PathBuf;

use chorus_ledger::OnboardingStatus;
use chorus_pod::{AmplificationRequest, REPOST_QUEUE};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::{Result, miette};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{
    DEFAULT_NAV_TIMEOUT_SECS, DEFAULT_REPOST_CONCURRENCY, DEFAULT_STAGGER_JITTER_SECS,
    DEFAULT_STAGGER_SECS, DEFAULT_STALE_AFTER_SECS, DEFAULT_SWEEP_INTERVAL_SECS, DaemonConfig,
};

/// Parse boolean from environment variable, accepting common truthy values.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

mod admin;
mod config;
mod daemon;

#[derive(Parser)]
#[command(name = "chorus")]
#[command(about = "Coordinated reposts for engagement pods", long_about = None)]
struct Cli {
    /// Ledger database (pods, members, activities)
    #[arg(long, global = true, env = "CHORUS_DB_PATH", default_value = "chorus.db")]
    db_path: PathBuf,

    /// Queue database
    #[arg(
        long,
        global = true,
        env = "CHORUS_QUEUE_PATH",
        default_value = "chorus-queue.db"
    )]
    queue_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// A published post to amplify.
#[derive(Args)]
struct RequestArgs {
    /// Platform id of the post
    #[arg(long)]
    post_id: String,

    /// Public URL of the post
    #[arg(long)]
    post_url: String,

    /// Pod whose members amplify the post
    #[arg(long)]
    pod_id: String,

    /// Member who authored the post (never reposts it)
    #[arg(long)]
    author_member_id: String,

    /// Publish time (RFC 3339). Reusing it makes a repeated trigger a no-op.
    #[arg(long)]
    created_at: Option<DateTime<Utc>>,
}

impl RequestArgs {
    fn into_request(self) -> AmplificationRequest {
        AmplificationRequest {
            post_id: self.post_id,
            post_url: self.post_url,
            pod_id: self.pod_id,
            author_member_id: self.author_member_id,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Args)]
struct StaggerArgs {
    /// Seconds between consecutive repost jobs
    #[arg(long, env = "CHORUS_STAGGER_SECS", default_value_t = DEFAULT_STAGGER_SECS)]
    stagger_secs: u64,

    /// Random extra delay per job in seconds, below the stagger interval
    #[arg(long, env = "CHORUS_STAGGER_JITTER_SECS", default_value_t = DEFAULT_STAGGER_JITTER_SECS)]
    stagger_jitter_secs: u64,
}

impl StaggerArgs {
    fn policy(&self) -> Result<chorus_pod::StaggerPolicy> {
        DaemonConfig {
            stagger_secs: Some(self.stagger_secs),
            stagger_jitter_secs: Some(self.stagger_jitter_secs),
            ..Default::default()
        }
        .stagger()
        .map_err(|e| miette!("{}", e))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fan-out and repost workers
    Daemon {
        /// Session broker base URL
        #[arg(long, env = "CHORUS_BROKER_URL")]
        broker_url: String,

        /// Session broker API key
        #[arg(long, env = "CHORUS_BROKER_API_KEY", hide_env_values = true)]
        broker_api_key: String,

        #[command(flatten)]
        stagger: StaggerArgs,

        /// Concurrent repost jobs in this process
        #[arg(long, env = "CHORUS_REPOST_CONCURRENCY", default_value_t = DEFAULT_REPOST_CONCURRENCY)]
        repost_concurrency: usize,

        /// Page navigation timeout in seconds
        #[arg(long, env = "CHORUS_NAV_TIMEOUT_SECS", default_value_t = DEFAULT_NAV_TIMEOUT_SECS)]
        nav_timeout_secs: u64,

        /// Seconds between reconciliation sweeps; 0 disables them
        #[arg(long, env = "CHORUS_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
        sweep_interval_secs: u64,

        /// Age in seconds after which a queued activity is swept
        #[arg(long, env = "CHORUS_STALE_AFTER_SECS", default_value_t = DEFAULT_STALE_AFTER_SECS)]
        stale_after_secs: u64,

        /// Chromium executable (auto-detected when unset)
        #[arg(long, env = "CHORUS_CHROME_PATH")]
        chrome_path: Option<PathBuf>,

        /// Show the browser window
        #[arg(long, env = "CHORUS_HEADED", value_parser = parse_bool_env, default_value = "false")]
        headed: bool,
    },

    /// Enqueue a fan-out job for a running daemon
    Trigger {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Fan out a post directly, without a daemon
    Dispatch {
        #[command(flatten)]
        request: RequestArgs,

        #[command(flatten)]
        stagger: StaggerArgs,
    },

    /// Show the activity ledger for a post
    Activities {
        #[arg(long)]
        post_id: String,
    },

    /// Show queue counts and dead-lettered jobs
    DeadLetters {
        /// Queue name
        #[arg(long, default_value = REPOST_QUEUE)]
        queue: String,

        /// Maximum jobs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Run a single reconciliation sweep
    Sweep {
        #[command(flatten)]
        stagger: StaggerArgs,

        /// Age in seconds after which a queued activity is swept
        #[arg(long, env = "CHORUS_STALE_AFTER_SECS", default_value_t = DEFAULT_STALE_AFTER_SECS)]
        stale_after_secs: u64,
    },

    /// Manage pods and members
    Pod {
        #[command(subcommand)]
        command: PodCommands,
    },
}

#[derive(Subcommand)]
enum PodCommands {
    /// Create a pod
    Create {
        #[arg(long)]
        tenant_id: String,

        #[arg(long)]
        name: String,
    },

    /// Add a member account to a pod
    AddMember {
        #[arg(long)]
        pod_id: String,

        #[arg(long)]
        user_id: String,

        /// Broker reference for the member's platform account
        #[arg(long)]
        account_ref: String,

        #[arg(long, value_parser = parse_bool_env, default_value = "true")]
        active: bool,

        /// invited, pending or complete
        #[arg(long, value_parser = admin::parse_onboarding, default_value = "complete")]
        onboarding: OnboardingStatus,
    },

    /// Change a member's active flag or onboarding status
    SetMember {
        #[arg(long)]
        member_id: String,

        #[arg(long, value_parser = parse_bool_env)]
        active: Option<bool>,

        #[arg(long, value_parser = admin::parse_onboarding)]
        onboarding: Option<OnboardingStatus>,
    },

    /// List a pod's members
    Members {
        #[arg(long)]
        pod_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chorus=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db_path;
    let queue_path = cli.queue_path;

    match cli.command {
        Commands::Daemon {
            broker_url,
            broker_api_key,
            stagger,
            repost_concurrency,
            nav_timeout_secs,
            sweep_interval_secs,
            stale_after_secs,
            chrome_path,
            headed,
        } => {
            daemon::run(DaemonConfig {
                db_path,
                queue_path,
                broker_url,
                broker_api_key,
                stagger_secs: Some(stagger.stagger_secs),
                stagger_jitter_secs: Some(stagger.stagger_jitter_secs),
                repost_concurrency: Some(repost_concurrency),
                nav_timeout_secs: Some(nav_timeout_secs),
                sweep_interval_secs: Some(sweep_interval_secs),
                stale_after_secs: Some(stale_after_secs),
                chrome_path,
                headed,
            })
            .await
        }

        Commands::Trigger { request } => admin::trigger(&queue_path, request.into_request()).await,

        Commands::Dispatch { request, stagger } => {
            admin::dispatch(
                &db_path,
                &queue_path,
                request.into_request(),
                stagger.policy()?,
            )
            .await
        }

        Commands::Activities { post_id } => admin::activities(&db_path, &post_id).await,

        Commands::DeadLetters { queue, limit } => {
            admin::dead_letters(&queue_path, &queue, limit).await
        }

        Commands::Sweep {
            stagger,
            stale_after_secs,
        } => {
            admin::sweep(
                &db_path,
                &queue_path,
                stagger.policy()?,
                std::time::Duration::from_secs(stale_after_secs),
            )
            .await
        }

        Commands::Pod { command } => match command {
            PodCommands::Create { tenant_id, name } => {
                admin::create_pod(&db_path, &tenant_id, &name)
            }
            PodCommands::AddMember {
                pod_id,
                user_id,
                account_ref,
                active,
                onboarding,
            } => admin::add_member(&db_path, &pod_id, &user_id, &account_ref, active, onboarding),
            PodCommands::SetMember {
                member_id,
                active,
                onboarding,
            } => admin::set_member(&db_path, &member_id, active, onboarding),
            PodCommands::Members { pod_id } => admin::members(&db_path, &pod_id),
        },
    }
}
