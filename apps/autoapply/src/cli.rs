use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::api_client::endpoints::JobsApi;
use crate::api_client::{ReqwestTransport, RequestOrchestrator};
use crate::cache::{self, CacheRegistry, HttpUpstream, RoutingConfig, Upstream};
use crate::config::{normalize_base_url, Config};
use crate::errors::ApiError;
use crate::models::job::{ApplicationStatus, JobPosting};
use crate::queue::ApplyQueue;
use crate::routes::build_router;
use crate::session::SessionStore;
use crate::state::ProxyState;
use crate::store::{self, FileStore, LocalStore, API_BASE_KEY};

#[derive(Parser)]
#[command(name = "autoapply")]
#[command(about = "Job search and auto-apply client", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in and store the session
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Forget the stored session
    Logout,
    /// Fetch the profile of the logged-in user
    Me,
    /// Create an account
    Signup {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Search job postings
    Search {
        query: String,
        #[arg(long)]
        country: Option<String>,
    },
    /// List submitted applications
    Applications,
    /// Update the status of an application
    Status {
        application_id: String,
        /// Draft, Applied, Interview, Offer or Rejected
        status: ApplicationStatus,
    },
    /// List billing plans
    Plans,
    /// Check the API is reachable
    Health,
    /// Manage the local apply queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Run the offline cache proxy
    Proxy,
    /// Client settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum QueueAction {
    /// Queue a posting for the next batch
    Add {
        /// Raw posting JSON, as returned by search
        #[arg(long, conflicts_with_all = ["id", "url"])]
        json: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show queued postings, newest first
    List,
    /// Remove the entry at a position shown by `list`
    Remove { index: usize },
    /// Empty the queue
    Clear,
    /// Apply to every queued posting
    Run,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Persist an API base URL override
    SetApiBase { url: String },
    /// Print the effective configuration
    Show,
}

/// Wiring shared by every API command.
struct Client {
    local: Arc<dyn LocalStore>,
    api: JobsApi,
}

impl Client {
    fn open(config: &Config) -> Result<Self> {
        let local: Arc<dyn LocalStore> = Arc::new(
            FileStore::open(&config.data_dir)
                .with_context(|| format!("Failed to open data directory {}", config.data_dir.display()))?,
        );
        let base_url = config.resolve_api_base(local.as_ref())?;
        let session = Arc::new(SessionStore::load(local.clone()).context("Failed to load session")?);
        let transport = Arc::new(ReqwestTransport::new().context("Failed to build HTTP client")?);
        let orchestrator = RequestOrchestrator::new(&base_url, session, transport);
        let api = JobsApi::new(orchestrator).with_limits(config.timeout, config.max_retries);
        Ok(Self { local, api })
    }

    fn queue(&self) -> ApplyQueue {
        ApplyQueue::new(self.local.clone(), self.api.clone())
    }
}

pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let client = Client::open(&config)?;
    let api = &client.api;

    match cli.command {
        Commands::Login { username, password } => print_json(&checked(api.login(&username, &password).await)?),
        Commands::Logout => {
            api.logout();
            print_json(&json!({ "logged_out": true }))
        }
        Commands::Me => print_json(&checked(api.me().await)?),
        Commands::Signup {
            full_name,
            email,
            password,
        } => print_json(&checked(api.signup(&full_name, &email, &password).await)?),
        Commands::Search { query, country } => {
            print_json(&checked(api.search_jobs(&query, country.as_deref()).await)?)
        }
        Commands::Applications => print_json(&checked(api.list_applications().await)?),
        Commands::Status {
            application_id,
            status,
        } => print_json(&checked(api.update_application_status(&application_id, status).await)?),
        Commands::Plans => print_json(&checked(api.plans().await)?),
        Commands::Health => print_json(&checked(api.health().await)?),
        Commands::Queue { action } => run_queue(&client, action).await,
        Commands::Proxy => serve_proxy(&config, api.orchestrator().base_url()).await,
        Commands::Config { action } => match action {
            ConfigAction::SetApiBase { url } => {
                let url = normalize_base_url(&url)?;
                store::save(client.local.as_ref(), API_BASE_KEY, &url)
                    .context("Failed to store API base URL")?;
                info!("API base URL set to {url}");
                print_json(&json!({ "api_base_url": url }))
            }
            ConfigAction::Show => print_json(&json!({
                "api_base_url": api.orchestrator().base_url(),
                "data_dir": config.data_dir,
                "timeout_ms": config.timeout.as_millis() as u64,
                "max_retries": config.max_retries,
                "logged_in": api.orchestrator().session().is_authenticated(),
                "proxy": {
                    "listen": config.proxy.listen_addr().to_string(),
                    "upstream": config.proxy.upstream,
                    "public_origin": config.proxy.public_origin,
                    "cache_version": config.proxy.cache_version,
                    "store_policy": config.proxy.store_policy.to_string(),
                }
            })),
        },
    }
}

async fn run_queue(client: &Client, action: QueueAction) -> Result<()> {
    let queue = client.queue();
    match action {
        QueueAction::Add {
            json,
            id,
            title,
            company,
            location,
            url,
            notes,
        } => {
            let job = match json {
                Some(raw) => serde_json::from_str::<JobPosting>(&raw).context("--json is not a job posting")?,
                None => JobPosting {
                    id,
                    title,
                    company,
                    location,
                    url,
                    notes,
                },
            };
            print_json(&queue.enqueue(&job)?)
        }
        QueueAction::List => print_json(&queue.list()?),
        QueueAction::Remove { index } => print_json(&queue.dequeue(index)?),
        QueueAction::Clear => {
            queue.clear()?;
            print_json(&json!({ "cleared": true }))
        }
        QueueAction::Run => {
            let report = queue.run_batch().await?;
            print_json(&report)
        }
    }
}

/// Builds the proxy, activates the cache, then binds. No request is served
/// before the first generation is in place.
async fn serve_proxy(config: &Config, api_base: &str) -> Result<()> {
    let upstream_base = config.proxy.upstream.clone().unwrap_or_else(|| api_base.to_string());
    let upstream: Arc<dyn Upstream> =
        Arc::new(HttpUpstream::new(&upstream_base, config.timeout).context("Failed to build upstream client")?);

    let registry = Arc::new(CacheRegistry::new());
    let manifest = cache::default_manifest();
    registry
        .activate(&config.proxy.cache_version, &manifest, upstream.as_ref())
        .await
        .context("Initial cache activation failed")?;

    let routing = RoutingConfig::new(&config.proxy.public_origin, config.proxy.store_policy);
    let app = build_router(ProxyState::new(registry, upstream, routing, manifest));

    let addr = config.proxy.listen_addr();
    info!(
        "Proxy listening on {addr} (upstream {upstream_base}, {} policy)",
        config.proxy.store_policy
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Adds a login hint to errors that need one.
fn checked<T>(result: Result<T, ApiError>) -> Result<T> {
    result.map_err(|e| {
        if e.requires_login() {
            anyhow::Error::new(e).context("Not logged in: run `autoapply login <username> --password ...`")
        } else {
            anyhow::Error::new(e)
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
