use clap::{Parser, Subcommand};
use edge_router::admin::handlers::{BackendStatus, SystemStatus};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(name = "edge-cli")]
#[command(about = "Inspect a running edge router", long_about = None)]
struct Cli {
    /// Admin API base URL
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    /// Admin API bearer key
    #[arg(short, long, env = "EDGE_ADMIN_KEY", default_value = "change-me")]
    key: String,

    /// Client-facing base URL, used for metrics
    #[arg(long, default_value = "http://localhost:8080")]
    proxy_url: String,

    /// Print raw JSON instead of a summary
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Router status and pool summary
    Status,
    /// Backend health states
    Backends {
        /// Only backends of this group
        #[arg(long)]
        group: Option<String>,
    },
    /// Raw Prometheus metrics
    Metrics {
        /// Only lines whose metric name starts with this prefix
        #[arg(long)]
        filter: Option<String>,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let admin = AdminClient {
        client: &client,
        base: &cli.url,
        headers,
    };

    match cli.command {
        Commands::Status => {
            let status: SystemStatus = admin.get("/admin/status").await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("edge-router {} ({})", status.version, status.status);
                println!("  uptime:    {}s", status.uptime_secs);
                println!(
                    "  backends:  {} routable of {}",
                    status.routable_backends, status.backends
                );
                println!("  in flight: {}", status.in_flight);
                println!("  snapshot:  v{}", status.snapshot_version);
            }
        }
        Commands::Backends { group } => {
            let mut backends: Vec<BackendStatus> = admin.get("/admin/backends").await?;
            if let Some(group) = group {
                backends.retain(|b| b.group == group);
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&backends)?);
            } else {
                print_backends(&backends);
            }
        }
        Commands::Metrics { filter } => {
            let res = client.get(format!("{}/metrics", cli.proxy_url)).send().await?;
            let status = res.status();
            let text = res.text().await?;
            if !status.is_success() {
                return Err(format!("metrics endpoint returned {status}: {text}").into());
            }
            let prefix = filter.unwrap_or_default();
            text.lines()
                .filter(|line| line.starts_with(prefix.as_str()))
                .for_each(|line| println!("{line}"));
        }
    }

    Ok(())
}

struct AdminClient<'a> {
    client: &'a reqwest::Client,
    base: &'a str,
    headers: HeaderMap,
}

impl AdminClient<'_> {
    async fn get<T: DeserializeOwned>(&self, path: &str) -> CliResult<T> {
        let res = self
            .client
            .get(format!("{}{}", self.base, path))
            .headers(self.headers.clone())
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(format!("admin API returned {status}: {text}").into());
        }
        Ok(res.json().await?)
    }
}

fn print_backends(backends: &[BackendStatus]) {
    println!(
        "{:<24} {:<10} {:<22} {:<11} {:>5} {:>5} {:>10}",
        "ID", "GROUP", "ADDRESS", "STATUS", "FAIL", "OK", "PROBED"
    );
    for b in backends {
        let probed = b
            .last_probe_secs_ago
            .map(|s| format!("{s}s ago"))
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<24} {:<10} {:<22} {:<11} {:>5} {:>5} {:>10}",
            b.id,
            b.group,
            b.address,
            b.status.as_str(),
            b.consecutive_failures,
            b.consecutive_successes,
            probed
        );
    }
}
