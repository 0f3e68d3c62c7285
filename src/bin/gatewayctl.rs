use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gatewayctl")]
#[command(about = "Management CLI for stream-gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GATEWAY_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version and live session counts
    Status,
    /// List backends with health and load
    Backends,
    /// Register a backend
    Add {
        name: String,
        /// Pool the backend joins
        #[arg(short, long)]
        group: String,
        /// tcp://host:port, http://host:port or host:port
        address: String,
        #[arg(short, long, default_value_t = 1)]
        weight: u32,
    },
    /// Deregister (drain) a backend
    Remove { name: String },
    /// Re-read the gateway's configuration file
    Reload,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let base = cli.url.trim_end_matches('/');

    let res = match cli.command {
        Commands::Status => client.get(format!("{base}/admin/status")).send().await?,
        Commands::Backends => client.get(format!("{base}/admin/backends")).send().await?,
        Commands::Add {
            name,
            group,
            address,
            weight,
        } => {
            client
                .post(format!("{base}/admin/backends"))
                .json(&json!({ "name": name, "group": group, "address": address, "weight": weight }))
                .send()
                .await?
        }
        Commands::Remove { name } => client.delete(format!("{base}/admin/backends/{name}")).send().await?,
        Commands::Reload => client.post(format!("{base}/admin/reload")).send().await?,
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: admin API returned status {status}");
        if !text.is_empty() {
            eprintln!("Response: {text}");
        }
        std::process::exit(1);
    }

    if text.is_empty() {
        println!("ok ({status})");
        return Ok(());
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{text}"),
    }
    Ok(())
}
