use clap::{Parser, Subcommand};
use preview_common::{ErrorResponse, GeneratePreviewRequest, GeneratePreviewResponse, InstanceInfo, LeaseInfo, StopRequest};
use reqwest::{Client, Response};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the preview daemon
    #[arg(long, env = "PREVIEW_DAEMON_URL", default_value = "http://localhost:3407")]
    daemon: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or reuse) a preview for a deck and print its URL
    Open {
        deck: String,
    },
    /// Stop the preview for a deck
    Stop {
        deck: String,
    },
    /// List running previews
    List,
    /// List leased ports
    Leases,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.daemon.trim_end_matches('/');

    match cli.command {
        Commands::Open { deck } => {
            let req = GeneratePreviewRequest { filename: deck };
            let resp = client.post(format!("{}/generate-preview", base_url))
                .json(&req)
                .send()
                .await?;

            if resp.status().is_success() {
                let preview: GeneratePreviewResponse = resp.json().await?;
                println!("{}", preview.preview_url);
            } else {
                report_failure("Failed to open preview", resp).await;
            }
        }
        Commands::Stop { deck } => {
            let req = StopRequest { filename: deck.clone() };
            let resp = client.post(format!("{}/stop", base_url))
                .json(&req)
                .send()
                .await?;

            if resp.status().is_success() {
                println!("Stopped preview for {}", deck);
            } else {
                report_failure("Failed to stop preview", resp).await;
            }
        }
        Commands::List => {
            let resp = client.get(format!("{}/instances", base_url))
                .send()
                .await?;

            if resp.status().is_success() {
                let instances: Vec<InstanceInfo> = resp.json().await?;
                println!("Running previews:");
                for instance in instances {
                    let pid = instance.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                    println!(
                        "Deck: {}, Port: {}, PID: {}, Last used: {}",
                        instance.deck,
                        instance.port,
                        pid,
                        instance.last_interaction.to_rfc3339()
                    );
                }
            } else {
                report_failure("Failed to list previews", resp).await;
            }
        }
        Commands::Leases => {
            let resp = client.get(format!("{}/leases", base_url))
                .send()
                .await?;

            if resp.status().is_success() {
                let leases: Vec<LeaseInfo> = resp.json().await?;
                println!("Leased ports:");
                for lease in leases {
                    println!("Port: {}, Deck: {}, Since: {}", lease.port, lease.deck, lease.allocated_at.to_rfc3339());
                }
            } else {
                report_failure("Failed to list leases", resp).await;
            }
        }
    }

    Ok(())
}

async fn report_failure(what: &str, resp: Response) -> ! {
    let status = resp.status();
    match resp.json::<ErrorResponse>().await {
        Ok(err) => {
            eprintln!("{}: {} ({})", what, err.message, status);
            if let Some(details) = err.details {
                eprintln!("{}", details);
            }
        }
        Err(_) => eprintln!("{}: {}", what, status),
    }
    std::process::exit(1);
}
