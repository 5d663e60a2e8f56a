use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::*;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use orderfeed::error::BackoffPolicy;
use orderfeed::model::{Order, OrderStatus};
use orderfeed::session::ServerMessage;
use orderfeed::storage::OrderStats;
use orderfeed::sync::{self, LocalView, MonitorEvent, ViewChange};

#[derive(Parser)]
#[command(name = "orderfeed-cli")]
#[command(about = "Manage orders and follow live updates from an orderfeed relay", version)]
struct Cli {
    /// Relay base URL
    #[arg(long, global = true, env = "ORDERFEED_URL", default_value = "http://localhost:3000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List orders
    List {
        #[arg(short, long)]
        status: Option<OrderStatus>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Create an order
    Create {
        #[arg(short, long)]
        customer: String,

        #[arg(short, long)]
        product: String,

        #[arg(short, long, default_value = "pending")]
        status: OrderStatus,
    },

    /// Change an order's status
    Status { id: String, status: OrderStatus },

    /// Delete an order
    Delete { id: String },

    /// Show order counts
    Stats,

    /// Follow live updates
    Monitor,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

struct Api {
    client: Client,
    base: String,
}

impl Api {
    fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<(Option<String>, T)> {
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("request failed");
            return Err(anyhow!("{message} ({status})"));
        }
        let envelope: Envelope<T> = serde_json::from_value(body)?;
        let data = envelope
            .data
            .ok_or_else(|| anyhow!("response carried no data"))?;
        Ok((envelope.message, data))
    }
}

fn status_color(status: OrderStatus) -> ColoredString {
    let label = status.as_str().to_uppercase();
    match status {
        OrderStatus::Pending => label.cyan(),
        OrderStatus::Shipped => label.yellow(),
        OrderStatus::Delivered => label.green(),
    }
}

fn print_order(index: usize, order: &Order) {
    println!("{}. ID: {}", index + 1, order.id.bright_white());
    println!("   Customer: {}", order.customer_name);
    println!("   Product: {}", order.product_name);
    println!("   Status: {}", status_color(order.status));
    println!("   Created: {}", order.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("   Updated: {}", order.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("{}", "─".repeat(80).bright_black());
}

fn describe(record: &Value) -> String {
    let field = |name: &str| record[name].as_str().unwrap_or("?").to_string();
    format!(
        "{} - {} ({})",
        field("customer_name"),
        field("product_name"),
        field("status")
    )
}

fn print_event(event: MonitorEvent<'_>, view: &LocalView) {
    match event {
        MonitorEvent::Connected { url } => {
            println!("{} Connected to {}", "✓".green(), url.as_str().bright_blue());
        }
        MonitorEvent::Disconnected { reason } => {
            println!("{} Disconnected: {}", "✗".red(), reason);
        }
        MonitorEvent::Retrying { attempt, delay } => {
            println!(
                "{} Reconnecting in {}ms (attempt {})",
                "↻".yellow(),
                delay.as_millis(),
                attempt
            );
        }
        MonitorEvent::Message { message, change } => match (message, change) {
            (ServerMessage::InitialOrders(_), ViewChange::Reset { len }) => {
                println!("{} {} recent orders", "Snapshot:".cyan().bold(), len);
                for record in view.records() {
                    println!("   {}", describe(record));
                }
            }
            (ServerMessage::SnapshotError { message }, _) => {
                println!("{} {}", "Snapshot unavailable:".red(), message);
            }
            (ServerMessage::OrderUpdate(envelope), ViewChange::Upserted { id, operation }) => {
                println!(
                    "{} {} {}",
                    format!("[{}]", envelope.timestamp().format("%H:%M:%S")).bright_black(),
                    operation.as_str().to_uppercase().cyan().bold(),
                    id.bright_white()
                );
                println!("   Order: {}", describe(envelope.data()));
            }
            (ServerMessage::OrderUpdate(envelope), ViewChange::Removed { id, .. }) => {
                println!(
                    "{} {} {}",
                    format!("[{}]", envelope.timestamp().format("%H:%M:%S")).bright_black(),
                    "DELETE".red().bold(),
                    id.bright_white()
                );
            }
            (ServerMessage::Gap { dropped }, _) => {
                println!(
                    "{} {} updates were dropped; view may be stale",
                    "⚠".yellow(),
                    dropped
                );
            }
            _ => {}
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let api = Api::new(&cli.server)?;

    match cli.command {
        Commands::List { status, limit } => {
            let mut request = api
                .client
                .get(api.url("/api/orders"))
                .query(&[("limit", limit.to_string())]);
            if let Some(status) = status {
                request = request.query(&[("status", status.as_str())]);
            }
            let (_, orders): (_, Vec<Order>) = Api::decode(request.send().await?).await?;

            if orders.is_empty() {
                println!("{}", "No orders found".yellow());
                return Ok(());
            }
            println!("{}", "All Orders:".bold());
            println!("{}", "═".repeat(80).bright_black());
            for (index, order) in orders.iter().enumerate() {
                print_order(index, order);
            }
        }

        Commands::Create {
            customer,
            product,
            status,
        } => {
            let body = json!({
                "customer_name": customer,
                "product_name": product,
                "status": status,
            });
            let response = api
                .client
                .post(api.url("/api/orders"))
                .json(&body)
                .send()
                .await?;
            let (_, order): (_, Order) = Api::decode(response).await?;
            println!("{} Order created", "✓".green());
            println!("Order ID: {}", order.id.bright_white());
        }

        Commands::Status { id, status } => {
            let response = api
                .client
                .patch(api.url(&format!("/api/orders/{id}/status")))
                .json(&json!({ "status": status }))
                .send()
                .await?;
            let (message, order): (_, Order) = Api::decode(response).await?;
            println!(
                "{} {}",
                "✓".green(),
                message.unwrap_or_else(|| "Order updated".to_string())
            );
            println!("   {} -> {}", order.id, status_color(order.status));
        }

        Commands::Delete { id } => {
            let response = api
                .client
                .delete(api.url(&format!("/api/orders/{id}")))
                .send()
                .await?;
            let (_, order): (_, Order) = Api::decode(response).await?;
            println!("{} Deleted order {}", "✓".green(), order.id);
        }

        Commands::Stats => {
            let response = api.client.get(api.url("/api/orders/stats/summary")).send().await?;
            let (_, stats): (_, OrderStats) = Api::decode(response).await?;
            let count = |status: OrderStatus| stats.by_status.get(status.as_str()).copied().unwrap_or(0);

            println!("{}", "Order Statistics:".bold());
            println!("{}", "═".repeat(40).bright_black());
            println!("Total Orders: {}", stats.total);
            println!("Pending: {}", count(OrderStatus::Pending).to_string().cyan());
            println!("Shipped: {}", count(OrderStatus::Shipped).to_string().yellow());
            println!("Delivered: {}", count(OrderStatus::Delivered).to_string().green());
        }

        Commands::Monitor => {
            let url = sync::ws_url(&cli.server)?;
            let mut view = LocalView::new();
            let policy = BackoffPolicy::reconnect();
            println!("{}", "Following live order updates (Ctrl-C to stop)".bold());

            tokio::select! {
                result = sync::monitor(&url, &policy, &mut view, print_event) => {
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }

    Ok(())
}
