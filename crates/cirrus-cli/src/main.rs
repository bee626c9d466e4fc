//! Operator CLI for the Cirrus control plane.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cirrus", version, about = "Cirrus - serverless function management")]
struct Cli {
    /// Control-plane base URL.
    #[arg(long, global = true, default_value = "http://localhost:8080", env = "CIRRUS_API_URL")]
    api_url: String,

    /// API key for authenticated endpoints.
    #[arg(long, global = true, env = "CIRRUS_API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a function from a source directory, or update it if the
    /// name is already taken.
    Deploy {
        name: String,
        /// Directory holding handler.py (plus optional requirements.txt and
        /// function.yaml).
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long, default_value = "python3.9")]
        runtime: String,
        /// Memory ceiling in MiB.
        #[arg(long, default_value_t = 128)]
        memory: u32,
        /// Timeout ceiling in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// List registered functions.
    List,
    /// Invoke a function by name.
    Invoke {
        name: String,
        /// Inline JSON input.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Path to a JSON file with the input.
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Fire-and-forget; poll with `cirrus logs <execution-id>`.
        #[arg(long = "async")]
        fire_and_forget: bool,
    },
    /// Show the record of one execution.
    Logs { execution_id: String },
    /// Mint an API key.
    ApiKey {
        #[arg(long, default_value = "cli-user")]
        user_id: String,
        #[arg(long, value_delimiter = ',', default_value = "user")]
        roles: Vec<String>,
        /// Expiration in seconds.
        #[arg(long, default_value_t = 86400)]
        expires_in: u64,
    },
}

struct Client {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Client {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
        let response = builder.send().await.context("request failed")?;
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));
        if !status.is_success() && status != reqwest::StatusCode::ACCEPTED {
            bail!(
                "{}: {}",
                status,
                body.get("error").and_then(|e| e.as_str()).unwrap_or("request failed")
            );
        }
        Ok(body)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client {
        http: reqwest::Client::new(),
        base_url: cli.api_url.clone(),
        api_key: cli.api_key.clone(),
    };

    match cli.command {
        Commands::Deploy {
            name,
            dir,
            runtime,
            memory,
            timeout,
        } => deploy(&client, &name, &dir, &runtime, memory, timeout).await?,
        Commands::List => {
            let functions = client
                .send(client.request(reqwest::Method::GET, "/api/functions"))
                .await?;
            println!("{}", serde_json::to_string_pretty(&functions)?);
        }
        Commands::Invoke {
            name,
            input,
            input_file,
            fire_and_forget,
        } => {
            let input = read_input(input, input_file)?;
            let body = serde_json::json!({ "input": input, "sync": !fire_and_forget });
            let outcome = client
                .send(
                    client
                        .request(
                            reqwest::Method::POST,
                            &format!("/api/functions/name/{name}/invoke"),
                        )
                        .json(&body),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Logs { execution_id } => {
            let execution = client
                .send(client.request(
                    reqwest::Method::GET,
                    &format!("/api/executions/{execution_id}"),
                ))
                .await?;
            println!("{}", serde_json::to_string_pretty(&execution)?);
        }
        Commands::ApiKey {
            user_id,
            roles,
            expires_in,
        } => {
            let body = serde_json::json!({
                "user_id": user_id,
                "roles": roles,
                "expires_in": expires_in,
            });
            let response = client
                .send(
                    client
                        .request(reqwest::Method::POST, "/api/auth/api-key")
                        .json(&body),
                )
                .await?;
            println!(
                "{}",
                response
                    .get("api_key")
                    .and_then(|k| k.as_str())
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn deploy(
    client: &Client,
    name: &str,
    dir: &Path,
    runtime: &str,
    memory: u32,
    timeout: u64,
) -> anyhow::Result<()> {
    let code = std::fs::read_to_string(dir.join("handler.py"))
        .with_context(|| format!("no handler.py in {}", dir.display()))?;
    let requirements = std::fs::read_to_string(dir.join("requirements.txt")).unwrap_or_default();
    let config = std::fs::read_to_string(dir.join("function.yaml")).unwrap_or_default();

    // Update in place when the name is already registered.
    let existing = client
        .send(client.request(reqwest::Method::GET, &format!("/api/functions/name/{name}")))
        .await
        .ok();

    let result = match existing.as_ref().and_then(|f| f.get("id")).and_then(|id| id.as_str()) {
        Some(id) => {
            let body = serde_json::json!({
                "code": code,
                "requirements": requirements,
                "config": config,
            });
            client
                .send(
                    client
                        .request(reqwest::Method::PUT, &format!("/api/functions/{id}"))
                        .json(&body),
                )
                .await?
        }
        None => {
            let body = serde_json::json!({
                "name": name,
                "runtime": runtime,
                "memory": memory,
                "timeout": timeout,
                "code": code,
                "requirements": requirements,
                "config": config,
            });
            client
                .send(
                    client
                        .request(reqwest::Method::POST, "/api/functions")
                        .json(&body),
                )
                .await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn read_input(
    inline: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<serde_json::Value> {
    let raw = match (inline, file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => "{}".to_string(),
    };
    serde_json::from_str(&raw).context("input is not valid JSON")
}
