use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use crate::api::API_KEY_HEADER;

#[derive(Parser)]
#[command(name = "cephx-api")]
#[command(about = "REST API for CephFS and CephX administration", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    pub server: String,

    #[arg(short = 'k', long, env = "CEPHX_API_KEY")]
    pub api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP API.
    Serve {
        #[arg(short, long, env = "CEPHX_API_CONFIG")]
        config: Option<PathBuf>,
    },
    Status,
    Fs {
        #[command(subcommand)]
        cmd: FsCmd,
    },
    Auth {
        #[command(subcommand)]
        cmd: AuthCmd,
    },
}

#[derive(Subcommand, Clone)]
pub enum FsCmd {
    List {
        #[arg(long)]
        usage: bool,
    },
    Show {
        name: String,
    },
    Create {
        name: String,
        #[arg(long)]
        crush_rule: Option<String>,
        #[arg(long)]
        pg: Option<u32>,
        #[arg(long)]
        no_snapshots: bool,
        #[arg(long)]
        no_auth: bool,
        #[arg(long)]
        auth_client: Option<String>,
    },
    /// Delete a filesystem. Its pools are left in place.
    Delete {
        name: String,
        #[arg(long)]
        keep_auth: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum AuthCmd {
    List {
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { ref config } => crate::api::serve_from_config(config.as_deref()).await,
            Command::Status => self.status().await,
            Command::Fs { ref cmd } => self.fs(cmd).await,
            Command::Auth { ref cmd } => self.auth(cmd).await,
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    /// Sends the request and unwraps the success envelope.
    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = self.request(builder).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let body: Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!(
                "Request failed: {} {}: {}",
                status,
                body["code"].as_str().unwrap_or("UNKNOWN"),
                body["message"].as_str().unwrap_or_default()
            );
        }
        Ok(body["data"].clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.trim_end_matches('/'), path)
    }

    async fn status(&self) -> Result<()> {
        let client = Client::new();
        let status = self
            .send(client.get(self.url("/api/v1/cluster/status")))
            .await?;

        println!("Health: {}", status["health"].as_str().unwrap_or("UNKNOWN"));
        println!(
            "Monitors: {} ({} in quorum)",
            status["mon_status"]["num_mons"],
            status["mon_status"]["quorum"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0)
        );
        println!(
            "OSDs: {} total, {} up, {} in",
            status["osd_status"]["num_osds"],
            status["osd_status"]["num_up_osds"],
            status["osd_status"]["num_in_osds"]
        );
        println!("PGs: {}", status["pg_status"]["num_pgs"]);

        Ok(())
    }

    async fn fs(&self, cmd: &FsCmd) -> Result<()> {
        let client = Client::new();
        match cmd {
            FsCmd::List { usage } => {
                let list = self
                    .send(
                        client
                            .get(self.url("/api/v1/fs"))
                            .query(&[("include_usage", usage)]),
                    )
                    .await?;
                println!("{:<24} {:<32} {:>6} {:>12}", "NAME", "DATA POOLS", "MDS", "STORED (TiB)");
                for fs in list["filesystems"].as_array().into_iter().flatten() {
                    let pools: Vec<&str> = fs["data_pools"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(Value::as_str)
                        .collect();
                    let stored = fs["usage"]["stored_tb"]
                        .as_f64()
                        .map(|tb| format!("{:.3}", tb))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<24} {:<32} {:>6} {:>12}",
                        fs["name"].as_str().unwrap_or_default(),
                        pools.join(","),
                        fs["mds_count"],
                        stored
                    );
                }
                println!("{} filesystem(s)", list["count"]);
            }
            FsCmd::Show { name } => {
                let fs = self
                    .send(client.get(self.url(&format!("/api/v1/fs/{}", name))))
                    .await?;
                println!("{}", serde_json::to_string_pretty(&fs)?);
            }
            FsCmd::Create {
                name,
                crush_rule,
                pg,
                no_snapshots,
                no_auth,
                auth_client,
            } => {
                let body = json!({
                    "name": name,
                    "crush_rule": crush_rule,
                    "meta_pool_pg": pg,
                    "enable_snapshots": !no_snapshots,
                    "create_auth": !no_auth,
                    "auth_client_name": auth_client,
                });
                let created = self
                    .send(client.post(self.url("/api/v1/fs")).json(&body))
                    .await?;
                println!("Created filesystem {}", created["name"].as_str().unwrap_or(name));
                println!("  metadata pool: {}", created["metadata_pool"].as_str().unwrap_or_default());
                println!("  data pool:     {}", created["data_pool"].as_str().unwrap_or_default());
                if let Some(key) = created["auth_key"].as_str() {
                    println!(
                        "  client.{} key: {}",
                        created["auth_client_name"].as_str().unwrap_or(name),
                        key
                    );
                }
            }
            FsCmd::Delete { name, keep_auth } => {
                self.send(
                    client
                        .delete(self.url(&format!("/api/v1/fs/{}", name)))
                        .query(&[("confirm", name.as_str())])
                        .query(&[("delete_auth", !keep_auth)]),
                )
                .await?;
                println!("Deleted filesystem {}", name);
            }
        }
        Ok(())
    }

    async fn auth(&self, cmd: &AuthCmd) -> Result<()> {
        let client = Client::new();
        match cmd {
            AuthCmd::List { filter, limit } => {
                let mut builder = client
                    .get(self.url("/api/v1/auth"))
                    .query(&[("limit", limit)]);
                if let Some(filter) = filter {
                    builder = builder.query(&[("filter", filter)]);
                }
                let list = self.send(builder).await?;
                for entity in list["clients"].as_array().into_iter().flatten() {
                    let caps: Vec<String> = entity["caps"]
                        .as_object()
                        .into_iter()
                        .flatten()
                        .map(|(k, v)| format!("{}={}", k, v.as_str().unwrap_or_default()))
                        .collect();
                    println!(
                        "{:<32} {}",
                        entity["entity"].as_str().unwrap_or_default(),
                        caps.join(" ")
                    );
                }
                println!("{} of {} client(s)", list["clients"].as_array().map(Vec::len).unwrap_or(0), list["total"]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_commands() {
        let cli = Cli::try_parse_from([
            "cephx-api",
            "--server",
            "http://ceph-api:8080/",
            "-k",
            "secret",
            "fs",
            "create",
            "home",
            "--pg",
            "32",
            "--no-auth",
        ])
        .unwrap();
        assert_eq!(cli.url("/api/v1/fs"), "http://ceph-api:8080/api/v1/fs");
        assert_eq!(cli.api_key.as_deref(), Some("secret"));
        match cli.command {
            Command::Fs {
                cmd: FsCmd::Create { name, pg, no_auth, no_snapshots, .. },
            } => {
                assert_eq!(name, "home");
                assert_eq!(pg, Some(32));
                assert!(no_auth);
                assert!(!no_snapshots);
            }
            _ => panic!("expected fs create"),
        }
    }

    #[test]
    fn serve_takes_optional_config() {
        let cli = Cli::try_parse_from(["cephx-api", "serve", "-c", "/etc/cephx-api.toml"]).unwrap();
        match cli.command {
            Command::Serve { config } => {
                assert_eq!(config, Some(PathBuf::from("/etc/cephx-api.toml")))
            }
            _ => panic!("expected serve"),
        }
    }
}
