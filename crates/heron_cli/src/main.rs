use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use heron_client::Client;
use heron_server::{Server, ServerConfig};

/// HeronDB — remote transactional key-value store.
#[derive(Debug, Parser)]
#[command(name = "heron", about = "HeronDB server and client", version)]
struct Cli {
    /// Client mode; without it the process runs as a server.
    #[arg(short = 'c', long)]
    client: bool,

    /// Server: port to listen on.
    #[arg(long, default_value_t = 8099)]
    port: u16,

    /// Server: directory the databases live under.
    #[arg(long, default_value = "./dbs")]
    path: PathBuf,

    /// Server: require this Authorization header on every request.
    #[arg(long)]
    auth_key: Option<String>,

    /// Client: server address.
    #[arg(long, default_value = "http://127.0.0.1:8099")]
    srv: String,

    /// Client: `get|put|delete db bucket key|NEW [value|-]`.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    heron_common::init_tracing();
    let cli = Cli::parse();

    if cli.client {
        run_client(&cli).await
    } else {
        run_server(&cli).await
    }
}

async fn run_server(cli: &Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.path)
        .with_context(|| format!("create database directory {}", cli.path.display()))?;

    let mut config = ServerConfig::new(&cli.path);
    config.auth_key = cli.auth_key.clone();
    let server = Server::new(config);

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!("listening on {addr}");

    server
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

const USAGE: &str = "invalid args, must be [get|put|delete] db bucket [key|NEW] [value|-]";

async fn run_client(cli: &Cli) -> Result<()> {
    let args = &cli.args;
    if args.len() < 4 {
        bail!(USAGE);
    }
    let (verb, db, bucket, key) = (args[0].as_str(), &args[1], &args[2], &args[3]);

    let mut client = Client::new(&cli.srv);
    client.auth_key = cli.auth_key.clone();

    let mut tx = client.begin(db).await?;
    let result = run_verb(&mut tx, verb, db, bucket, key, args.get(4)).await;
    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!("rollback failed: {rb}");
            }
            Err(e)
        }
    }
}

async fn run_verb(
    tx: &mut heron_client::Tx<'_>,
    verb: &str,
    db: &str,
    bucket: &str,
    key: &str,
    value: Option<&String>,
) -> Result<()> {
    match verb {
        "put" => {
            let Some(value) = value else { bail!(USAGE) };
            let key = if key == "NEW" {
                // Legacy convention: allocated keys start at index + 1000.
                let n = tx.next_index(bucket).await?;
                (n + 1000).to_string()
            } else {
                key.to_string()
            };
            let value = if value == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf).context("read value from stdin")?;
                buf
            } else {
                value.clone()
            };
            tx.put(bucket, &key, &value).await?;
            println!("PUT {db} {bucket} {key}");
        }
        "get" => {
            let v: String = tx.get(bucket, key).await?;
            println!("GET {db} {bucket} {key}: {v}");
        }
        "delete" => {
            tx.delete(bucket, key).await?;
            println!("DELETE {db} {bucket} {key}");
        }
        _ => bail!(USAGE),
    }
    Ok(())
}
