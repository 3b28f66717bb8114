//! CLI for cluster and collection operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use minivec::collection::types::{
    CreateCollection, Distance, PointId, PointStruct, VectorParams, VectorsConfig,
};
use minivec::common::api::read_response;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "minivec")]
#[command(about = "minivec distributed vector store CLI")]
#[command(version)]
struct Cli {
    /// Any peer of the cluster
    #[arg(long, default_value = "http://localhost:6333")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show consensus status of the peer
    Cluster,

    /// List collections
    Collections,

    /// Create a collection
    Create {
        name: String,

        /// Vector field as `name:size:distance`, or `size:distance` for a single unnamed vector
        #[arg(long = "vector", required = true)]
        vectors: Vec<String>,

        #[arg(long, default_value = "1")]
        shards: u32,

        #[arg(long, default_value = "1")]
        replication: u32,
    },

    /// Drop a collection
    Drop { name: String },

    /// Upsert points from a JSON file (an array of points or `{"points": [...]}`)
    Upsert {
        name: String,

        #[arg(long)]
        file: PathBuf,

        /// Wait until every shard applied the batch
        #[arg(long)]
        wait: bool,
    },

    /// Retrieve points by id
    Get {
        name: String,

        #[arg(required = true)]
        ids: Vec<u64>,

        #[arg(long)]
        with_vector: bool,
    },

    /// Show the status of an operation
    Status { name: String, operation_id: u64 },
}

fn parse_vector(arg: &str) -> anyhow::Result<(Option<String>, VectorParams)> {
    let parts: Vec<&str> = arg.split(':').collect();
    let (name, size, distance) = match parts.as_slice() {
        [size, distance] => (None, *size, *distance),
        [name, size, distance] => (Some(name.to_string()), *size, *distance),
        _ => bail!("invalid vector `{}`, expected name:size:distance", arg),
    };
    let distance: Distance = serde_json::from_value(json!(distance))
        .with_context(|| format!("unknown distance `{}`", distance))?;
    Ok((
        name,
        VectorParams {
            size: size.parse().with_context(|| format!("invalid size in `{}`", arg))?,
            distance,
            optional: false,
        },
    ))
}

fn vectors_config(args: &[String]) -> anyhow::Result<VectorsConfig> {
    let parsed = args
        .iter()
        .map(|s| parse_vector(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    match parsed.as_slice() {
        [(None, params)] => Ok(VectorsConfig::Single(params.clone())),
        _ => {
            let mut named = BTreeMap::new();
            for (name, params) in parsed {
                let Some(name) = name else {
                    bail!("an unnamed vector cannot be combined with other vectors");
                };
                named.insert(name, params);
            }
            Ok(VectorsConfig::Multi(named))
        }
    }
}

fn read_points(file: &PathBuf) -> anyhow::Result<Vec<PointStruct>> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let value: Value = serde_json::from_slice(&data)?;
    let points = match value {
        Value::Object(mut map) => map.remove("points").unwrap_or(Value::Null),
        other => other,
    };
    Ok(serde_json::from_value(points)?)
}

fn print(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base = cli.url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let result: Value = match cli.command {
        Commands::Cluster => read_response(client.get(format!("{}/cluster", base)).send().await?).await?,

        Commands::Collections => {
            read_response(client.get(format!("{}/collections", base)).send().await?).await?
        }

        Commands::Create {
            name,
            vectors,
            shards,
            replication,
        } => {
            let body = CreateCollection {
                vectors: vectors_config(&vectors)?,
                shard_number: shards,
                replication_factor: replication,
            };
            let resp = client
                .put(format!("{}/collections/{}", base, name))
                .json(&body)
                .send()
                .await?;
            read_response(resp).await?
        }

        Commands::Drop { name } => {
            let resp = client
                .delete(format!("{}/collections/{}", base, name))
                .send()
                .await?;
            read_response(resp).await?
        }

        Commands::Upsert { name, file, wait } => {
            let points = read_points(&file)?;
            println!("Upserting {} points into `{}`", points.len(), name);
            let resp = client
                .put(format!("{}/collections/{}/points?wait={}", base, name, wait))
                .json(&json!({ "points": points }))
                .send()
                .await?;
            read_response(resp).await?
        }

        Commands::Get {
            name,
            ids,
            with_vector,
        } => {
            let ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();
            let resp = client
                .post(format!("{}/collections/{}/points", base, name))
                .json(&json!({ "ids": ids, "with_payload": true, "with_vector": with_vector }))
                .send()
                .await?;
            read_response(resp).await?
        }

        Commands::Status { name, operation_id } => {
            let resp = client
                .get(format!(
                    "{}/collections/{}/operations/{}",
                    base, name, operation_id
                ))
                .send()
                .await?;
            read_response(resp).await?
        }
    };

    print(&result)
}
