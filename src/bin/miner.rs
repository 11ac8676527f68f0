//! CLI Stratum miner: subscribes to a pool, authorizes a worker, and mines
//! the jobs it is notified of with the NogoPow engine, submitting any
//! solution it finds.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ethereum_types::U256;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nogochain::consensus::NogoPow;

#[derive(Parser)]
#[command(author, version, about = "NogoChain stratum miner")]
struct Cli {
    /// Pool address, host:port.
    #[arg(long, default_value = "127.0.0.1:3333")]
    pool: String,
    /// Worker name presented at authorization.
    #[arg(long, default_value = "miner1")]
    worker: String,
    /// Worker password.
    #[arg(long, default_value = "")]
    password: String,
    /// Mining threads (informational; the scan uses available parallelism).
    #[arg(long, default_value_t = 1)]
    threads: usize,
    /// Nonces scanned per job before checking for a newer one.
    #[arg(long, default_value_t = 100_000)]
    batch: u64,
}

fn send(stream: &mut TcpStream, value: &Value) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    Ok(())
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> Result<Value> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        bail!("pool closed the connection");
    }
    Ok(serde_json::from_str(line.trim())?)
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    info!(pool = %cli.pool, worker = %cli.worker, threads = cli.threads, "connecting");

    let mut stream = TcpStream::connect(&cli.pool)
        .with_context(|| format!("unable to reach pool {}", cli.pool))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    send(
        &mut stream,
        &json!({ "id": 1, "method": "mining.subscribe", "params": [] }),
    )?;
    let reply = read_reply(&mut reader)?;
    if reply.get("error").map_or(false, |e| !e.is_null()) {
        bail!("subscribe rejected: {reply}");
    }
    info!("subscribed");

    send(
        &mut stream,
        &json!({
            "id": 2,
            "method": "mining.authorize",
            "params": [cli.worker, cli.password]
        }),
    )?;
    let reply = read_reply(&mut reader)?;
    if reply.get("error").map_or(false, |e| !e.is_null()) {
        bail!("authorization rejected: {reply}");
    }
    info!("authorized");

    let mut engine = NogoPow::new();
    let mut submit_id = 3u64;
    loop {
        let message = read_reply(&mut reader)?;
        if message.get("method").and_then(Value::as_str) != Some("mining.notify") {
            continue;
        }
        let Some(params) = message.get("params").and_then(Value::as_array) else {
            continue;
        };
        let (Some(job_id), Some(header_hex), Some(_seed), Some(target_hex)) = (
            params.first().and_then(Value::as_str),
            params.get(1).and_then(Value::as_str),
            params.get(2).and_then(Value::as_str),
            params.get(3).and_then(Value::as_str),
        ) else {
            warn!("malformed job notification");
            continue;
        };

        let header = match hex::decode(header_hex) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "undecodable job header");
                continue;
            }
        };
        let target = match U256::from_str_radix(target_hex, 16) {
            Ok(target) => target,
            Err(err) => {
                warn!(%err, "undecodable job target");
                continue;
            }
        };

        info!(job = job_id, "mining new job");
        engine.initialize(&header);
        let outcome = engine.mine_parallel(&header, target, cli.batch);
        if !outcome.found {
            info!(job = job_id, batch = cli.batch, "batch exhausted, awaiting next job");
            continue;
        }

        info!(job = job_id, nonce = outcome.nonce, "solution found");
        send(
            &mut stream,
            &json!({
                "id": submit_id,
                "method": "mining.submit",
                "params": [
                    cli.worker,
                    job_id,
                    format!("{:x}", outcome.nonce),
                    hex::encode(outcome.mix_digest)
                ]
            }),
        )?;
        submit_id += 1;
    }
}
