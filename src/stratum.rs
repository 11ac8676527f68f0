//! The Stratum mining-pool server.
//!
//! Wire format: newline-delimited JSON objects carrying `{id, method,
//! params, result, error}`. Handled methods are `mining.subscribe`,
//! `mining.authorize` and `mining.submit`; the server pushes
//! `mining.notify` jobs every thirty seconds and whenever a new chain head
//! invalidates the current one. Malformed JSON terminates the connection;
//! protocol-level errors are answered with `{error: {code: -1, message}}`
//! and the connection survives.
//!
//! Shares are verified against the job's target through the shared PoW
//! engine cache before the solved block is handed to the submit hook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ethereum_types::{H256, U256};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use crate::consensus::{to_target, PowCache};
use crate::crypto::sha256;
use crate::errors::{ChainResult, StratumError};
use crate::types::Block;

/// Cadence of unforced job rebroadcasts.
pub const JOB_INTERVAL: Duration = Duration::from_secs(30);

/// A unit of work handed to miners. Invalidated by the next chain head or
/// the next refresh, whichever comes first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Hex of the sealed header bytes the miner hashes over.
    pub header: String,
    /// Hex of the engine seed digest for this job.
    pub seed: String,
    /// Hex of the proof target.
    pub target: String,
    pub height: u64,
    pub timestamp: u64,
}

/// One JSON line in either direction.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StratumMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StratumMessage {
    fn response(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Self::default()
        }
    }

    fn error_response(id: Option<Value>, error: &StratumError) -> Self {
        Self {
            id,
            error: Some(json!({ "code": error.code, "message": error.message })),
            ..Self::default()
        }
    }

    fn notify(job: &Job) -> Self {
        Self {
            method: Some("mining.notify".to_string()),
            params: Some(json!([job.id, job.header, job.seed, job.target])),
            ..Self::default()
        }
    }
}

/// Chain-side hooks: build a block template over the current head, and
/// verify-and-append a solved block.
pub trait WorkProvider: Send + Sync + 'static {
    fn get_work(&self) -> ChainResult<Block>;
    fn submit_work(&self, block: Block) -> ChainResult<()>;
}

struct ClientHandle {
    sender: mpsc::UnboundedSender<String>,
    worker: Option<String>,
}

pub struct StratumServer {
    provider: Arc<dyn WorkProvider>,
    pow: Arc<PowCache>,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    current: RwLock<Option<(Job, Block)>>,
    next_client: AtomicU64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl StratumServer {
    pub fn new(provider: Arc<dyn WorkProvider>, pow: Arc<PowCache>) -> Self {
        Self {
            provider,
            pow,
            clients: Mutex::new(HashMap::new()),
            current: RwLock::new(None),
            next_client: AtomicU64::new(0),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn current_job(&self) -> Option<Job> {
        self.current.read().as_ref().map(|(job, _)| job.clone())
    }

    /// Build a fresh job from the work provider and broadcast it to every
    /// subscribed miner.
    pub fn refresh_job(&self) {
        let template = match self.provider.get_work() {
            Ok(template) => template,
            Err(err) => {
                warn!(%err, "work template unavailable");
                return;
            }
        };
        let sealed = template.header.pow_bytes();
        let job = Job {
            id: format!("{:016x}", rand::random::<u64>()),
            header: hex::encode(&sealed),
            seed: hex::encode(sha256(&sealed)),
            target: format!("{:x}", to_target(template.difficulty())),
            height: template.number(),
            timestamp: unix_now(),
        };
        debug!(job = %job.id, height = job.height, "broadcasting job");

        let line = match serde_json::to_string(&StratumMessage::notify(&job)) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "job serialization failed");
                return;
            }
        };
        *self.current.write() = Some((job, template));

        let clients = self.clients.lock();
        for client in clients.values() {
            let _ = client.sender.send(line.clone());
        }
    }

    /// Serve miners until shutdown. Jobs refresh every 30 seconds and on
    /// every new chain head.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut head_watch: watch::Receiver<H256>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ChainResult<()> {
        info!(addr = %listener.local_addr()?, "stratum server started");

        let broadcaster = Arc::clone(&self);
        let mut broadcaster_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(JOB_INTERVAL);
            loop {
                tokio::select! {
                    _ = broadcaster_shutdown.changed() => return,
                    _ = ticker.tick() => broadcaster.refresh_job(),
                    changed = head_watch.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        broadcaster.refresh_job();
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("stratum server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "miner connected");
                            let server = Arc::clone(&self);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                server.serve_client(stream, shutdown).await;
                            });
                        }
                        Err(err) => warn!(%err, "stratum accept failed"),
                    }
                }
            }
        }
    }

    async fn serve_client(self: Arc<Self>, stream: tokio::net::TcpStream, mut shutdown: watch::Receiver<bool>) {
        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        self.clients.lock().insert(
            client_id,
            ClientHandle {
                sender,
                worker: None,
            },
        );

        tokio::spawn(client_writer(write_half, receiver));

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                _ = shutdown.changed() => break,
                read = reader.read_line(&mut line) => {
                    match read {
                        Ok(0) => break,
                        Ok(_) => {
                            if !self.handle_line(client_id, line.trim()) {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(client = client_id, %err, "miner read failed");
                            break;
                        }
                    }
                }
            }
        }
        self.clients.lock().remove(&client_id);
        debug!(client = client_id, "miner disconnected");
    }

    /// Process one request line. Returns false when the connection must be
    /// terminated (malformed JSON).
    fn handle_line(&self, client_id: u64, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        let message: StratumMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                debug!(client = client_id, %err, "malformed stratum frame");
                let error = StratumError::protocol("malformed request");
                self.reply(client_id, StratumMessage::error_response(None, &error));
                return false;
            }
        };

        let id = message.id.clone();
        let reply = match message.method.as_deref() {
            Some("mining.subscribe") => self.handle_subscribe(client_id, id),
            Some("mining.authorize") => self.handle_authorize(client_id, id, message.params),
            Some("mining.submit") => self.handle_submit(id, message.params),
            Some(other) => {
                let error = StratumError::protocol(format!("unknown method {other}"));
                StratumMessage::error_response(id, &error)
            }
            None => {
                // A bare response from the miner; nothing to answer.
                return true;
            }
        };
        self.reply(client_id, reply);
        true
    }

    fn handle_subscribe(&self, client_id: u64, id: Option<Value>) -> StratumMessage {
        let reply = StratumMessage::response(
            id,
            json!([["mining.notify", "mining.set_difficulty"], "1.0"]),
        );
        // A subscriber gets the live job immediately rather than waiting for
        // the next broadcast tick.
        if let Some(job) = self.current_job() {
            if let Ok(line) = serde_json::to_string(&StratumMessage::notify(&job)) {
                if let Some(client) = self.clients.lock().get(&client_id) {
                    let _ = client.sender.send(line);
                }
            }
        }
        reply
    }

    fn handle_authorize(
        &self,
        client_id: u64,
        id: Option<Value>,
        params: Option<Value>,
    ) -> StratumMessage {
        let worker = params
            .as_ref()
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(Value::as_str)
            .unwrap_or("anonymous")
            .to_string();
        if let Some(client) = self.clients.lock().get_mut(&client_id) {
            client.worker = Some(worker);
        }
        StratumMessage::response(id, Value::Bool(true))
    }

    fn handle_submit(&self, id: Option<Value>, params: Option<Value>) -> StratumMessage {
        match self.accept_share(params) {
            Ok(()) => StratumMessage::response(id, Value::Bool(true)),
            Err(error) => StratumMessage::error_response(id, &error),
        }
    }

    /// Validate `[worker, job_id, nonce, mix]` against the current job and
    /// forward the solved block on success.
    fn accept_share(&self, params: Option<Value>) -> Result<(), StratumError> {
        let params = params
            .as_ref()
            .and_then(Value::as_array)
            .ok_or_else(|| StratumError::protocol("submit expects an array"))?;
        let job_id = params
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| StratumError::protocol("missing job id"))?;
        let nonce_hex = params
            .get(2)
            .and_then(Value::as_str)
            .ok_or_else(|| StratumError::protocol("missing nonce"))?;
        let mix_hex = params
            .get(3)
            .and_then(Value::as_str)
            .ok_or_else(|| StratumError::protocol("missing mix digest"))?;

        let nonce = u64::from_str_radix(nonce_hex.trim_start_matches("0x"), 16)
            .map_err(|_| StratumError::protocol("invalid nonce"))?;
        let mix_bytes = hex::decode(mix_hex.trim_start_matches("0x"))
            .map_err(|_| StratumError::protocol("invalid mix digest"))?;
        if mix_bytes.len() != 32 {
            return Err(StratumError::protocol("invalid mix digest"));
        }

        let (job, template) = {
            let current = self.current.read();
            match current.as_ref() {
                Some((job, template)) if job.id == job_id => (job.clone(), template.clone()),
                Some(_) => return Err(StratumError::protocol("stale job")),
                None => return Err(StratumError::protocol("no active job")),
            }
        };

        let sealed = hex::decode(&job.header).map_err(|_| StratumError::protocol("corrupt job"))?;
        let target = U256::from_str_radix(&job.target, 16)
            .map_err(|_| StratumError::protocol("corrupt job"))?;
        let engine = self.pow.engine_for(&sealed);
        if !engine.verify(&sealed, nonce, target) {
            return Err(StratumError::protocol("share below target"));
        }

        let mut solved = template;
        solved.header.nonce = nonce;
        solved.header.mix_digest = H256::from_slice(&mix_bytes);
        self.provider.submit_work(solved).map_err(|err| StratumError {
            code: -1,
            message: format!("submit rejected: {err}"),
        })?;
        info!(job = %job.id, height = job.height, "share accepted and submitted");
        Ok(())
    }

    fn reply(&self, client_id: u64, message: StratumMessage) {
        if let Ok(line) = serde_json::to_string(&message) {
            if let Some(client) = self.clients.lock().get(&client_id) {
                let _ = client.sender.send(line);
            }
        }
    }
}

async fn client_writer(mut writer: OwnedWriteHalf, mut receiver: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = receiver.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        if writer.write_all(b"\n").await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::NogoPow;
    use ethereum_types::U256;

    struct StaticProvider {
        accepted: Mutex<Vec<Block>>,
    }

    impl StaticProvider {
        fn new() -> Self {
            Self {
                accepted: Mutex::new(Vec::new()),
            }
        }

        fn template() -> Block {
            let mut block = Block::genesis();
            block.header.number = 1;
            block.header.difficulty = U256::one();
            block
        }
    }

    impl WorkProvider for StaticProvider {
        fn get_work(&self) -> ChainResult<Block> {
            Ok(Self::template())
        }

        fn submit_work(&self, block: Block) -> ChainResult<()> {
            self.accepted.lock().push(block);
            Ok(())
        }
    }

    fn server_with_job() -> (Arc<StratumServer>, Arc<StaticProvider>) {
        let provider = Arc::new(StaticProvider::new());
        let server = Arc::new(StratumServer::new(provider.clone(), Arc::new(PowCache::new())));
        server.refresh_job();
        (server, provider)
    }

    #[test]
    fn refresh_publishes_a_job_over_the_template() {
        let (server, _) = server_with_job();
        let job = server.current_job().expect("job");
        assert_eq!(job.height, 1);
        let sealed = hex::decode(&job.header).expect("hex header");
        assert_eq!(hex::encode(sha256(&sealed)), job.seed);
        assert_eq!(job.target, format!("{:x}", U256::MAX));
    }

    #[test]
    fn valid_share_is_verified_and_submitted() {
        let (server, provider) = server_with_job();
        let job = server.current_job().expect("job");

        let sealed = hex::decode(&job.header).expect("hex header");
        let mut engine = NogoPow::new();
        engine.initialize(&sealed);
        let outcome = engine.mine(&sealed, U256::MAX, 0, 16);
        assert!(outcome.found);

        let params = json!([
            "worker1",
            job.id,
            format!("{:x}", outcome.nonce),
            hex::encode(outcome.mix_digest)
        ]);
        assert!(server.accept_share(Some(params)).is_ok());
        let accepted = provider.accepted.lock();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].header.nonce, outcome.nonce);
    }

    #[test]
    fn stale_and_malformed_shares_are_refused() {
        let (server, _) = server_with_job();
        let err = server
            .accept_share(Some(json!(["w", "ffff", "0", "00"])))
            .expect_err("stale job");
        assert_eq!(err.code, -1);

        let err = server.accept_share(None).expect_err("missing params");
        assert_eq!(err.code, -1);

        let job = server.current_job().expect("job");
        let err = server
            .accept_share(Some(json!(["w", job.id, "zz", "00"])))
            .expect_err("bad nonce");
        assert_eq!(err.code, -1);
    }
}
