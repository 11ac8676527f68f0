//! Wire-level pool tests: a real Stratum server on an ephemeral port,
//! spoken to over TCP with newline-delimited JSON.

use std::sync::Arc;

use ethereum_types::U256;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use nogochain::consensus::PowCache;
use nogochain::errors::ChainResult;
use nogochain::stratum::{StratumServer, WorkProvider};
use nogochain::types::Block;

struct TestProvider {
    accepted: Mutex<usize>,
}

impl WorkProvider for TestProvider {
    fn get_work(&self) -> ChainResult<Block> {
        let mut template = Block::genesis();
        template.header.number = 1;
        template.header.difficulty = U256::one();
        Ok(template)
    }

    fn submit_work(&self, _block: Block) -> ChainResult<()> {
        *self.accepted.lock() += 1;
        Ok(())
    }
}

struct PoolFixture {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    _shutdown: watch::Sender<bool>,
    _head: watch::Sender<ethereum_types::H256>,
}

impl PoolFixture {
    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("send");
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("reply within deadline")
            .expect("read");
        serde_json::from_str(line.trim()).expect("json line")
    }

    /// Read until a reply carrying `id` arrives, skipping pushed
    /// notifications.
    async fn recv_reply(&mut self, id: u64) -> Value {
        loop {
            let message = self.recv().await;
            if message.get("id") == Some(&json!(id)) {
                return message;
            }
        }
    }
}

async fn connected_pool() -> (PoolFixture, Arc<TestProvider>) {
    let provider = Arc::new(TestProvider {
        accepted: Mutex::new(0),
    });
    let server = Arc::new(StratumServer::new(provider.clone(), Arc::new(PowCache::new())));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (head_tx, head_rx) = watch::channel(ethereum_types::H256::zero());
    tokio::spawn(server.run(listener, head_rx, shutdown_rx));

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (read_half, write_half) = stream.into_split();
    (
        PoolFixture {
            reader: BufReader::new(read_half),
            writer: write_half,
            _shutdown: shutdown_tx,
            _head: head_tx,
        },
        provider,
    )
}

#[tokio::test]
async fn subscribe_and_authorize_handshake() {
    let (mut pool, _) = connected_pool().await;

    pool.send(json!({ "id": 1, "method": "mining.subscribe", "params": [] }))
        .await;
    let reply = pool.recv_reply(1).await;
    assert_eq!(
        reply["result"],
        json!([["mining.notify", "mining.set_difficulty"], "1.0"])
    );
    assert!(reply.get("error").map_or(true, Value::is_null));

    pool.send(json!({
        "id": 2,
        "method": "mining.authorize",
        "params": ["worker1", "x"]
    }))
    .await;
    let reply = pool.recv_reply(2).await;
    assert_eq!(reply["result"], json!(true));
}

#[tokio::test]
async fn unknown_methods_get_protocol_errors() {
    let (mut pool, _) = connected_pool().await;

    pool.send(json!({ "id": 5, "method": "mining.bogus", "params": [] }))
        .await;
    let reply = pool.recv_reply(5).await;
    assert_eq!(reply["error"]["code"], json!(-1));

    // The connection survives a protocol error.
    pool.send(json!({ "id": 6, "method": "mining.authorize", "params": ["w", ""] }))
        .await;
    let reply = pool.recv_reply(6).await;
    assert_eq!(reply["result"], json!(true));
}

#[tokio::test]
async fn jobs_are_pushed_to_subscribers_on_head_change() {
    let (mut pool, _) = connected_pool().await;

    pool.send(json!({ "id": 1, "method": "mining.subscribe", "params": [] }))
        .await;
    pool.recv_reply(1).await;

    // A head change forces a fresh notify.
    pool._head
        .send(ethereum_types::H256::repeat_byte(1))
        .expect("head update");

    let deadline = Duration::from_secs(5);
    let notify = timeout(deadline, async {
        loop {
            let message = pool.recv().await;
            if message.get("method") == Some(&json!("mining.notify")) {
                return message;
            }
        }
    })
    .await
    .expect("notify within deadline");

    let params = notify["params"].as_array().expect("params");
    assert_eq!(params.len(), 4, "job id, header, seed, target");
    let target = params[3].as_str().expect("target hex");
    assert_eq!(
        U256::from_str_radix(target, 16).expect("parse target"),
        U256::MAX,
        "difficulty one yields the maximum target"
    );
}

#[tokio::test]
async fn mined_share_is_accepted_end_to_end() {
    let (mut pool, provider) = connected_pool().await;

    pool.send(json!({ "id": 1, "method": "mining.subscribe", "params": [] }))
        .await;
    pool.recv_reply(1).await;
    pool._head
        .send(ethereum_types::H256::repeat_byte(2))
        .expect("head update");

    let notify = timeout(Duration::from_secs(5), async {
        loop {
            let message = pool.recv().await;
            if message.get("method") == Some(&json!("mining.notify")) {
                return message;
            }
        }
    })
    .await
    .expect("job");
    let params = notify["params"].as_array().expect("params").clone();
    let job_id = params[0].as_str().expect("job id").to_string();
    let header = hex::decode(params[1].as_str().expect("header")).expect("header hex");
    let target = U256::from_str_radix(params[3].as_str().expect("target"), 16).expect("target");

    let mut engine = nogochain::consensus::NogoPow::new();
    engine.initialize(&header);
    let outcome = engine.mine(&header, target, 0, 64);
    assert!(outcome.found, "trivial target must be minable");

    pool.send(json!({
        "id": 9,
        "method": "mining.submit",
        "params": [
            "worker1",
            job_id,
            format!("{:x}", outcome.nonce),
            hex::encode(outcome.mix_digest)
        ]
    }))
    .await;
    let reply = pool.recv_reply(9).await;
    assert_eq!(reply["result"], json!(true));
    assert_eq!(*provider.accepted.lock(), 1);
}
