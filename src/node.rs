//! The node: one context owning every subsystem, the message dispatch that
//! ties the transport to the synchroniser and the pool, and the mining work
//! provider backing both the Stratum server and `nogo_getWork`.
//!
//! `Node::start` spawns the long-lived tasks (p2p listener, sync loop,
//! stratum server, RPC server) and returns a [`NodeHandle`] that tracks
//! their join handles; `NodeHandle::shutdown` flips the shared watch flag
//! and awaits them all.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ethereum_types::H256;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::config::NodeConfig;
use crate::consensus::{calculate_difficulty, PowCache};
use crate::crypto::Address;
use crate::errors::ChainResult;
use crate::evm::{apply_block, BlockEnv};
use crate::p2p::{Message, MessageHandler, P2pServer, Priority};
use crate::params::{self, ForkSchedule};
use crate::rpc::{self, RpcContext};
use crate::state::WorldState;
use crate::stratum::{StratumServer, WorkProvider};
use crate::sync::{NullFetcher, PeerRecord, Synchronizer, BATCH_SIZE};
use crate::txpool::TxPool;
use crate::types::Block;
use crate::validator::Validator;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct Node {
    config: NodeConfig,
    chain: Arc<Chain>,
    state: Arc<Mutex<WorldState>>,
    pool: Arc<TxPool>,
    pow: Arc<PowCache>,
    p2p: Arc<P2pServer>,
    sync: Arc<Synchronizer>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        // Parsed eagerly so a bad coinbase fails startup, not the first
        // template.
        config.coinbase()?;

        let chain = Arc::new(Chain::new(None));
        let state = Arc::new(Mutex::new(WorldState::new()));
        let pool = Arc::new(TxPool::new());
        let pow = Arc::new(PowCache::new());
        let p2p = Arc::new(P2pServer::new());
        let sync = Arc::new(Synchronizer::new(
            chain.clone(),
            state.clone(),
            Validator::default(),
            pow.clone(),
            Arc::new(NullFetcher),
            config.sync.sync_mode(),
        ));

        // Accepted blocks propagate outward and clear their transactions.
        {
            let p2p = p2p.clone();
            let pool = pool.clone();
            sync.on_accepted(Arc::new(move |block: &Block| {
                pool.evict_confirmed(block);
                p2p.broadcast_block(block.clone());
            }));
        }

        Ok(Self {
            config,
            chain,
            state,
            pool,
            pow,
            p2p,
            sync,
        })
    }

    pub fn chain(&self) -> Arc<Chain> {
        self.chain.clone()
    }

    pub fn pool(&self) -> Arc<TxPool> {
        self.pool.clone()
    }

    pub fn sync(&self) -> Arc<Synchronizer> {
        self.sync.clone()
    }

    pub fn work_provider(&self) -> ChainResult<Arc<dyn WorkProvider>> {
        Ok(Arc::new(NodeWorkProvider {
            chain: self.chain.clone(),
            state: self.state.clone(),
            pool: self.pool.clone(),
            sync: self.sync.clone(),
            validator: Validator::default(),
            coinbase: self.config.coinbase()?,
            extra_data: self.config.mining.extra_data.as_bytes().to_vec(),
        }))
    }

    /// Spawn every enabled service and hand back their join handles.
    pub async fn start(self) -> ChainResult<NodeHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let dispatch: Arc<dyn MessageHandler> = Arc::new(NodeDispatch {
            chain: self.chain.clone(),
            pool: self.pool.clone(),
            sync: self.sync.clone(),
        });

        let p2p_listener = TcpListener::bind(&self.config.p2p.listen_addr).await?;
        {
            let p2p = self.p2p.clone();
            let dispatch = dispatch.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = p2p.run(p2p_listener, dispatch, shutdown).await {
                    warn!(%err, "p2p listener exited");
                }
            }));
        }

        for bootnode in &self.config.p2p.bootnodes {
            match self
                .p2p
                .connect(bootnode, dispatch.clone(), shutdown_rx.clone())
                .await
            {
                Ok(peer_id) => {
                    let head = self.chain.current_head();
                    self.p2p.send_to(
                        &peer_id,
                        Message::Handshake {
                            head: head.hash(),
                            total_difficulty: self.chain.head_total_difficulty(),
                            number: head.number(),
                        },
                        Priority::High,
                    );
                    self.p2p.probe_latency(peer_id);
                }
                Err(err) => warn!(bootnode, %err, "bootnode unreachable"),
            }
        }

        if self.config.sync.enabled {
            let sync = self.sync.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                sync.run(shutdown).await;
            }));
        }

        if self.config.stratum.enabled {
            let provider = self.work_provider()?;
            let stratum = Arc::new(StratumServer::new(provider, self.pow.clone()));
            let listener = TcpListener::bind(&self.config.stratum.listen_addr).await?;
            let head_watch = self.chain.watch_head();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = stratum.run(listener, head_watch, shutdown).await {
                    warn!(%err, "stratum server exited");
                }
            }));
        }

        if self.config.rpc.enabled {
            let work = self.work_provider().ok();
            let ctx = Arc::new(RpcContext {
                chain: self.chain.clone(),
                state: self.state.clone(),
                pool: self.pool.clone(),
                sync: self.sync.clone(),
                p2p: Some(self.p2p.clone()),
                work,
                jwt_secret: self.config.rpc.jwt_secret.clone(),
            });
            if let Some(secret) = &self.config.rpc.jwt_secret {
                match rpc::issue_token(secret) {
                    Ok(token) => info!(%token, "rpc bearer token issued"),
                    Err(err) => warn!(%err, "token issuance failed"),
                }
            }
            let listener = TcpListener::bind(&self.config.rpc.listen_addr).await?;
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = rpc::serve(ctx, listener, shutdown).await {
                    warn!(%err, "rpc server exited");
                }
            }));
        }

        info!(
            chain_id = params::CHAIN_ID,
            head = self.chain.head_number(),
            "node started"
        );
        Ok(NodeHandle {
            shutdown: shutdown_tx,
            tasks,
            chain: self.chain,
            pool: self.pool,
            sync: self.sync,
            p2p: self.p2p,
        })
    }
}

/// Running-node handle: shared components plus the spawned tasks.
pub struct NodeHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub chain: Arc<Chain>,
    pub pool: Arc<TxPool>,
    pub sync: Arc<Synchronizer>,
    pub p2p: Arc<P2pServer>,
}

impl NodeHandle {
    /// Flip the shutdown flag and wait for every task to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("node stopped");
    }
}

/// Routes inbound peer messages into the synchroniser, the pool and the
/// chain.
struct NodeDispatch {
    chain: Arc<Chain>,
    pool: Arc<TxPool>,
    sync: Arc<Synchronizer>,
}

impl MessageHandler for NodeDispatch {
    fn handle(&self, server: &P2pServer, peer_id: &str, message: Message) {
        match message {
            Message::Handshake {
                head,
                total_difficulty,
                number,
            } => {
                self.sync.add_peer(PeerRecord {
                    id: peer_id.to_string(),
                    head,
                    total_difficulty,
                    block_number: number,
                    last_seen: 0,
                });
                // Answer with our own view so both sides can pick a sync
                // direction.
                let our_head = self.chain.current_head();
                server.send_to(
                    peer_id,
                    Message::Handshake {
                        head: our_head.hash(),
                        total_difficulty: self.chain.head_total_difficulty(),
                        number: our_head.number(),
                    },
                    Priority::High,
                );
            }
            Message::NewBlock { block } => {
                let (hash, number) = (block.hash(), block.number());
                self.sync.import_blocks(vec![block]);
                self.sync
                    .update_peer(peer_id, hash, self.chain.head_total_difficulty(), number);
            }
            Message::NewTransaction { transaction } => {
                if self.pool.validate(&transaction).is_ok() {
                    self.pool.add(transaction);
                } else {
                    debug!(peer = peer_id, "dropping malformed gossiped transaction");
                }
            }
            Message::GetBlocks { from, to } => {
                let to = to.min(from.saturating_add(BATCH_SIZE - 1));
                let blocks: Vec<Block> = (from..=to)
                    .map_while(|number| self.chain.get_by_number(number))
                    .collect();
                if !blocks.is_empty() {
                    server.send_to(peer_id, Message::Blocks { blocks }, Priority::Normal);
                }
            }
            Message::Blocks { blocks } => {
                self.sync.import_blocks(blocks);
            }
            // Latency probes are answered by the transport itself.
            Message::Ping { .. } | Message::Pong { .. } => {}
        }
    }
}

/// Builds block templates over the current head and feeds solved blocks
/// back through full validation.
struct NodeWorkProvider {
    chain: Arc<Chain>,
    state: Arc<Mutex<WorldState>>,
    pool: Arc<TxPool>,
    sync: Arc<Synchronizer>,
    validator: Validator,
    coinbase: Address,
    extra_data: Vec<u8>,
}

impl NodeWorkProvider {
    fn build_template(&self, transactions: Vec<crate::types::Transaction>) -> ChainResult<Block> {
        let parent = self.chain.current_head();
        let number = parent.number() + 1;
        let time = unix_now().max(parent.header.time + 1);
        let difficulty =
            calculate_difficulty(parent.header.time, time, parent.difficulty(), number);

        let mut block = Block::new(
            parent.hash(),
            self.coinbase,
            H256::zero(),
            difficulty,
            number,
            parent.header.gas_limit,
            0,
            time,
            self.extra_data.clone(),
            transactions,
            Vec::new(),
        );

        let env = BlockEnv::from_header(&block.header, ForkSchedule::default());
        let mut state = self.state.lock();
        let snapshot = state.snapshot();
        let outcome = apply_block(&mut state, &env, &block, params::CHAIN_ID);
        let root = state.state_root();
        state.revert_to_snapshot(snapshot);
        let gas_used = outcome?;

        block.header.state_root = root;
        block.header.gas_used = gas_used;
        Ok(block)
    }

    fn pending_transactions(&self) -> Vec<crate::types::Transaction> {
        let state = self.state.lock();
        let mut transactions: Vec<_> = self
            .pool
            .get_all()
            .into_iter()
            .filter(|tx| self.validator.validate_tx(tx, &state).is_ok())
            .collect();
        // Highest-paying first, mirroring block-proposal policy.
        transactions.sort_by(|a, b| b.gas_price.cmp(&a.gas_price));
        transactions
    }
}

impl WorkProvider for NodeWorkProvider {
    fn get_work(&self) -> ChainResult<Block> {
        match self.build_template(self.pending_transactions()) {
            Ok(block) => Ok(block),
            Err(err) => {
                // A conflicting pool selection must not stall mining; fall
                // back to an empty template.
                debug!(%err, "template with pending transactions failed");
                self.build_template(Vec::new())
            }
        }
    }

    fn submit_work(&self, block: Block) -> ChainResult<()> {
        if block.parent_hash() != self.chain.current_head().hash() {
            // Solved against a stale head; still importable if the parent
            // is known.
            debug!(number = block.number(), "submission for non-head parent");
        }
        self.sync.import_block(block)
    }
}
