//! World state: accounts, balances, nonces, code and contract storage with
//! snapshot/revert support.
//!
//! Snapshots are journal marks rather than deep copies: every mutation
//! appends an undo record, `snapshot()` captures the journal length, and
//! `revert_to_snapshot` replays undo records in reverse down to the mark.
//! Reverting is therefore O(changed) in both space and time. The snapshot
//! stack is purely transactional and never persisted.
//!
//! Logs and preimages are append-only side buffers outside the journal:
//! reverting accounts and storage leaves them in place.
//!
//! Invariants:
//!
//! * Reads always observe prior writes (there is no write-behind cache).
//! * `state_root()` is deterministic over the account and storage content
//!   and invalidated by every mutation.
//! * Snapshot ids increase monotonically within one thread of execution;
//!   the state is single-owner for the duration of a transaction.

use std::collections::{HashMap, HashSet};

use ethereum_types::{H256, U256};
use serde::{Deserialize, Serialize};

use crate::crypto::{keccak256, merkle_root, Address};

/// Keccak-256 of the empty byte string, the code hash of code-less accounts.
pub fn empty_code_hash() -> H256 {
    keccak256(&[])
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: H256,
}

impl Account {
    fn new() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            code_hash: empty_code_hash(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == empty_code_hash()
    }
}

/// An EVM log record. The block context fields are filled in when the
/// containing transaction is placed in a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    #[serde(with = "crate::types::hex_bytes")]
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: H256,
    pub tx_index: u32,
    pub block_hash: H256,
    pub index: u32,
}

enum JournalEntry {
    AccountCreated {
        address: Address,
    },
    BalanceChanged {
        address: Address,
        prev: U256,
    },
    NonceChanged {
        address: Address,
        prev: u64,
    },
    CodeChanged {
        address: Address,
        prev_hash: H256,
    },
    StorageChanged {
        address: Address,
        key: H256,
        prev: Option<H256>,
    },
    SuicideMarked {
        address: Address,
    },
}

#[derive(Default)]
pub struct WorldState {
    accounts: HashMap<Address, Account>,
    storage: HashMap<Address, HashMap<H256, H256>>,
    /// Contract code, content-addressed by its keccak digest.
    code: HashMap<H256, Vec<u8>>,
    suicides: HashSet<Address>,
    logs: Vec<Log>,
    preimages: HashMap<H256, Vec<u8>>,
    journal: Vec<JournalEntry>,
    snapshots: Vec<usize>,
    root_cache: Option<H256>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self) {
        self.root_cache = None;
    }

    /// Create the account if absent. Idempotent.
    pub fn create_account(&mut self, address: Address) {
        if !self.accounts.contains_key(&address) {
            self.accounts.insert(address, Account::new());
            self.journal.push(JournalEntry::AccountCreated { address });
            self.touch();
        }
    }

    fn account_mut(&mut self, address: Address) -> &mut Account {
        self.create_account(address);
        self.accounts.get_mut(&address).expect("account just created")
    }

    pub fn exists(&self, address: Address) -> bool {
        self.accounts.contains_key(&address)
    }

    pub fn is_empty(&self, address: Address) -> bool {
        self.accounts
            .get(&address)
            .map(Account::is_empty)
            .unwrap_or(true)
    }

    pub fn add_balance(&mut self, address: Address, amount: U256) {
        let prev = self.get_balance(address);
        let account = self.account_mut(address);
        account.balance = prev.saturating_add(amount);
        self.journal.push(JournalEntry::BalanceChanged { address, prev });
        self.touch();
    }

    pub fn sub_balance(&mut self, address: Address, amount: U256) {
        let prev = self.get_balance(address);
        let account = self.account_mut(address);
        account.balance = prev.saturating_sub(amount);
        self.journal.push(JournalEntry::BalanceChanged { address, prev });
        self.touch();
    }

    pub fn get_balance(&self, address: Address) -> U256 {
        self.accounts
            .get(&address)
            .map(|account| account.balance)
            .unwrap_or_default()
    }

    pub fn get_nonce(&self, address: Address) -> u64 {
        self.accounts
            .get(&address)
            .map(|account| account.nonce)
            .unwrap_or_default()
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) {
        let prev = self.get_nonce(address);
        self.account_mut(address).nonce = nonce;
        self.journal.push(JournalEntry::NonceChanged { address, prev });
        self.touch();
    }

    pub fn increment_nonce(&mut self, address: Address) {
        let nonce = self.get_nonce(address);
        self.set_nonce(address, nonce + 1);
    }

    pub fn get_code_hash(&self, address: Address) -> H256 {
        self.accounts
            .get(&address)
            .map(|account| account.code_hash)
            .unwrap_or_else(H256::zero)
    }

    pub fn get_code(&self, address: Address) -> Vec<u8> {
        self.accounts
            .get(&address)
            .and_then(|account| self.code.get(&account.code_hash))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_code_size(&self, address: Address) -> usize {
        self.accounts
            .get(&address)
            .and_then(|account| self.code.get(&account.code_hash))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) {
        let hash = keccak256(&code);
        let prev_hash = {
            let account = self.account_mut(address);
            let prev = account.code_hash;
            account.code_hash = hash;
            prev
        };
        self.code.insert(hash, code);
        self.journal
            .push(JournalEntry::CodeChanged { address, prev_hash });
        self.touch();
    }

    pub fn get_state(&self, address: Address, key: H256) -> H256 {
        self.storage
            .get(&address)
            .and_then(|slots| slots.get(&key))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_state(&mut self, address: Address, key: H256, value: H256) {
        self.create_account(address);
        let slots = self.storage.entry(address).or_default();
        let prev = slots.insert(key, value);
        self.journal
            .push(JournalEntry::StorageChanged { address, key, prev });
        self.touch();
    }

    pub fn for_each_storage(&self, address: Address, mut visit: impl FnMut(H256, H256) -> bool) {
        if let Some(slots) = self.storage.get(&address) {
            for (key, value) in slots {
                if !visit(*key, *value) {
                    break;
                }
            }
        }
    }

    /// Mark the account for destruction at transaction end. Returns true if
    /// the account existed and is now marked.
    pub fn suicide(&mut self, address: Address) -> bool {
        if !self.exists(address) {
            return false;
        }
        if self.suicides.insert(address) {
            self.journal.push(JournalEntry::SuicideMarked { address });
        }
        true
    }

    pub fn has_suicided(&self, address: Address) -> bool {
        self.suicides.contains(&address)
    }

    /// Purge accounts marked by `suicide`. Called once at the end of a
    /// transaction, outside any snapshot scope.
    pub fn finalize_suicides(&mut self) {
        if self.suicides.is_empty() {
            return;
        }
        for address in std::mem::take(&mut self.suicides) {
            self.accounts.remove(&address);
            self.storage.remove(&address);
        }
        self.touch();
    }

    pub fn add_log(&mut self, log: Log) {
        self.logs.push(log);
    }

    pub fn get_logs(&self) -> &[Log] {
        &self.logs
    }

    pub fn add_preimage(&mut self, hash: H256, preimage: Vec<u8>) {
        self.preimages.entry(hash).or_insert(preimage);
    }

    pub fn get_preimage(&self, hash: H256) -> Option<&[u8]> {
        self.preimages.get(&hash).map(Vec::as_slice)
    }

    /// Capture the current journal position. Ids are dense and increase
    /// monotonically until reverted.
    pub fn snapshot(&mut self) -> usize {
        let id = self.snapshots.len();
        self.snapshots.push(self.journal.len());
        id
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Roll accounts and storage back to snapshot `id` and drop the stack
    /// above it. Unknown ids are ignored.
    pub fn revert_to_snapshot(&mut self, id: usize) {
        let Some(&mark) = self.snapshots.get(id) else {
            return;
        };
        while self.journal.len() > mark {
            let entry = self.journal.pop().expect("journal length checked");
            self.undo(entry);
        }
        self.snapshots.truncate(id + 1);
        self.touch();
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::AccountCreated { address } => {
                self.accounts.remove(&address);
                self.storage.remove(&address);
                self.suicides.remove(&address);
            }
            JournalEntry::BalanceChanged { address, prev } => {
                if let Some(account) = self.accounts.get_mut(&address) {
                    account.balance = prev;
                }
            }
            JournalEntry::NonceChanged { address, prev } => {
                if let Some(account) = self.accounts.get_mut(&address) {
                    account.nonce = prev;
                }
            }
            JournalEntry::CodeChanged { address, prev_hash } => {
                if let Some(account) = self.accounts.get_mut(&address) {
                    account.code_hash = prev_hash;
                }
            }
            JournalEntry::StorageChanged { address, key, prev } => {
                if let Some(slots) = self.storage.get_mut(&address) {
                    match prev {
                        Some(value) => {
                            slots.insert(key, value);
                        }
                        None => {
                            slots.remove(&key);
                        }
                    }
                }
            }
            JournalEntry::SuicideMarked { address } => {
                self.suicides.remove(&address);
            }
        }
    }

    /// Deterministic commitment over every account and its storage: a sorted
    /// binary merkle over per-account leaves
    /// `keccak(addr ‖ nonce ‖ balance ‖ code_hash ‖ storage_root)`.
    pub fn state_root(&mut self) -> H256 {
        if let Some(root) = self.root_cache {
            return root;
        }
        let mut leaves = Vec::with_capacity(self.accounts.len());
        for (address, account) in &self.accounts {
            let storage_root = self.storage_root(*address);
            let mut data = Vec::with_capacity(20 + 8 + 32 + 32 + 32);
            data.extend_from_slice(address.as_bytes());
            data.extend_from_slice(&account.nonce.to_be_bytes());
            let mut balance = [0u8; 32];
            account.balance.to_big_endian(&mut balance);
            data.extend_from_slice(&balance);
            data.extend_from_slice(account.code_hash.as_bytes());
            data.extend_from_slice(storage_root.as_bytes());
            leaves.push(keccak256(&data));
        }
        let root = merkle_root(leaves);
        self.root_cache = Some(root);
        root
    }

    fn storage_root(&self, address: Address) -> H256 {
        let Some(slots) = self.storage.get(&address) else {
            return H256::zero();
        };
        let leaves = slots
            .iter()
            .filter(|(_, value)| !value.is_zero())
            .map(|(key, value)| {
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(key.as_bytes());
                data[32..].copy_from_slice(value.as_bytes());
                keccak256(&data)
            })
            .collect();
        merkle_root(leaves)
    }

    pub fn account(&self, address: Address) -> Option<&Account> {
        self.accounts.get(&address)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}
