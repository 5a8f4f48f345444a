// The blockchain variant (§4.15, §6.3). An append-only chain of blocks
// holding fee-bearing transactions, wallets with pending/settled balances,
// and proof-of-work mining with a difficulty retarget toward a 5-second
// block interval. Persisted to SQLite rather than the JSON snapshots the
// rest of the store uses — the original keeps these on two different
// persistence paths and this port preserves that asymmetry rather than
// unifying it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use indexmap::IndexMap;
use mgin_base::{err, Result, Value};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

pub const GENESIS_ADDRESS: &str = "0000000000000000000000000000000000000000000000000000000000000000";
const TARGET_BLOCK_SECONDS: i64 = 5;
const MIN_DIFFICULTY: u32 = 1;
const MAX_DIFFICULTY: u32 = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub symbol: String,
    /// Fernet-style ciphertext, already encrypted with the sender's
    /// derived key by the time it reaches a block.
    pub data: String,
    pub fee: f64,
    pub action: String,
    pub contract_hash: String,
    pub timestamp: i64,
}

impl Transaction {
    fn to_value(&self) -> Value {
        let mut m = IndexMap::new();
        m.insert("sender".into(), Value::Str(self.sender.clone()));
        m.insert("receiver".into(), Value::Str(self.receiver.clone()));
        m.insert("amount".into(), Value::Float(self.amount));
        m.insert("symbol".into(), Value::Str(self.symbol.clone()));
        m.insert("data".into(), Value::Str(self.data.clone()));
        m.insert("fee".into(), Value::Float(self.fee));
        m.insert("action".into(), Value::Str(self.action.clone()));
        m.insert("contract_hash".into(), Value::Str(self.contract_hash.clone()));
        m.insert("timestamp".into(), Value::Int(self.timestamp));
        Value::Object(m)
    }

    /// Txid: SHA-256 hex over the transaction's canonical serialization
    /// (§3.1), so two conforming implementations agree on the hash.
    pub fn txid(&self) -> String {
        hex_sha256(&self.to_value().canonical_json())
    }

    pub fn checksum(&self) -> String {
        self.txid()
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub difficulty: u32,
    pub validation_time: f64,
    pub size: usize,
    pub previous_hash: String,
    pub hash: String,
    pub checksum: String,
    pub transactions: Vec<Transaction>,
    pub fee: f64,
    pub validator: String,
}

impl Block {
    fn header_value(&self) -> Value {
        let mut m = IndexMap::new();
        m.insert("index".into(), Value::Int(self.index as i64));
        m.insert("timestamp".into(), Value::Int(self.timestamp));
        m.insert("nonce".into(), Value::Int(self.nonce as i64));
        m.insert("difficulty".into(), Value::Int(self.difficulty as i64));
        m.insert("previous_hash".into(), Value::Str(self.previous_hash.clone()));
        m.insert(
            "data".into(),
            Value::List(self.transactions.iter().map(Transaction::to_value).collect()),
        );
        Value::Object(m)
    }

    fn compute_hash(&self) -> String {
        hex_sha256(&self.header_value().canonical_json())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Wallet {
    pub address: String,
    pub balance: f64,
    pub balance_pending: f64,
    pub tx_count: u64,
    pub last_tx_timestamp: i64,
}

pub struct Blockchain {
    pub blocks: Vec<Block>,
    pub pending: Vec<Transaction>,
    pub wallets: IndexMap<String, Wallet>,
    pub block_max_size: usize,
    pub validator_reward: f64,
}

impl Blockchain {
    /// A fresh chain with only the genesis block, `{index: 0, previous_hash: "0"}`.
    pub fn genesis(block_max_size: usize, validator_reward: f64, now: i64) -> Blockchain {
        let genesis = Block {
            index: 0,
            timestamp: now,
            nonce: 0,
            difficulty: MIN_DIFFICULTY,
            validation_time: 0.0,
            size: 0,
            previous_hash: "0".to_string(),
            hash: String::new(),
            checksum: String::new(),
            transactions: vec![],
            fee: 0.0,
            validator: GENESIS_ADDRESS.to_string(),
        };
        let mut genesis = genesis;
        genesis.hash = genesis.compute_hash();
        genesis.checksum = genesis.hash.clone();
        Blockchain {
            blocks: vec![genesis],
            pending: vec![],
            wallets: IndexMap::new(),
            block_max_size,
            validator_reward,
        }
    }

    pub fn new_wallet(&mut self, address: &str) -> &Wallet {
        self.wallets.entry(address.to_string()).or_insert_with(|| Wallet {
            address: address.to_string(),
            ..Wallet::default()
        })
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    /// Submit a transaction to the pending pool. Debits the sender's
    /// balance immediately (optimistic spend); credited back to the
    /// receiver only when the block including it is mined.
    pub fn submit_transaction(&mut self, tx: Transaction, now: i64) -> Result<String> {
        let sender = self.wallets.entry(tx.sender.clone()).or_insert_with(|| Wallet {
            address: tx.sender.clone(),
            ..Wallet::default()
        });
        if sender.balance < tx.amount + tx.fee && tx.sender != GENESIS_ADDRESS {
            return Err(err(format!("Insufficient balance for {}", tx.sender)));
        }
        if tx.sender != GENESIS_ADDRESS {
            sender.balance -= tx.amount + tx.fee;
        }
        sender.balance_pending += tx.amount + tx.fee;
        sender.tx_count += 1;
        sender.last_tx_timestamp = now;
        let txid = tx.txid();
        self.pending.push(tx);
        Ok(txid)
    }

    /// Whether enough pending transactions (by serialized byte size) have
    /// accumulated to assemble a block.
    pub fn ready_for_block(&self) -> bool {
        let size: usize = self.pending.iter().map(|t| t.to_value().canonical_json().len()).sum();
        size >= self.block_max_size && !self.pending.is_empty()
    }

    /// Assemble and mine a block from every pending transaction, rewarding
    /// `validator` from the genesis address. `now`/`wall_seconds` feed the
    /// difficulty retarget and `validation_time` field.
    pub fn mine_block(&mut self, validator: &str, now: i64) -> Result<&Block> {
        if self.pending.is_empty() {
            return Err(err("No pending transactions to mine"));
        }
        let previous = self.blocks.last().expect("genesis always present");
        let difficulty = retarget_difficulty(previous, now);

        let total_fee: f64 = self.pending.iter().map(|t| t.fee).sum();
        let mut transactions = std::mem::take(&mut self.pending);
        if self.validator_reward > 0.0 {
            let reward = Transaction {
                sender: GENESIS_ADDRESS.to_string(),
                receiver: validator.to_string(),
                amount: self.validator_reward + total_fee,
                symbol: "MGIN".to_string(),
                data: String::new(),
                fee: 0.0,
                action: "REWARD".to_string(),
                contract_hash: String::new(),
                timestamp: now,
            };
            transactions.push(reward);
        }

        let started = now;
        let mut nonce = 0u64;
        let mut block = Block {
            index: previous.index + 1,
            timestamp: now,
            nonce,
            difficulty,
            validation_time: 0.0,
            size: 0,
            previous_hash: previous.hash.clone(),
            hash: String::new(),
            checksum: String::new(),
            transactions,
            fee: total_fee,
            validator: validator.to_string(),
        };
        let prefix = "0".repeat(difficulty as usize);
        loop {
            block.nonce = nonce;
            let hash = block.compute_hash();
            if hash.starts_with(&prefix) {
                block.hash = hash;
                break;
            }
            nonce += 1;
        }
        block.checksum = block.hash.clone();
        block.size = block.header_value().canonical_json().len();
        block.validation_time = (now - started) as f64;

        for tx in &block.transactions {
            if tx.action == "REWARD" {
                continue;
            }
            let receiver = self.wallets.entry(tx.receiver.clone()).or_insert_with(|| Wallet {
                address: tx.receiver.clone(),
                ..Wallet::default()
            });
            receiver.balance += tx.amount;
            if let Some(sender) = self.wallets.get_mut(&tx.sender) {
                sender.balance_pending -= tx.amount + tx.fee;
            }
        }
        if let Some(validator_wallet) = self.wallets.get_mut(validator) {
            validator_wallet.balance += self.validator_reward + total_fee;
        } else {
            self.new_wallet(validator);
            self.wallets.get_mut(validator).unwrap().balance += self.validator_reward + total_fee;
        }

        self.blocks.push(block);
        info!(target: "mgin", "mined block {} at difficulty {difficulty}", self.blocks.len() - 1);
        Ok(self.blocks.last().unwrap())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// §8 invariant 8: hash prefix matches difficulty, chain links by hash.
    pub fn verify_chain(&self) -> bool {
        for pair in self.blocks.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            if cur.previous_hash != prev.hash {
                return false;
            }
            let prefix = "0".repeat(cur.difficulty as usize);
            if !cur.hash.starts_with(&prefix) || cur.compute_hash() != cur.hash {
                return false;
            }
        }
        true
    }
}

/// Difficulty retargets once per block toward a `TARGET_BLOCK_SECONDS`
/// interval, clamped to `[1,3]`. The clamp can stall retargeting at the
/// boundary when actual block time diverges wildly from target; preserved
/// rather than fixed (SPEC_FULL.md §9 open question).
fn retarget_difficulty(previous: &Block, now: i64) -> u32 {
    let elapsed = (now - previous.timestamp).max(0);
    let mut difficulty = previous.difficulty;
    if elapsed < TARGET_BLOCK_SECONDS {
        difficulty += 1;
    } else if elapsed > TARGET_BLOCK_SECONDS {
        difficulty = difficulty.saturating_sub(1);
    }
    difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Derive a per-address keystream: SHA-256(address), repeated to cover the
/// plaintext length. Deterministic per address, no random salt — an
/// intentionally weak stand-in for Fernet that this port preserves rather
/// than silently strengthens (SPEC_FULL.md §9).
fn derive_key(address: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.finalize().to_vec()
}

pub fn encrypt_data(address: &str, plaintext: &str) -> String {
    let key = derive_key(address);
    let bytes: Vec<u8> = plaintext
        .as_bytes()
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decrypt_data(address: &str, ciphertext: &str) -> Result<String> {
    let key = derive_key(address);
    let bytes = URL_SAFE_NO_PAD
        .decode(ciphertext)
        .map_err(|e| err(format!("Malformed ciphertext: {e}")))?;
    let plain: Vec<u8> = bytes.iter().enumerate().map(|(i, b)| b ^ key[i % key.len()]).collect();
    String::from_utf8(plain).map_err(|e| err(format!("Decrypted data is not valid UTF-8: {e}")))
}

/// Opens (creating if absent) the SQLite database backing the blockchain
/// variant and ensures its three tables exist (§6.3).
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS blockchain (
            id INTEGER PRIMARY KEY,
            block_index INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            nonce INTEGER NOT NULL,
            difficulty INTEGER NOT NULL,
            validation_time REAL NOT NULL,
            size INTEGER NOT NULL,
            previous_hash TEXT NOT NULL,
            hash TEXT NOT NULL,
            checksum TEXT NOT NULL,
            data TEXT NOT NULL,
            fee REAL NOT NULL,
            validator TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS wallets (
            address TEXT PRIMARY KEY,
            tx_count INTEGER NOT NULL,
            tx_data TEXT NOT NULL,
            last_tx_timestamp INTEGER NOT NULL,
            balances TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS contracts (
            contract_hash TEXT PRIMARY KEY,
            owner_address TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            logo TEXT NOT NULL,
            symbol TEXT NOT NULL,
            supply TEXT NOT NULL,
            max_supply TEXT NOT NULL,
            can_mint INTEGER NOT NULL,
            can_burn INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );",
    )?;
    Ok(conn)
}

pub fn persist_block(conn: &Connection, block: &Block) -> Result<()> {
    let data = Value::List(block.transactions.iter().map(Transaction::to_value).collect()).canonical_json();
    conn.execute(
        "INSERT INTO blockchain (block_index, timestamp, nonce, difficulty, validation_time, size, previous_hash, hash, checksum, data, fee, validator)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            block.index as i64,
            block.timestamp,
            block.nonce as i64,
            block.difficulty as i64,
            block.validation_time,
            block.size as i64,
            block.previous_hash,
            block.hash,
            block.checksum,
            data,
            block.fee,
            block.validator,
        ],
    )?;
    Ok(())
}

pub fn persist_wallet(conn: &Connection, wallet: &Wallet) -> Result<()> {
    let mut balances = IndexMap::new();
    balances.insert("balance".to_string(), Value::Float(wallet.balance));
    balances.insert("balance_pending".to_string(), Value::Float(wallet.balance_pending));
    conn.execute(
        "INSERT INTO wallets (address, tx_count, tx_data, last_tx_timestamp, balances)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(address) DO UPDATE SET tx_count=excluded.tx_count, tx_data=excluded.tx_data,
             last_tx_timestamp=excluded.last_tx_timestamp, balances=excluded.balances",
        params![
            wallet.address,
            wallet.tx_count as i64,
            "[]",
            wallet.last_tx_timestamp,
            Value::Object(balances).canonical_json(),
        ],
    )?;
    Ok(())
}

pub fn load_blockchain(conn: &Connection, block_max_size: usize, validator_reward: f64) -> Result<Blockchain> {
    let mut stmt = conn.prepare(
        "SELECT block_index, timestamp, nonce, difficulty, validation_time, size, previous_hash, hash, checksum, data, fee, validator FROM blockchain ORDER BY block_index",
    )?;
    let mut blocks = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let data: String = row.get(9)?;
        let txs = parse_transactions(&data);
        blocks.push(Block {
            index: row.get::<_, i64>(0)? as u64,
            timestamp: row.get(1)?,
            nonce: row.get::<_, i64>(2)? as u64,
            difficulty: row.get::<_, i64>(3)? as u32,
            validation_time: row.get(4)?,
            size: row.get::<_, i64>(5)? as usize,
            previous_hash: row.get(6)?,
            hash: row.get(7)?,
            checksum: row.get(8)?,
            transactions: txs,
            fee: row.get(10)?,
            validator: row.get(11)?,
        });
    }
    if blocks.is_empty() {
        warn!(target: "mgin", "blockchain.db has no blocks, starting fresh genesis");
        return Ok(Blockchain::genesis(block_max_size, validator_reward, 0));
    }
    Ok(Blockchain { blocks, pending: vec![], wallets: IndexMap::new(), block_max_size, validator_reward })
}

fn parse_transactions(json: &str) -> Vec<Transaction> {
    let parsed: serde_json::Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(_) => return vec![],
    };
    let value = Value::from_json(&parsed);
    let Some(items) = value.as_list() else { return vec![] };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            Some(Transaction {
                sender: obj.get("sender")?.stringify(),
                receiver: obj.get("receiver")?.stringify(),
                amount: obj.get("amount")?.as_f64().unwrap_or(0.0),
                symbol: obj.get("symbol").map(Value::stringify).unwrap_or_default(),
                data: obj.get("data").map(Value::stringify).unwrap_or_default(),
                fee: obj.get("fee").and_then(Value::as_f64).unwrap_or(0.0),
                action: obj.get("action").map(Value::stringify).unwrap_or_default(),
                contract_hash: obj.get("contract_hash").map(Value::stringify).unwrap_or_default(),
                timestamp: obj.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sender: &str, receiver: &str, amount: f64) -> Transaction {
        Transaction {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            amount,
            symbol: "MGIN".to_string(),
            data: String::new(),
            fee: 0.1,
            action: "TRANSFER".to_string(),
            contract_hash: String::new(),
            timestamp: 0,
        }
    }

    #[test]
    fn genesis_block_has_zero_index_and_sentinel_previous_hash() {
        let chain = Blockchain::genesis(100, 10.0, 0);
        assert_eq!(chain.blocks[0].index, 0);
        assert_eq!(chain.blocks[0].previous_hash, "0");
    }

    #[test]
    fn mined_block_hash_has_required_leading_zeros() {
        let mut chain = Blockchain::genesis(1, 10.0, 0);
        chain.new_wallet("alice");
        chain.wallets.get_mut("alice").unwrap().balance = 100.0;
        chain.submit_transaction(tx("alice", "bob", 5.0), 1).unwrap();
        let block = chain.mine_block("validator", 1).unwrap();
        let prefix = "0".repeat(block.difficulty as usize);
        assert!(block.hash.starts_with(&prefix));
        assert_eq!(block.previous_hash, chain.blocks[0].hash);
    }

    #[test]
    fn chain_verifies_after_mining() {
        let mut chain = Blockchain::genesis(1, 10.0, 0);
        chain.new_wallet("alice");
        chain.wallets.get_mut("alice").unwrap().balance = 100.0;
        chain.submit_transaction(tx("alice", "bob", 5.0), 1).unwrap();
        chain.mine_block("validator", 1).unwrap();
        assert!(chain.verify_chain());
    }

    #[test]
    fn insufficient_balance_is_rejected() {
        let mut chain = Blockchain::genesis(1, 10.0, 0);
        chain.new_wallet("alice");
        assert!(chain.submit_transaction(tx("alice", "bob", 5.0), 0).is_err());
    }

    #[test]
    fn encrypt_decrypt_roundtrips() {
        let cipher = encrypt_data("alice", "secret payload");
        assert_ne!(cipher, "secret payload");
        assert_eq!(decrypt_data("alice", &cipher).unwrap(), "secret payload");
    }

    #[test]
    fn encryption_is_deterministic_per_address() {
        let a = encrypt_data("alice", "hello");
        let b = encrypt_data("alice", "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn difficulty_stays_within_clamp() {
        let block = Block {
            index: 0,
            timestamp: 0,
            nonce: 0,
            difficulty: 3,
            validation_time: 0.0,
            size: 0,
            previous_hash: "0".into(),
            hash: String::new(),
            checksum: String::new(),
            transactions: vec![],
            fee: 0.0,
            validator: GENESIS_ADDRESS.to_string(),
        };
        let next = retarget_difficulty(&block, 0);
        assert!(next <= MAX_DIFFICULTY && next >= MIN_DIFFICULTY);
    }
}
