//! Block-addressable persistent store.
//!
//! Blocks and their transactions are bucketed into rolling SQLite shard
//! databases by block number (`<base>/0000/<shard>.dat`); super-blocks are
//! additionally mirrored into a dedicated side database
//! (`superblocks.dat`). Shard connections are cached and recycled; the
//! store answers point queries by number and hash queries by walking shards
//! downward from the tip.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Amount, Block, BlockSignature, Transaction};

/// Number of blocks past a transaction's declared height within which the
/// transaction may still have been applied; bounds lookup scans.
pub const TX_SEARCH_WINDOW: u64 = 43_200;

const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECTION_CACHE_LIMIT: usize = 50;

const SHARD_TABLES: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    blockNum INTEGER PRIMARY KEY,
    blockChecksum BLOB,
    lastBlockChecksum BLOB,
    walletStateChecksum BLOB,
    sigFreezeChecksum BLOB,
    difficulty INTEGER,
    powField BLOB,
    transactions TEXT,
    signatures TEXT,
    timestamp INTEGER,
    version INTEGER,
    lastSuperBlockChecksum BLOB,
    lastSuperBlockNum INTEGER,
    superBlockSegments BLOB,
    compactedSigs INTEGER,
    blockProposer BLOB
);
CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    type INTEGER,
    amount TEXT,
    fee TEXT,
    toList TEXT,
    fromList TEXT,
    dataChecksum BLOB,
    data BLOB,
    blockHeight INTEGER,
    nonce INTEGER,
    timestamp INTEGER,
    checksum BLOB,
    signature BLOB,
    pubKey BLOB,
    applied INTEGER,
    version INTEGER
);
";

// created only after column migrations have run, so index targets exist
const SHARD_INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_tx_type ON transactions(type);
CREATE INDEX IF NOT EXISTS idx_tx_to ON transactions(toList);
CREATE INDEX IF NOT EXISTS idx_tx_from ON transactions(fromList);
CREATE INDEX IF NOT EXISTS idx_tx_applied ON transactions(applied);
";

const SIDE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS superBlocks (
    blockNum INTEGER PRIMARY KEY,
    blockChecksum BLOB,
    lastBlockChecksum BLOB,
    walletStateChecksum BLOB,
    sigFreezeChecksum BLOB,
    difficulty INTEGER,
    powField BLOB,
    transactions TEXT,
    signatures TEXT,
    timestamp INTEGER,
    version INTEGER,
    lastSuperBlockChecksum BLOB,
    lastSuperBlockNum INTEGER,
    superBlockSegments BLOB,
    compactedSigs INTEGER,
    blockProposer BLOB
);
CREATE INDEX IF NOT EXISTS idx_super_checksum ON superBlocks(blockChecksum);
CREATE INDEX IF NOT EXISTS idx_super_last ON superBlocks(lastSuperBlockChecksum);
";

const BLOCK_COLUMNS: &str = "blockNum, blockChecksum, lastBlockChecksum, walletStateChecksum, \
    sigFreezeChecksum, difficulty, powField, transactions, signatures, timestamp, version, \
    lastSuperBlockChecksum, lastSuperBlockNum, superBlockSegments, compactedSigs, blockProposer";

const TX_COLUMNS: &str = "id, type, amount, fee, toList, fromList, dataChecksum, data, \
    blockHeight, nonce, timestamp, checksum, signature, pubKey, applied, version";

struct CachedConnection {
    conn: Connection,
    last_used: Instant,
}

struct ActiveShard {
    base: Option<u64>,
    conn: Option<Connection>,
}

pub struct BlockStorage {
    shard_dir: PathBuf,
    max_blocks_per_db: u64,
    archival: bool,
    running: AtomicBool,
    /// Highest stored block number; 0 means the store is empty (block
    /// numbers start at 1).
    tip: AtomicU64,
    active: Mutex<ActiveShard>,
    super_db: Mutex<Option<Connection>>,
    cache: Mutex<HashMap<PathBuf, CachedConnection>>,
}

impl BlockStorage {
    pub fn open(data_dir: &Path, config: &StorageConfig) -> ChainResult<Self> {
        let shard_dir = data_dir.join("0000");
        fs::create_dir_all(&shard_dir)?;
        Self::remove_stray_wal_files(&shard_dir)?;

        let side_conn = Connection::open(shard_dir.join("superblocks.dat"))?;
        let _mode: String = side_conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        side_conn.execute_batch(SIDE_SCHEMA)?;

        let storage = Self {
            shard_dir,
            max_blocks_per_db: config.max_blocks_per_db.max(1),
            archival: config.archival,
            running: AtomicBool::new(true),
            tip: AtomicU64::new(0),
            active: Mutex::new(ActiveShard {
                base: None,
                conn: None,
            }),
            super_db: Mutex::new(Some(side_conn)),
            cache: Mutex::new(HashMap::new()),
        };

        if config.compact_on_start {
            storage.compact_all_shards()?;
        }
        storage.seek_latest()?;
        info!(tip = storage.tip(), "block storage ready");
        Ok(storage)
    }

    fn remove_stray_wal_files(shard_dir: &Path) -> ChainResult<()> {
        for entry in fs::read_dir(shard_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".dat-shm") || name.ends_with(".dat-wal") {
                debug!(file = %name, "removing stray write-ahead file");
                if let Err(err) = fs::remove_file(entry.path()) {
                    warn!(%err, file = %name, "failed to remove stray write-ahead file");
                }
            }
        }
        Ok(())
    }

    fn compact_all_shards(&self) -> ChainResult<()> {
        for entry in fs::read_dir(&self.shard_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".dat") || name == "superblocks.dat" {
                continue;
            }
            info!(file = %name, "compacting shard");
            let conn = Self::open_shard(&path)?;
            conn.execute_batch("VACUUM")?;
            Self::close_connection(conn);
        }
        Ok(())
    }

    /// Probes shard files upward until a gap, seeks the last existing shard
    /// and caches the highest stored block number.
    fn seek_latest(&self) -> ChainResult<()> {
        let mut last = None;
        let mut base = 0u64;
        while self.shard_path(base).exists() {
            last = Some(base);
            base += self.max_blocks_per_db;
        }
        let Some(mut base) = last else {
            return Ok(());
        };
        loop {
            let max = self.with_shard(base, false, |conn| {
                conn.query_row("SELECT MAX(blockNum) FROM blocks", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .map_err(ChainError::from)
            })?;
            if let Some(Some(max)) = max {
                self.tip.store(max as u64, Ordering::SeqCst);
                return Ok(());
            }
            if base == 0 {
                return Ok(());
            }
            base -= self.max_blocks_per_db;
        }
    }

    pub fn tip(&self) -> u64 {
        self.tip.load(Ordering::SeqCst)
    }

    pub fn is_archival(&self) -> bool {
        self.archival
    }

    fn shard_base(&self, block_num: u64) -> u64 {
        block_num / self.max_blocks_per_db * self.max_blocks_per_db
    }

    fn shard_path(&self, base: u64) -> PathBuf {
        self.shard_dir.join(format!("{base}.dat"))
    }

    fn open_shard(path: &Path) -> ChainResult<Connection> {
        let conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SHARD_TABLES)?;
        Self::migrate_shard(&conn)?;
        conn.execute_batch(SHARD_INDEXES)?;
        Ok(conn)
    }

    /// Adds columns that predate the current schema to older shard files.
    fn migrate_shard(conn: &Connection) -> ChainResult<()> {
        let tx_columns = Self::table_columns(conn, "transactions")?;
        if !tx_columns.iter().any(|c| c == "fromList") {
            debug!("adding fromList column to transactions");
            conn.execute_batch(
                "ALTER TABLE transactions ADD COLUMN fromList TEXT;
                 CREATE INDEX IF NOT EXISTS idx_tx_from ON transactions(fromList);",
            )?;
        }
        if !tx_columns.iter().any(|c| c == "dataChecksum") {
            debug!("adding dataChecksum column to transactions");
            conn.execute_batch("ALTER TABLE transactions ADD COLUMN dataChecksum BLOB;")?;
        }
        let block_columns = Self::table_columns(conn, "blocks")?;
        for (column, kind) in [
            ("compactedSigs", "INTEGER"),
            ("lastSuperBlockChecksum", "BLOB"),
            ("lastSuperBlockNum", "INTEGER"),
            ("superBlockSegments", "BLOB"),
            ("blockProposer", "BLOB"),
        ] {
            if !block_columns.iter().any(|c| c == column) {
                debug!(column, "adding column to blocks");
                conn.execute_batch(&format!("ALTER TABLE blocks ADD COLUMN {column} {kind};"))?;
            }
        }
        Ok(())
    }

    fn table_columns(conn: &Connection, table: &str) -> ChainResult<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Runs `f` against the shard holding `block_num`, seeking if needed.
    /// Returns `None` when the shard does not exist and `create` is false.
    fn with_shard<T>(
        &self,
        block_num: u64,
        create: bool,
        f: impl FnOnce(&Connection) -> ChainResult<T>,
    ) -> ChainResult<Option<T>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ChainError::Config("storage is shutting down".into()));
        }
        let base = self.shard_base(block_num);
        let mut active = self.active.lock();
        if active.base != Some(base) || active.conn.is_none() {
            let path = self.shard_path(base);
            let cached = self.cache.lock().remove(&path).map(|entry| entry.conn);
            let conn = match cached {
                Some(conn) => conn,
                None => {
                    if !create && !path.exists() {
                        return Ok(None);
                    }
                    debug!(shard = base, "opening shard database");
                    Self::open_shard(&path)?
                }
            };
            // stash the previous active connection back into the cache
            if let (Some(old_base), Some(old_conn)) = (active.base, active.conn.take()) {
                self.cache.lock().insert(
                    self.shard_path(old_base),
                    CachedConnection {
                        conn: old_conn,
                        last_used: Instant::now(),
                    },
                );
            }
            active.base = Some(base);
            active.conn = Some(conn);
            self.evict_idle_connections();
        }
        let conn = active.conn.as_ref().expect("active shard connection");
        f(conn).map(Some)
    }

    /// Closes cached connections idle beyond the timeout, then enforces the
    /// hard cap oldest-first. The active connection never lives in the
    /// cache, so it is naturally skipped.
    fn evict_idle_connections(&self) {
        let mut cache = self.cache.lock();
        let now = Instant::now();
        let stale: Vec<PathBuf> = cache
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) > CONNECTION_IDLE_TIMEOUT)
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Some(entry) = cache.remove(&path) {
                debug!(shard = %path.display(), "closing idle shard connection");
                Self::close_connection(entry.conn);
            }
        }
        while cache.len() > CONNECTION_CACHE_LIMIT {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(path, _)| path.clone());
            match oldest {
                Some(path) => {
                    if let Some(entry) = cache.remove(&path) {
                        debug!(shard = %path.display(), "evicting shard connection over cap");
                        Self::close_connection(entry.conn);
                    }
                }
                None => break,
            }
        }
    }

    fn close_connection(conn: Connection) {
        if let Err((_conn, err)) = conn.close() {
            warn!(%err, "failed to close shard connection");
        }
    }

    // --- writes ------------------------------------------------------------

    pub fn insert_block(&self, block: &Block) -> ChainResult<()> {
        // fixed lock order: super-block side connection before shard
        if block.is_super_block() {
            let guard = self.super_db.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| ChainError::Config("storage is shutting down".into()))?;
            Self::upsert_block_row(conn, "superBlocks", block)?;
        }
        self.with_shard(block.block_num, true, |conn| {
            Self::upsert_block_row(conn, "blocks", block)
        })?;
        self.tip.fetch_max(block.block_num, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_block_row(conn: &Connection, table: &str, block: &Block) -> ChainResult<()> {
        let transactions = encode_tx_id_list(&block.tx_ids)?;
        let signatures = encode_signature_list(&block.signatures);
        let segments = Block::encode_super_block_segments(&block.super_block_segments);
        let sql = format!(
            "INSERT OR REPLACE INTO {table} ({BLOCK_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        );
        conn.execute(
            &sql,
            params![
                block.block_num as i64,
                block.checksum,
                block.prev_checksum,
                block.wallet_state_checksum,
                block.sig_freeze_checksum,
                block.difficulty as i64,
                block.pow_field,
                transactions,
                signatures,
                block.timestamp,
                block.version,
                block.last_super_block_checksum,
                block.last_super_block_num as i64,
                segments,
                block.compacted_sigs as i64,
                block.block_proposer,
            ],
        )?;
        Ok(())
    }

    /// Inserts a transaction into the shard of the block that applied it.
    pub fn insert_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        let id = Transaction::legacy_id(&tx.id)?;
        let to_list = encode_address_amounts(&tx.to_list);
        let from_list = encode_address_amounts(&tx.from_list);
        let data = tx.data.as_deref().map(reverse_bytes);
        self.with_shard(tx.applied, true, |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO transactions ({TX_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    id,
                    tx.tx_type,
                    tx.amount.to_string(),
                    tx.fee.to_string(),
                    to_list,
                    from_list,
                    tx.data_checksum,
                    data,
                    tx.block_height as i64,
                    tx.nonce,
                    tx.timestamp,
                    tx.checksum,
                    tx.signature,
                    tx.pubkey,
                    tx.applied as i64,
                    tx.version,
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    // --- reads -------------------------------------------------------------
    //
    // Reads never propagate database faults to callers: errors are logged
    // together with the failing statement and the natural "not found"
    // answer is returned.

    pub fn block(&self, block_num: u64) -> Option<Block> {
        if block_num > self.tip() {
            return None;
        }
        match self.read_block(block_num) {
            Ok(block) => block,
            Err(err) => {
                warn!(%err, block_num, sql = "SELECT ... FROM blocks WHERE blockNum = ?", "block read failed");
                None
            }
        }
    }

    fn read_block(&self, block_num: u64) -> ChainResult<Option<Block>> {
        let row = self.with_shard(block_num, false, |conn| {
            conn.query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE blockNum = ?1 LIMIT 1"),
                params![block_num as i64],
                block_row,
            )
            .optional()
            .map_err(ChainError::from)
        })?;
        match row.flatten() {
            Some(row) => Ok(Some(row.into_block()?)),
            None => Ok(None),
        }
    }

    /// Looks a block up by checksum: the currently-seeked shard first, then
    /// every shard walking downward from the tip.
    pub fn block_by_hash(&self, checksum: &[u8]) -> Option<Block> {
        match self.read_block_by_hash(checksum) {
            Ok(block) => block,
            Err(err) => {
                warn!(
                    %err,
                    checksum = %hex::encode(checksum),
                    sql = "SELECT ... FROM blocks WHERE blockChecksum = ?",
                    "block hash lookup failed"
                );
                None
            }
        }
    }

    fn read_block_by_hash(&self, checksum: &[u8]) -> ChainResult<Option<Block>> {
        let current = self.active.lock().base;
        if let Some(base) = current {
            if let Some(block) = self.read_block_by_hash_in_shard(base, checksum)? {
                return Ok(Some(block));
            }
        }
        let mut base = self.shard_base(self.tip());
        loop {
            if Some(base) != current {
                if let Some(block) = self.read_block_by_hash_in_shard(base, checksum)? {
                    return Ok(Some(block));
                }
            }
            if base == 0 {
                return Ok(None);
            }
            base -= self.max_blocks_per_db;
        }
    }

    fn read_block_by_hash_in_shard(
        &self,
        base: u64,
        checksum: &[u8],
    ) -> ChainResult<Option<Block>> {
        let row = self.with_shard(base, false, |conn| {
            conn.query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE blockChecksum = ?1 LIMIT 1"),
                params![checksum],
                block_row,
            )
            .optional()
            .map_err(ChainError::from)
        })?;
        match row.flatten() {
            Some(row) => Ok(Some(row.into_block()?)),
            None => Ok(None),
        }
    }

    pub fn super_block(&self, block_num: u64) -> Option<Block> {
        self.read_super_block("blockNum = ?1", params![block_num as i64])
    }

    pub fn super_block_by_hash(&self, checksum: &[u8]) -> Option<Block> {
        self.read_super_block("blockChecksum = ?1", params![checksum])
    }

    fn read_super_block(
        &self,
        filter: &str,
        filter_params: impl rusqlite::Params,
    ) -> Option<Block> {
        let guard = self.super_db.lock();
        let conn = guard.as_ref()?;
        let result = conn
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM superBlocks WHERE {filter} LIMIT 1"),
                filter_params,
                block_row,
            )
            .optional();
        match result {
            Ok(Some(row)) => match row.into_block() {
                Ok(block) => Some(block),
                Err(err) => {
                    warn!(%err, "stored super-block failed to decode");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(%err, sql = "SELECT ... FROM superBlocks", "super-block lookup failed");
                None
            }
        }
    }

    /// Finds a transaction without knowing its block: the current shard
    /// first, then shards starting at the height embedded in the id,
    /// scanning forward at most [`TX_SEARCH_WINDOW`] blocks.
    pub fn transaction(&self, id: &[u8]) -> Option<Transaction> {
        match self.read_transaction(id) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%err, sql = "SELECT ... FROM transactions WHERE id = ?", "transaction read failed");
                None
            }
        }
    }

    fn read_transaction(&self, id: &[u8]) -> ChainResult<Option<Transaction>> {
        let legacy = Transaction::legacy_id(id)?;
        let current = self.active.lock().base;
        if let Some(base) = current {
            if let Some(tx) = self.read_transaction_in_shard(base, &legacy)? {
                return Ok(Some(tx));
            }
        }
        let Some(declared_height) = Transaction::id_block_height(id) else {
            return Ok(None);
        };
        let last_base = self.shard_base(
            declared_height
                .saturating_add(TX_SEARCH_WINDOW)
                .min(self.tip().max(declared_height)),
        );
        let mut base = self.shard_base(declared_height);
        loop {
            if Some(base) != current {
                if let Some(tx) = self.read_transaction_in_shard(base, &legacy)? {
                    return Ok(Some(tx));
                }
            }
            if base >= last_base {
                return Ok(None);
            }
            base += self.max_blocks_per_db;
        }
    }

    fn read_transaction_in_shard(
        &self,
        base: u64,
        legacy_id: &str,
    ) -> ChainResult<Option<Transaction>> {
        let row = self.with_shard(base, false, |conn| {
            conn.query_row(
                &format!("SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1 LIMIT 1"),
                params![legacy_id],
                tx_row,
            )
            .optional()
            .map_err(ChainError::from)
        })?;
        match row.flatten() {
            Some(row) => Ok(Some(row.into_transaction()?)),
            None => Ok(None),
        }
    }

    pub fn transactions_in_block(&self, block_num: u64, tx_type: Option<u32>) -> Vec<Transaction> {
        match self.read_transactions_in_block(block_num, tx_type) {
            Ok(txs) => txs,
            Err(err) => {
                warn!(%err, block_num, sql = "SELECT ... FROM transactions WHERE applied = ?", "transaction list read failed");
                Vec::new()
            }
        }
    }

    fn read_transactions_in_block(
        &self,
        block_num: u64,
        tx_type: Option<u32>,
    ) -> ChainResult<Vec<Transaction>> {
        let rows = self.with_shard(block_num, false, |conn| {
            let mut sql = format!("SELECT {TX_COLUMNS} FROM transactions WHERE applied = ?1");
            if tx_type.is_some() {
                sql.push_str(" AND type = ?2");
            }
            let mut stmt = conn.prepare(&sql)?;
            let mapped: Result<Vec<TxRow>, _> = match tx_type {
                Some(kind) => stmt
                    .query_map(params![block_num as i64, kind], tx_row)?
                    .collect(),
                None => stmt.query_map(params![block_num as i64], tx_row)?.collect(),
            };
            mapped.map_err(ChainError::from)
        })?;
        let mut transactions = Vec::new();
        for row in rows.unwrap_or_default() {
            transactions.push(row.into_transaction()?);
        }
        Ok(transactions)
    }

    // --- removal -----------------------------------------------------------

    /// Removes a block and all of its transactions. Refused on archival
    /// nodes.
    pub fn remove_block(&self, block_num: u64) -> ChainResult<bool> {
        if self.archival {
            return Err(ChainError::Config(
                "archival nodes do not remove blocks".into(),
            ));
        }
        let Some(block) = self.block(block_num) else {
            return Ok(false);
        };
        self.with_shard(block_num, false, |conn| {
            conn.execute(
                "DELETE FROM transactions WHERE applied = ?1",
                params![block_num as i64],
            )?;
            conn.execute(
                "DELETE FROM blocks WHERE blockNum = ?1",
                params![block_num as i64],
            )?;
            Ok(())
        })?;
        if block.is_super_block() {
            let guard = self.super_db.lock();
            if let Some(conn) = guard.as_ref() {
                conn.execute(
                    "DELETE FROM superBlocks WHERE blockNum = ?1",
                    params![block_num as i64],
                )?;
            }
        }
        if block_num == self.tip() {
            self.tip.store(block_num.saturating_sub(1), Ordering::SeqCst);
        }
        Ok(true)
    }

    pub fn remove_transaction(&self, id: &[u8]) -> ChainResult<bool> {
        if self.archival {
            return Err(ChainError::Config(
                "archival nodes do not remove transactions".into(),
            ));
        }
        let Some(tx) = self.transaction(id) else {
            return Ok(false);
        };
        let legacy = Transaction::legacy_id(id)?;
        self.with_shard(tx.applied, false, |conn| {
            conn.execute("DELETE FROM transactions WHERE id = ?1", params![legacy])?;
            Ok(())
        })?;
        Ok(true)
    }

    /// Deletes whole shard files strictly below the shard holding
    /// `keep_from`. Refused on archival nodes.
    pub fn prune_shards(&self, keep_from: u64) -> ChainResult<usize> {
        if self.archival {
            return Err(ChainError::Config(
                "archival nodes do not prune shards".into(),
            ));
        }
        let keep_base = self.shard_base(keep_from);
        let mut removed = 0;
        let mut base = 0;
        while base < keep_base {
            let path = self.shard_path(base);
            if path.exists() {
                {
                    let mut active = self.active.lock();
                    if active.base == Some(base) {
                        if let Some(conn) = active.conn.take() {
                            Self::close_connection(conn);
                        }
                        active.base = None;
                    }
                }
                if let Some(entry) = self.cache.lock().remove(&path) {
                    Self::close_connection(entry.conn);
                }
                Self::delete_database_files(&path)?;
                removed += 1;
            }
            base += self.max_blocks_per_db;
        }
        Ok(removed)
    }

    fn delete_database_files(path: &Path) -> ChainResult<()> {
        for suffix in ["", "-shm", "-wal"] {
            let mut target = path.as_os_str().to_owned();
            target.push(suffix);
            let target = PathBuf::from(target);
            if target.exists() {
                fs::remove_file(&target)?;
            }
        }
        Ok(())
    }

    /// Closes every connection and deletes all shard and side databases,
    /// including their write-ahead files.
    pub fn wipe(&self) -> ChainResult<()> {
        self.shutdown();
        for entry in fs::read_dir(&self.shard_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".dat") || name.ends_with(".dat-shm") || name.ends_with(".dat-wal") {
                fs::remove_file(entry.path())?;
            }
        }
        self.tip.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting seeks and closes every open connection.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        {
            let mut active = self.active.lock();
            if let Some(conn) = active.conn.take() {
                Self::close_connection(conn);
            }
            active.base = None;
        }
        {
            let mut cache = self.cache.lock();
            for (_, entry) in cache.drain() {
                Self::close_connection(entry.conn);
            }
        }
        if let Some(conn) = self.super_db.lock().take() {
            Self::close_connection(conn);
        }
    }
}

impl Drop for BlockStorage {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

// --- row mapping and column renderings -------------------------------------

struct BlockRow {
    block_num: i64,
    checksum: Vec<u8>,
    prev_checksum: Vec<u8>,
    wallet_state_checksum: Vec<u8>,
    sig_freeze_checksum: Vec<u8>,
    difficulty: i64,
    pow_field: Vec<u8>,
    transactions: String,
    signatures: String,
    timestamp: i64,
    version: u32,
    last_super_block_checksum: Option<Vec<u8>>,
    last_super_block_num: i64,
    super_block_segments: Option<Vec<u8>>,
    compacted_sigs: i64,
    block_proposer: Option<Vec<u8>>,
}

fn block_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRow> {
    Ok(BlockRow {
        block_num: row.get(0)?,
        checksum: row.get(1)?,
        prev_checksum: row.get(2)?,
        wallet_state_checksum: row.get(3)?,
        sig_freeze_checksum: row.get(4)?,
        difficulty: row.get(5)?,
        pow_field: row.get(6)?,
        transactions: row.get(7)?,
        signatures: row.get(8)?,
        timestamp: row.get(9)?,
        version: row.get(10)?,
        last_super_block_checksum: row.get(11)?,
        last_super_block_num: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
        super_block_segments: row.get(13)?,
        compacted_sigs: row.get::<_, Option<i64>>(14)?.unwrap_or(0),
        block_proposer: row.get(15)?,
    })
}

impl BlockRow {
    fn into_block(self) -> ChainResult<Block> {
        Ok(Block {
            block_num: self.block_num as u64,
            checksum: self.checksum,
            prev_checksum: self.prev_checksum,
            wallet_state_checksum: self.wallet_state_checksum,
            sig_freeze_checksum: self.sig_freeze_checksum,
            difficulty: self.difficulty as u64,
            pow_field: self.pow_field,
            tx_ids: decode_tx_id_list(&self.transactions)?,
            signatures: decode_signature_list(&self.signatures)?,
            timestamp: self.timestamp,
            version: self.version,
            last_super_block_checksum: self
                .last_super_block_checksum
                .filter(|checksum| !checksum.is_empty()),
            last_super_block_num: self.last_super_block_num as u64,
            super_block_segments: match self.super_block_segments {
                Some(data) => Block::decode_super_block_segments(&data)?,
                None => Vec::new(),
            },
            compacted_sigs: self.compacted_sigs != 0,
            block_proposer: self.block_proposer.filter(|proposer| !proposer.is_empty()),
        })
    }
}

struct TxRow {
    id: String,
    tx_type: u32,
    amount: String,
    fee: String,
    to_list: String,
    from_list: Option<String>,
    data_checksum: Option<Vec<u8>>,
    data: Option<Vec<u8>>,
    block_height: i64,
    nonce: u32,
    timestamp: i64,
    checksum: Vec<u8>,
    signature: Vec<u8>,
    pubkey: Vec<u8>,
    applied: i64,
    version: u32,
}

fn tx_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TxRow> {
    Ok(TxRow {
        id: row.get(0)?,
        tx_type: row.get(1)?,
        amount: row.get(2)?,
        fee: row.get(3)?,
        to_list: row.get(4)?,
        from_list: row.get(5)?,
        data_checksum: row.get(6)?,
        data: row.get(7)?,
        block_height: row.get(8)?,
        nonce: row.get(9)?,
        timestamp: row.get(10)?,
        checksum: row.get(11)?,
        signature: row.get(12)?,
        pubkey: row.get(13)?,
        applied: row.get(14)?,
        version: row.get(15)?,
    })
}

impl TxRow {
    fn into_transaction(self) -> ChainResult<Transaction> {
        Ok(Transaction {
            id: Transaction::id_from_legacy(&self.id)?,
            tx_type: self.tx_type,
            amount: self.amount.parse()?,
            fee: self.fee.parse()?,
            to_list: decode_address_amounts(&self.to_list)?,
            from_list: decode_address_amounts(self.from_list.as_deref().unwrap_or_default())?,
            data_checksum: self.data_checksum.filter(|checksum| !checksum.is_empty()),
            data: self.data.map(|data| reverse_bytes(&data)),
            block_height: self.block_height as u64,
            nonce: self.nonce,
            timestamp: self.timestamp,
            checksum: self.checksum,
            signature: self.signature,
            pubkey: self.pubkey,
            applied: self.applied as u64,
            version: self.version,
        })
    }
}

/// Delimited legacy id list with a leading separator: `||id1||id2`.
fn encode_tx_id_list(ids: &[Vec<u8>]) -> ChainResult<String> {
    let mut out = String::new();
    for id in ids {
        out.push_str("||");
        out.push_str(&Transaction::legacy_id(id)?);
    }
    Ok(out)
}

fn decode_tx_id_list(encoded: &str) -> ChainResult<Vec<Vec<u8>>> {
    let mut ids = Vec::new();
    // the first element of the split is empty and skipped
    for part in encoded.split("||").skip(1) {
        if part.is_empty() {
            continue;
        }
        ids.push(Transaction::id_from_legacy(part)?);
    }
    Ok(ids)
}

/// Delimited signature list: `||pubkey_b64:sig_b64`, pubkey rendered as a
/// literal `0` when absent.
fn encode_signature_list(signatures: &[BlockSignature]) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let mut out = String::new();
    for signature in signatures {
        out.push_str("||");
        match signature.pubkey.as_deref() {
            Some(pubkey) => out.push_str(&BASE64.encode(pubkey)),
            None => out.push('0'),
        }
        out.push(':');
        out.push_str(&BASE64.encode(&signature.signature));
    }
    out
}

fn decode_signature_list(encoded: &str) -> ChainResult<Vec<BlockSignature>> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::collections::HashSet;

    let mut signatures = Vec::new();
    let mut seen_signers = HashSet::new();
    for part in encoded.split("||").skip(1) {
        if part.is_empty() {
            continue;
        }
        let (pubkey_part, sig_part) = part
            .split_once(':')
            .ok_or_else(|| ChainError::Codec(format!("malformed signature entry '{part}'")))?;
        let pubkey = if pubkey_part == "0" {
            None
        } else {
            Some(BASE64.decode(pubkey_part).map_err(|err| {
                ChainError::Codec(format!("invalid signature pubkey encoding: {err}"))
            })?)
        };
        let signature = BASE64
            .decode(sig_part)
            .map_err(|err| ChainError::Codec(format!("invalid signature encoding: {err}")))?;
        let entry = BlockSignature { pubkey, signature };
        // duplicate signatures by the same signer are dropped
        if let Some(signer) = entry.signer_address() {
            if !seen_signers.insert(signer) {
                continue;
            }
        }
        signatures.push(entry);
    }
    Ok(signatures)
}

/// Address/amount list rendering: `||addr_b58:amount_b64` per entry.
fn encode_address_amounts(list: &IndexMap<Address, Amount>) -> String {
    let mut out = String::new();
    for (address, amount) in list {
        out.push_str("||");
        out.push_str(&address.to_base58());
        out.push(':');
        out.push_str(&amount.to_base64());
    }
    out
}

fn decode_address_amounts(encoded: &str) -> ChainResult<IndexMap<Address, Amount>> {
    let mut list = IndexMap::new();
    for part in encoded.split("||").skip(1) {
        if part.is_empty() {
            continue;
        }
        let (addr_part, amount_part) = part
            .split_once(':')
            .ok_or_else(|| ChainError::Codec(format!("malformed amount entry '{part}'")))?;
        list.insert(
            Address::from_base58(addr_part)?,
            Amount::from_base64(amount_part)?,
        );
    }
    Ok(list)
}

/// Storage obfuscation convention inherited from the on-disk format: data
/// blobs are byte-reversed on write and reversed back on read. Not
/// cryptographic; preserved bit-for-bit for compatibility.
fn reverse_bytes(data: &[u8]) -> Vec<u8> {
    data.iter().rev().copied().collect()
}
