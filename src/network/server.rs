use crate::config::Config;
use crate::core::{Block, BlockAdded, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    read_envelope, BlockData, GetBlocks, GetData, Inv, Message, OpType, TxData, Version,
    NODE_VERSION,
};
use crate::network::Nodes;
use crate::storage::{BlockInTransit, MemoryPool, UTXOSet};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{self, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// A message a handler wants delivered, and to whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: String,
    pub message: Message,
}

impl Outbound {
    fn new(to: &str, message: Message) -> Outbound {
        Outbound {
            to: to.to_string(),
            message,
        }
    }
}

/// One node: its chain, UTXO index, mempool and peers.
///
/// Handlers never touch the network themselves. They return the messages to
/// send, which [`Server::run`] delivers over TCP and tests can route between
/// nodes directly.
pub struct Server {
    config: Config,
    blockchain: Blockchain,
    utxo_set: UTXOSet,
    mempool: MemoryPool,
    blocks_in_transit: BlockInTransit,
    nodes: Nodes,
    // held across chain append + UTXO maintenance
    chain_lock: Mutex<()>,
    // set when the tip moved in a way `UTXOSet::update` cannot follow
    index_stale: AtomicBool,
}

impl Server {
    pub fn new(config: Config, blockchain: Blockchain) -> Server {
        let nodes = Nodes::new();
        nodes.add_node(&config.bootstrap_address);
        Server {
            utxo_set: UTXOSet::new(blockchain.clone()),
            blockchain,
            mempool: MemoryPool::new(),
            blocks_in_transit: BlockInTransit::new(),
            nodes,
            chain_lock: Mutex::new(()),
            index_stale: AtomicBool::new(false),
            config,
        }
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn get_mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    pub fn get_nodes(&self) -> &Nodes {
        &self.nodes
    }

    fn addr(&self) -> &str {
        &self.config.node_address
    }

    pub fn version_message(&self) -> Result<Message> {
        Ok(Message::Version(Version {
            version: NODE_VERSION,
            best_height: self.blockchain.get_best_height()? as u64,
            addr_from: self.addr().to_string(),
        }))
    }

    /// Messages sent when the node comes up: a handshake with the bootstrap
    /// node unless this node is the bootstrap node.
    pub fn start_messages(&self) -> Result<Vec<Outbound>> {
        if self.config.is_bootstrap() {
            return Ok(vec![]);
        }
        Ok(vec![Outbound::new(
            &self.config.bootstrap_address,
            self.version_message()?,
        )])
    }

    pub fn handle_bytes(&self, bytes: &[u8]) -> Result<Vec<Outbound>> {
        match Message::decode(bytes)? {
            Some(message) => self.handle_message(message),
            None => Ok(vec![]),
        }
    }

    pub fn handle_message(&self, message: Message) -> Result<Vec<Outbound>> {
        debug!("Received {message}");
        match message {
            Message::Version(version) => self.handle_version(version),
            Message::GetBlocks(get_blocks) => self.handle_get_blocks(get_blocks),
            Message::Inv(inv) => self.handle_inv(inv),
            Message::GetData(get_data) => self.handle_get_data(get_data),
            Message::Block(block) => self.handle_block(block),
            Message::Tx(tx) => self.handle_tx(tx),
        }
    }

    fn handle_version(&self, version: Version) -> Result<Vec<Outbound>> {
        let local_best_height = self.blockchain.get_best_height()? as u64;
        let mut outbound = vec![];

        if local_best_height < version.best_height {
            info!(
                "Peer {} is ahead ({} > {local_best_height}), requesting blocks",
                version.addr_from, version.best_height
            );
            outbound.push(Outbound::new(
                &version.addr_from,
                Message::GetBlocks(GetBlocks {
                    addr_from: self.addr().to_string(),
                }),
            ));
        } else if local_best_height > version.best_height {
            outbound.push(Outbound::new(&version.addr_from, self.version_message()?));
        }

        if version.addr_from != self.addr() && self.nodes.add_node(&version.addr_from) {
            info!("Registered peer {}", version.addr_from);
        }
        Ok(outbound)
    }

    fn handle_get_blocks(&self, get_blocks: GetBlocks) -> Result<Vec<Outbound>> {
        let items = self.blockchain.get_block_hashes()?;
        Ok(vec![Outbound::new(
            &get_blocks.addr_from,
            Message::Inv(Inv {
                addr_from: self.addr().to_string(),
                op_type: OpType::Block,
                items,
            }),
        )])
    }

    fn get_data(&self, to: &str, op_type: OpType, id: Vec<u8>) -> Outbound {
        Outbound::new(
            to,
            Message::GetData(GetData {
                addr_from: self.addr().to_string(),
                op_type,
                id,
            }),
        )
    }

    fn handle_inv(&self, inv: Inv) -> Result<Vec<Outbound>> {
        match inv.op_type {
            OpType::Block => {
                let mut unknown = Vec::with_capacity(inv.items.len());
                for hash in inv.items {
                    if !self.blockchain.block_exists(&hash)? {
                        unknown.push(hash);
                    }
                }
                if unknown.is_empty() {
                    debug!("All blocks announced by {} are known", inv.addr_from);
                    return Ok(vec![]);
                }

                info!("Fetching {} blocks from {}", unknown.len(), inv.addr_from);
                let first = unknown.remove(0);
                self.blocks_in_transit.set(unknown);
                Ok(vec![self.get_data(&inv.addr_from, OpType::Block, first)])
            }
            OpType::Tx => Ok(inv
                .items
                .into_iter()
                .filter(|txid| !self.mempool.contains(&HEXLOWER.encode(txid)))
                .map(|txid| self.get_data(&inv.addr_from, OpType::Tx, txid))
                .collect()),
        }
    }

    fn handle_get_data(&self, get_data: GetData) -> Result<Vec<Outbound>> {
        let message = match get_data.op_type {
            OpType::Block => match self.blockchain.get_block(&get_data.id)? {
                Some(block) => Message::Block(BlockData {
                    addr_from: self.addr().to_string(),
                    block: block.serialize()?,
                }),
                None => {
                    warn!(
                        "{} asked for unknown block {}",
                        get_data.addr_from,
                        HEXLOWER.encode(&get_data.id)
                    );
                    return Ok(vec![]);
                }
            },
            OpType::Tx => match self.mempool.get(&HEXLOWER.encode(&get_data.id)) {
                Some(tx) => Message::Tx(TxData {
                    addr_from: self.addr().to_string(),
                    transaction: tx.serialize()?,
                }),
                None => {
                    warn!(
                        "{} asked for transaction {} which is not pooled",
                        get_data.addr_from,
                        HEXLOWER.encode(&get_data.id)
                    );
                    return Ok(vec![]);
                }
            },
        };
        Ok(vec![Outbound::new(&get_data.addr_from, message)])
    }

    /// Stores a block from a peer, then asks for the next one still in
    /// transit.
    ///
    /// A block extending the tip is applied to the UTXO index directly. Any
    /// other move of the tip marks the index stale, and it is rebuilt once
    /// the transit queue drains. Pooled transactions are only pruned when the
    /// best chain changed.
    fn handle_block(&self, data: BlockData) -> Result<Vec<Outbound>> {
        let block = Block::deserialize(&data.block)?;
        {
            let _guard = self.chain_lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.blockchain.add_block(&block) {
                Ok(BlockAdded::Extended) => {
                    info!(
                        "Block {} from {} extends the tip to height {}",
                        block.hash_hex(),
                        data.addr_from,
                        block.get_height()
                    );
                    if !self.index_stale.load(Ordering::SeqCst) {
                        self.utxo_set.update(&block)?;
                        self.prune_mempool()?;
                    }
                }
                Ok(BlockAdded::TipMoved) => {
                    info!(
                        "Tip moved after block {} from {}",
                        block.hash_hex(),
                        data.addr_from
                    );
                    self.index_stale.store(true, Ordering::SeqCst);
                }
                Ok(BlockAdded::Stored) => {
                    info!(
                        "Stored block {} from {} without moving the tip",
                        block.hash_hex(),
                        data.addr_from
                    );
                }
                Ok(BlockAdded::Known) => debug!("Block {} is already stored", block.hash_hex()),
                Err(BlockchainError::InvalidBlock(reason)) => {
                    warn!("Dropping block from {}: {reason}", data.addr_from);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(next) = self.blocks_in_transit.pop_front() {
            return Ok(vec![self.get_data(&data.addr_from, OpType::Block, next)]);
        }

        let _guard = self.chain_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.index_stale.swap(false, Ordering::SeqCst) {
            info!("Rebuilding the UTXO index for the new best chain");
            self.utxo_set.reindex()?;
            self.prune_mempool()?;
        }
        Ok(vec![])
    }

    fn handle_tx(&self, data: TxData) -> Result<Vec<Outbound>> {
        let tx = Transaction::deserialize(&data.transaction)?;
        let txid = tx.id_hex();

        if self.mempool.contains(&txid) {
            debug!("Transaction {txid} is already pooled");
            return Ok(vec![]);
        }
        if tx.is_coinbase() {
            warn!("Dropping coinbase transaction {txid} relayed by {}", data.addr_from);
            return Ok(vec![]);
        }

        {
            let _guard = self.chain_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = self.mempool.get_all();
            match self.blockchain.verify_transaction(&tx, &pending) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Dropping invalid transaction {txid} from {}", data.addr_from);
                    return Ok(vec![]);
                }
                Err(BlockchainError::UnknownTransaction(missing)) => {
                    warn!("Dropping transaction {txid}: it spends unknown transaction {missing}");
                    return Ok(vec![]);
                }
                Err(e) => return Err(e),
            }
            if let Some(reason) = self.spend_conflict(&tx, &pending)? {
                warn!("Dropping transaction {txid} from {}: {reason}", data.addr_from);
                return Ok(vec![]);
            }
            self.mempool.add(tx.clone());
        }
        info!(
            "Transaction {txid} added to the memory pool ({} pending)",
            self.mempool.len()
        );

        let mut outbound = vec![];
        if self.config.is_bootstrap() {
            for node in self.nodes.get_nodes() {
                let addr = node.get_addr();
                if addr == self.addr() || addr == data.addr_from {
                    continue;
                }
                outbound.push(Outbound::new(
                    addr,
                    Message::Inv(Inv {
                        addr_from: self.addr().to_string(),
                        op_type: OpType::Tx,
                        items: vec![tx.get_id().to_vec()],
                    }),
                ));
            }
        }

        if let Some(mining_address) = &self.config.mining_address {
            if self.mempool.len() >= self.config.mining_threshold {
                outbound.extend(self.mine_pending(mining_address)?);
            }
        }
        Ok(outbound)
    }

    /// Why `tx` cannot sit in a pool holding `pooled`, if it cannot: one of
    /// its inputs is already claimed by another pooled transaction, or is
    /// neither in the UTXO index nor an output of a pooled transaction.
    fn spend_conflict(&self, tx: &Transaction, pooled: &[Transaction]) -> Result<Option<String>> {
        for input in tx.get_vin() {
            let outpoint = format!("{}:{}", HEXLOWER.encode(input.get_txid()), input.get_vout());
            let claimed = pooled
                .iter()
                .filter(|other| other.get_id() != tx.get_id())
                .flat_map(|other| other.get_vin())
                .any(|other| {
                    other.get_txid() == input.get_txid() && other.get_vout() == input.get_vout()
                });
            if claimed {
                return Ok(Some(format!("{outpoint} is already spent by a pooled transaction")));
            }

            let Some(index) = input.output_index() else {
                return Ok(Some(format!("{outpoint} is not an output")));
            };
            let from_pool = pooled.iter().any(|other| other.get_id() == input.get_txid());
            if !from_pool && !self.utxo_set.is_unspent(input.get_txid(), index)? {
                return Ok(Some(format!("{outpoint} is not unspent")));
            }
        }
        Ok(None)
    }

    // Called with a current index: drops what the chain confirmed or spent.
    fn prune_mempool(&self) -> Result<()> {
        let pending = self.mempool.get_all();
        for tx in &pending {
            if let Some(reason) = self.spend_conflict(tx, &pending)? {
                debug!("Removing pooled transaction {}: {reason}", tx.id_hex());
                self.mempool.remove(&tx.id_hex());
            }
        }
        Ok(())
    }

    /// Mines blocks from the mempool until it drops below the threshold.
    ///
    /// A batch that fails verification is not mined; the offending
    /// transactions are evicted and the loop carries on with what remains.
    pub fn mine_pending(&self, mining_address: &str) -> Result<Vec<Outbound>> {
        let _guard = self.chain_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut outbound = vec![];

        while !self.mempool.is_empty() && self.mempool.len() >= self.config.mining_threshold {
            let pending = self.mempool.get_all();
            let mut txs = pending.clone();
            txs.push(Transaction::new_coinbase_tx(mining_address)?);

            match self.blockchain.mine_block(&txs) {
                Ok(block) => {
                    self.utxo_set.update(&block)?;
                    for tx in &pending {
                        self.mempool.remove(&tx.id_hex());
                    }
                    info!(
                        "New block {} is mined at height {}",
                        block.hash_hex(),
                        block.get_height()
                    );
                    outbound.extend(self.announce_block(&block)?);
                }
                Err(
                    e @ (BlockchainError::InvalidSignature(_)
                    | BlockchainError::UnknownTransaction(_)
                    | BlockchainError::Transaction(_)),
                ) => {
                    warn!("Pending batch rejected: {e}");
                    self.evict_invalid(&pending)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outbound)
    }

    /// Evicts whatever keeps `pending` from being mined: transactions that do
    /// not verify, and any transaction whose input an earlier one in the
    /// batch already spends or the index no longer holds. The whole batch
    /// goes only if nothing specific stands out.
    fn evict_invalid(&self, pending: &[Transaction]) -> Result<()> {
        let batch_ids: HashSet<&[u8]> = pending.iter().map(|tx| tx.get_id()).collect();
        let mut spent: HashSet<(&[u8], i64)> = HashSet::new();
        let mut evicted = 0;

        for tx in pending {
            let reason = if matches!(self.blockchain.verify_transaction(tx, pending), Ok(true)) {
                self.batch_conflict(tx, &batch_ids, &spent)?
            } else {
                Some("it does not verify".to_string())
            };
            match reason {
                Some(reason) => {
                    warn!("Evicting transaction {}: {reason}", tx.id_hex());
                    self.mempool.remove(&tx.id_hex());
                    evicted += 1;
                }
                None => spent.extend(
                    tx.get_vin()
                        .iter()
                        .map(|input| (input.get_txid(), input.get_vout())),
                ),
            }
        }

        if evicted == 0 {
            warn!("Evicting all {} pending transactions", pending.len());
            for tx in pending {
                self.mempool.remove(&tx.id_hex());
            }
        }
        Ok(())
    }

    fn batch_conflict(
        &self,
        tx: &Transaction,
        batch_ids: &HashSet<&[u8]>,
        spent: &HashSet<(&[u8], i64)>,
    ) -> Result<Option<String>> {
        for input in tx.get_vin() {
            let outpoint = format!("{}:{}", HEXLOWER.encode(input.get_txid()), input.get_vout());
            if spent.contains(&(input.get_txid(), input.get_vout())) {
                return Ok(Some(format!("{outpoint} is spent earlier in the batch")));
            }
            if batch_ids.contains(input.get_txid()) {
                continue;
            }
            let unspent = match input.output_index() {
                Some(index) => self.utxo_set.is_unspent(input.get_txid(), index)?,
                None => false,
            };
            if !unspent {
                return Ok(Some(format!("{outpoint} is not unspent")));
            }
        }
        Ok(None)
    }

    // The bootstrap node gets the block itself; every other peer gets an inv.
    fn announce_block(&self, block: &Block) -> Result<Vec<Outbound>> {
        let bootstrap = self.config.bootstrap_address.as_str();
        let mut outbound = vec![];

        if !self.config.is_bootstrap() {
            outbound.push(Outbound::new(
                bootstrap,
                Message::Block(BlockData {
                    addr_from: self.addr().to_string(),
                    block: block.serialize()?,
                }),
            ));
        }
        for node in self.nodes.get_nodes() {
            let addr = node.get_addr();
            if addr == self.addr() || addr == bootstrap {
                continue;
            }
            outbound.push(Outbound::new(
                addr,
                Message::Inv(Inv {
                    addr_from: self.addr().to_string(),
                    op_type: OpType::Block,
                    items: vec![block.get_hash().to_vec()],
                }),
            ));
        }
        Ok(outbound)
    }

    /// Serves connections on `listener` until it fails, one thread per
    /// connection. Handler errors are logged and never stop the loop.
    pub fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Server listening on {}", listener.local_addr()?);
        self.deliver(self.start_messages()?);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self);
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            error!("Error handling connection: {e}");
                        }
                    });
                }
                Err(e) => error!("Error accepting connection: {e}"),
            }
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(self.config.read_timeout()))?;
        let peer_addr = stream.peer_addr()?;
        let bytes = read_envelope(stream)?;
        debug!("Read {} bytes from {peer_addr}", bytes.len());

        let outbound = self.handle_bytes(&bytes)?;
        self.deliver(outbound);
        Ok(())
    }

    fn deliver(&self, outbound: Vec<Outbound>) {
        for Outbound { to, message } in outbound {
            if let Err(e) = send_data(&to, &message, self.config.connect_timeout()) {
                error!("Failed to send {} to {to}: {e}", message.command());
            }
        }
    }
}

/// Sends one message over a fresh connection and closes the write side.
pub fn send_data(addr: &str, message: &Message, timeout: Duration) -> Result<()> {
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("Address {addr} did not resolve")))?;

    debug!("Sending {message} to {addr}");
    let mut stream = TcpStream::connect_timeout(&socket_addr, timeout)
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(&message.encode()?)?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

/// Seeds an empty store with the bootstrap node's genesis block so this node
/// joins the same chain.
///
/// Uses the node's own `listener` for the replies: the bootstrap node is
/// asked for its block hashes, and then for the last of them, the genesis
/// block. The server started on `listener` afterwards syncs the rest.
pub fn join_network(config: &Config, listener: &TcpListener) -> Result<Blockchain> {
    let bootstrap = config.bootstrap_address.as_str();
    let timeout = config.read_timeout();
    info!("Fetching the genesis block from {bootstrap}");

    let get_blocks = Message::GetBlocks(GetBlocks {
        addr_from: config.node_address.clone(),
    });
    send_data(bootstrap, &get_blocks, config.connect_timeout())?;
    let genesis_hash = match receive_message(listener, timeout)? {
        Message::Inv(Inv {
            op_type: OpType::Block,
            mut items,
            ..
        }) => items.pop().ok_or_else(|| {
            BlockchainError::Network(format!("{bootstrap} announced no blocks"))
        })?,
        other => {
            return Err(BlockchainError::Network(format!(
                "Expected a block inventory, got {other}"
            )))
        }
    };

    let get_data = Message::GetData(GetData {
        addr_from: config.node_address.clone(),
        op_type: OpType::Block,
        id: genesis_hash.clone(),
    });
    send_data(bootstrap, &get_data, config.connect_timeout())?;
    let genesis = match receive_message(listener, timeout)? {
        Message::Block(data) => Block::deserialize(&data.block)?,
        other => {
            return Err(BlockchainError::Network(format!(
                "Expected the genesis block, got {other}"
            )))
        }
    };
    if genesis.get_hash() != genesis_hash.as_slice() {
        return Err(BlockchainError::InvalidBlock(format!(
            "{bootstrap} sent block {} instead of {}",
            genesis.hash_hex(),
            HEXLOWER.encode(&genesis_hash)
        )));
    }

    let blockchain = Blockchain::create_from_genesis(&genesis, config.db_path())?;
    info!("Joined the chain with genesis {}", genesis.hash_hex());
    Ok(blockchain)
}

// Waits up to `timeout` for one connection on `listener` and decodes it.
fn receive_message(listener: &TcpListener, timeout: Duration) -> Result<Message> {
    listener.set_nonblocking(true)?;
    let accepted = accept_until(listener, Instant::now() + timeout);
    listener.set_nonblocking(false)?;

    let stream = accepted?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    let bytes = read_envelope(stream)?;
    Message::decode(&bytes)?
        .ok_or_else(|| BlockchainError::Network("Received an unknown command".to_string()))
}

fn accept_until(listener: &TcpListener, deadline: Instant) -> Result<TcpStream> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(BlockchainError::Network(
                        "Timed out waiting for the bootstrap node".to_string(),
                    ));
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Submits `tx` to the node at `addr` for relay and mining.
pub fn send_tx(addr: &str, addr_from: &str, tx: &Transaction, timeout: Duration) -> Result<()> {
    let message = Message::Tx(TxData {
        addr_from: addr_from.to_string(),
        transaction: tx.serialize()?,
    });
    send_data(addr, &message, timeout)
}
