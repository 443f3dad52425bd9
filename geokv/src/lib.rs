//! `geokv` is a geo-replicated transactional key-value store. Clients run
//! multi-key ACID transactions over (table, key) tuples: a transaction
//! manager assigns each transaction a globally-ordered identifier, replicates
//! every step of its lifecycle through the paxos group that hosts it, and
//! commits by taking replicated per-key locks, writing versioned values
//! durably at a commit timestamp, and disseminating the outcome before the
//! client hears a definitive answer. Conflicts resolve by wound-wait: older
//! transactions abort younger lock holders, so there are no deadlocks.
//!
//! The crate is the daemon-independent core. `storage` and `datalayer` hold
//! the multi-version durable layout; `lock_manager` and the `replicator`
//! modules run one partition's locking and quorum replication; `txman` holds
//! the transaction state machine and its group log; `kvs` and `txman`
//! daemons dispatch wire messages into all of the above; `client` drives the
//! protocol from the other end. The binaries in `geokv-server` own sockets,
//! threads and clocks; nothing in here blocks on I/O.

pub mod client;
pub mod config;
pub mod datalayer;
pub mod encoding;
pub mod error;
pub mod ids;
pub mod kvs;
pub mod lock_manager;
pub mod migrate;
pub mod replicator;
pub mod state_table;
pub mod storage;
pub mod txman;
pub mod wire;
