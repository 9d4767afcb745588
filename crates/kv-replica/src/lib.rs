//! Replica server: composes a persistent [`kv_store::Store`], a
//! [`kv_cache::Cache`], and a [`kv_txlog::TxLog`] into request handlers for
//! both the direct (non-TPC) path and the two-phase-commit participant
//! path.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use kv_cache::Cache;
use kv_error::{Error, Kind};
use kv_store::Store;
use kv_txlog::{LogType, TxLog};
use kv_wire::{Message, MessageType};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub k_max: usize,
    pub v_max: usize,
    pub cache_sets: usize,
    pub cache_set_capacity: usize,
    /// Whether this replica participates in two-phase commit (PUT/DEL
    /// arrive as votes rather than direct mutations).
    pub tpc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 9000,
            data_dir: PathBuf::from("./data/slave-9000"),
            k_max: kv_store::DEFAULT_K_MAX,
            v_max: kv_store::DEFAULT_V_MAX,
            cache_sets: 4,
            cache_set_capacity: 4,
            tpc: false,
        }
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Put(String),
    Del,
}

#[derive(Debug, Clone)]
struct PendingTxn {
    key: String,
    op: PendingOp,
}

#[derive(Debug, Clone, Default)]
enum TxnState {
    #[default]
    Init,
    Ready(PendingTxn),
    AbortPending,
}

pub struct Replica {
    config: Config,
    store: Store,
    cache: Cache,
    log: TxLog,
    txn: Mutex<TxnState>,
}

impl Replica {
    /// Opens the replica's store and log under `config.data_dir` and, for
    /// a TPC replica, replays the log to recover the last in-flight
    /// transaction.
    pub fn open(config: Config) -> Result<Self, Error> {
        let store = Store::open(config.data_dir.join("store"), config.k_max, config.v_max)?;
        let log = TxLog::open(config.data_dir.join("log"))?;
        let cache = Cache::new(config.cache_sets, config.cache_set_capacity);

        let replica = Replica {
            config,
            store,
            cache,
            log,
            txn: Mutex::new(TxnState::Init),
        };
        if replica.config.tpc {
            replica.recover()?;
        }
        Ok(replica)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dispatches one request to the appropriate handler.
    pub fn handle(&self, msg: &Message) -> Message {
        match msg.kind {
            MessageType::GetReq => self.handle_get(msg),
            MessageType::Info => self.handle_info(),
            MessageType::PutReq | MessageType::DelReq if self.config.tpc => {
                self.handle_vote_request(msg)
            }
            MessageType::PutReq | MessageType::DelReq => self.handle_direct_mutation(msg),
            MessageType::Commit => self.handle_commit(),
            MessageType::Abort => self.handle_abort(),
            _ => Message::error_response(&Error::from(Kind::NotImplemented)),
        }
    }

    // -- direct (non-TPC) path ------------------------------------------

    fn handle_get(&self, msg: &Message) -> Message {
        let Some(key) = msg.key.as_deref() else {
            return Message::error_response(&Error::from(Kind::InvalidRequest));
        };
        match self.get(key) {
            Ok(Some(value)) => Message::new(MessageType::GetResp).with_value(value),
            Ok(None) => Message::new(MessageType::GetResp).with_message(Kind::NoKey.wire_message()),
            Err(e) => Message::error_response(&e),
        }
    }

    fn handle_direct_mutation(&self, msg: &Message) -> Message {
        let Some(key) = msg.key.as_deref() else {
            return Message::error_response(&Error::from(Kind::InvalidRequest));
        };
        match msg.kind {
            MessageType::PutReq => {
                let Some(value) = msg.value.as_deref() else {
                    return Message::error_response(&Error::from(Kind::InvalidRequest));
                };
                match self.put(key, value) {
                    Ok(()) => Message::success(),
                    Err(e) => Message::error_response(&e),
                }
            }
            MessageType::DelReq => match self.del(key) {
                Ok(true) => Message::success(),
                Ok(false) => Message::error_response(&Error::from(Kind::NoKey)),
                Err(e) => Message::error_response(&e),
            },
            _ => unreachable!("handle_direct_mutation only called for PUTREQ/DELREQ"),
        }
    }

    fn handle_info(&self) -> Message {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Message::new(MessageType::Info).with_message(format!(
            "{}:{} at {}",
            self.config.host, self.config.port, now
        ))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, Error> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }
        match self.store.get(key)? {
            Some(value) => {
                self.cache.put(key, &value);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write-through PUT: the cache is updated first, then the store; on
    /// a store failure the cache is rolled back to its pre-PUT state so
    /// it is never a strict superset of the store.
    pub fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        let previous = self.cache.get(key);
        self.cache.put(key, value);
        if let Err(e) = self.store.put(key, value) {
            match previous {
                Some(old) => self.cache.put(key, &old),
                None => {
                    self.cache.del(key);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn del(&self, key: &str) -> Result<bool, Error> {
        self.cache.del(key);
        self.store.del(key)
    }

    // -- TPC participant path --------------------------------------------

    fn handle_vote_request(&self, msg: &Message) -> Message {
        let mut state = self.txn.lock().unwrap();
        if !matches!(*state, TxnState::Init) {
            tracing::warn!("vote request received with a transaction already in flight");
            return Message::error_response(&Error::from(Kind::InvalidMessage));
        }

        let Some(key) = msg.key.as_deref() else {
            *state = TxnState::AbortPending;
            return Message::new(MessageType::VoteAbort);
        };

        let (validity, op) = match msg.kind {
            MessageType::PutReq => {
                let Some(value) = msg.value.as_deref() else {
                    return self.vote_abort(&mut state);
                };
                (self.store.check_put(key, value).is_ok(), Some(PendingOp::Put(value.to_string())))
            }
            MessageType::DelReq => {
                let exists = self.store.check_key(key).is_ok() && self.store.haskey(key).unwrap_or(false);
                (exists, Some(PendingOp::Del))
            }
            _ => unreachable!("handle_vote_request only called for PUTREQ/DELREQ"),
        };

        if !validity {
            return self.vote_abort(&mut state);
        }
        let op = op.unwrap();

        let logged = match &op {
            PendingOp::Put(value) => self.log.log_put(key, value),
            PendingOp::Del => self.log.log_del(key),
        };
        if let Err(e) = logged {
            tracing::error!(error = %e, "failed to log vote request");
            return self.vote_abort(&mut state);
        }

        *state = TxnState::Ready(PendingTxn {
            key: key.to_string(),
            op,
        });
        Message::new(MessageType::VoteCommit)
    }

    fn vote_abort(&self, state: &mut TxnState) -> Message {
        *state = TxnState::AbortPending;
        Message::new(MessageType::VoteAbort)
    }

    fn handle_commit(&self) -> Message {
        let mut state = self.txn.lock().unwrap();
        match std::mem::take(&mut *state) {
            TxnState::Ready(pending) => {
                if let Err(e) = self.apply(&pending) {
                    tracing::error!(error = %e, key = %pending.key, "failed to apply committed transaction");
                }
                if let Err(e) = self.log.log_commit() {
                    tracing::error!(error = %e, "failed to log commit");
                }
                Message::new(MessageType::Ack)
            }
            other => {
                *state = other;
                Message::error_response(&Error::from(Kind::InvalidMessage))
            }
        }
    }

    fn handle_abort(&self) -> Message {
        let mut state = self.txn.lock().unwrap();
        match std::mem::take(&mut *state) {
            TxnState::Ready(_) | TxnState::AbortPending => {
                if let Err(e) = self.log.log_abort() {
                    tracing::error!(error = %e, "failed to log abort");
                }
                Message::new(MessageType::Ack)
            }
            other => {
                *state = other;
                Message::error_response(&Error::from(Kind::InvalidMessage))
            }
        }
    }

    fn apply(&self, pending: &PendingTxn) -> Result<(), Error> {
        match &pending.op {
            PendingOp::Put(value) => {
                self.cache.put(&pending.key, value);
                self.store.put(&pending.key, value)
            }
            PendingOp::Del => {
                self.cache.del(&pending.key);
                self.store.del(&pending.key).map(|_| ())
            }
        }
    }

    /// Replays the log oldest-to-newest, applying a committed tail
    /// transaction idempotently, discarding an aborted one, or restoring
    /// `READY` for one left with no terminal record.
    fn recover(&self) -> Result<(), Error> {
        let entries = self.log.entries()?;

        let mut tail = None;
        let mut terminal = None;
        for entry in &entries {
            match entry.kind {
                LogType::Put | LogType::Del => {
                    tail = Some(entry);
                    terminal = None;
                }
                LogType::Commit | LogType::Abort => terminal = Some(entry.kind),
            }
        }

        match (tail, terminal) {
            (Some(entry), Some(LogType::Commit)) => {
                match entry.kind {
                    LogType::Put => {
                        self.store
                            .put(entry.key.as_deref().unwrap(), entry.value.as_deref().unwrap())?;
                    }
                    LogType::Del => {
                        self.store.del(entry.key.as_deref().unwrap())?;
                    }
                    LogType::Commit | LogType::Abort => unreachable!(),
                }
                self.log.clear()?;
            }
            (Some(_), Some(LogType::Abort)) => {
                self.log.clear()?;
            }
            (Some(entry), None) => {
                let pending = match entry.kind {
                    LogType::Put => PendingTxn {
                        key: entry.key.clone().unwrap(),
                        op: PendingOp::Put(entry.value.clone().unwrap()),
                    },
                    LogType::Del => PendingTxn {
                        key: entry.key.clone().unwrap(),
                        op: PendingOp::Del,
                    },
                    LogType::Commit | LogType::Abort => unreachable!(),
                };
                *self.txn.lock().unwrap() = TxnState::Ready(pending);
            }
            (None, _) => {}
        }
        Ok(())
    }
}
