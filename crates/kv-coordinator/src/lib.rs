//! Coordinator ("master"): fields client requests, locates replicas by
//! consistent hashing, drives two-phase commit for PUT/DEL, and maintains
//! its own read-through cache in front of the replica set.

pub mod registry;

use std::time::Duration;

use kv_cache::Cache;
use kv_error::{Error, Kind};
use kv_net::Connector;
use kv_wire::{Message, MessageType};

pub use registry::{Registry, SlaveHandle};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub slave_capacity: usize,
    pub redundancy: usize,
    pub cache_sets: usize,
    pub cache_set_capacity: usize,
    pub connect_timeout: Duration,
    /// Delay between phase-2 decision retries to an unresponsive replica.
    pub retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 8888,
            slave_capacity: 2,
            redundancy: 2,
            cache_sets: 4,
            cache_set_capacity: 4,
            connect_timeout: kv_net::DEFAULT_TIMEOUT,
            retry_interval: Duration::from_millis(200),
        }
    }
}

/// Hook hit at phase-1 unreachability and at the phase-1/phase-2 barrier;
/// the default implementation just logs, tests can supply their own to
/// observe the driver's progress.
pub trait Observer: Send + Sync {
    fn on_unreachable(&self, _slave: &SlaveHandle) {}
    fn on_phase_transition(&self) {}
}

pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_unreachable(&self, slave: &SlaveHandle) {
        tracing::warn!(id = slave.id, host = %slave.host, port = slave.port, "replica unreachable in phase 1");
    }

    fn on_phase_transition(&self) {
        tracing::debug!("2pc phase 1 complete, deciding");
    }
}

pub struct Coordinator {
    config: Config,
    registry: Registry,
    cache: Cache,
    connector: Connector,
    observer: Box<dyn Observer>,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(config.slave_capacity);
        let cache = Cache::new(config.cache_sets, config.cache_set_capacity);
        let connector = Connector::new(config.connect_timeout);
        Coordinator {
            config,
            registry,
            cache,
            connector,
            observer: Box::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn handle(&self, msg: &Message) -> Message {
        match msg.kind {
            MessageType::Register => self.handle_register(msg),
            MessageType::GetReq => self.handle_get(msg),
            MessageType::PutReq | MessageType::DelReq => self.two_phase_commit(msg),
            _ => Message::error_response(&Error::from(Kind::NotImplemented)),
        }
    }

    fn handle_register(&self, msg: &Message) -> Message {
        let Some(key) = msg.key.as_deref() else {
            return Message::error_response(&Error::from(Kind::InvalidRequest));
        };
        let Some(port) = msg.value.as_deref().and_then(|v| v.parse::<u16>().ok()) else {
            return Message::error_response(&Error::from(Kind::InvalidRequest));
        };
        match self.registry.register(key, port) {
            Ok(_id) => Message::success(),
            Err(e) => Message::error_response(&e),
        }
    }

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

    /// Cache hit returns immediately; a miss forwards to the primary and
    /// then successors in order (up to `redundancy` replicas), filling
    /// the master cache from the first successful response.
    pub fn get(&self, key: &str) -> Result<Option<String>, Error> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        let replicas = self.registry.replicas_for(key, self.config.redundancy);
        let request = Message::new(MessageType::GetReq).with_key(key);

        for replica in &replicas {
            match self.connector.round_trip(&replica.host, replica.port, &request) {
                Ok(resp) if resp.value.is_some() => {
                    let value = resp.value.unwrap();
                    self.cache.put(key, &value);
                    return Ok(Some(value));
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(peer = %replica.host, port = replica.port, error = %e, "get forward failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Drives a full 2PC round for a PUTREQ/DELREQ: phase-1 voting across
    /// every replica of the key, a strict-quorum decision, and phase-2
    /// delivery retried until every reached replica acknowledges.
    fn two_phase_commit(&self, request: &Message) -> Message {
        let Some(key) = request.key.as_deref() else {
            return Message::error_response(&Error::from(Kind::InvalidRequest));
        };

        let replicas = self.registry.replicas_for(key, self.config.redundancy);
        if replicas.is_empty() {
            return Message::error_response(&Error::from(Kind::Generic));
        }

        let mut reached = Vec::with_capacity(replicas.len());
        let mut strict_quorum = true;

        for replica in &replicas {
            match self.connector.round_trip(&replica.host, replica.port, request) {
                Ok(resp) if resp.kind == MessageType::VoteCommit => {
                    reached.push(replica.clone());
                }
                Ok(_) => {
                    // VOTE_ABORT or any unexpected reply from a reached replica.
                    reached.push(replica.clone());
                    strict_quorum = false;
                }
                Err(_) => {
                    // A missing connection counts as VOTE_ABORT and the
                    // replica never received phase 1, so it is not owed
                    // a phase-2 decision.
                    strict_quorum = false;
                    self.observer.on_unreachable(replica);
                }
            }
        }

        self.observer.on_phase_transition();

        let decision = if strict_quorum {
            MessageType::Commit
        } else {
            MessageType::Abort
        };
        let decision_msg = Message::new(decision);

        for replica in &reached {
            loop {
                match self.connector.round_trip(&replica.host, replica.port, &decision_msg) {
                    Ok(resp) if resp.kind == MessageType::Ack => break,
                    _ => {
                        tracing::warn!(peer = %replica.host, port = replica.port, "retrying phase 2 decision");
                        std::thread::sleep(self.config.retry_interval);
                    }
                }
            }
        }

        if strict_quorum {
            match request.kind {
                MessageType::PutReq => {
                    self.cache.put(key, request.value.as_deref().unwrap_or_default());
                }
                MessageType::DelReq => {
                    self.cache.del(key);
                }
                _ => {}
            }
            Message::success()
        } else {
            Message::error_response(&Error::from(Kind::Generic))
        }
    }
}

