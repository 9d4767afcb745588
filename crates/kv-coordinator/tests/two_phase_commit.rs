//! Full 2PC round trips over real TCP sockets on loopback, exercising the
//! coordinator against live replica servers rather than calling their
//! handlers in-process.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use kv_coordinator::{Config, Coordinator};
use kv_error::Kind;
use kv_net::{Connector, Server};
use kv_replica::{Config as ReplicaConfig, Replica};
use kv_wire::{Message, MessageType};

struct RunningReplica {
    _dir: tempfile::TempDir,
    server: Server,
    port: u16,
}

fn spawn_replica(tpc: bool) -> RunningReplica {
    spawn_replica_with(tpc, ReplicaConfig::default().v_max)
}

fn spawn_replica_with(tpc: bool, v_max: usize) -> RunningReplica {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ReplicaConfig {
        host: "localhost".to_string(),
        port,
        data_dir: dir.path().to_path_buf(),
        tpc,
        v_max,
        ..ReplicaConfig::default()
    };
    let replica = Arc::new(Replica::open(config).unwrap());
    let server = Server::start(listener, 2, move |mut stream| {
        if let Ok(req) = kv_wire::read_message(&mut stream) {
            let resp = replica.handle(&req);
            let _ = kv_wire::write_message(&mut stream, &resp);
        }
    });
    RunningReplica { _dir: dir, server, port }
}

#[test]
fn two_phase_commit_succeeds_when_all_replicas_vote_commit() {
    let r1 = spawn_replica(true);
    let r2 = spawn_replica(true);

    let config = Config {
        slave_capacity: 2,
        redundancy: 2,
        ..Config::default()
    };
    let coordinator = Coordinator::new(config);
    coordinator.registry().register("localhost", r1.port).unwrap();
    coordinator.registry().register("localhost", r2.port).unwrap();

    let resp = coordinator.handle(&Message::new(MessageType::PutReq).with_key("k").with_value("v"));
    assert!(resp.is_success());

    let resp = coordinator.handle(&Message::new(MessageType::GetReq).with_key("k"));
    assert_eq!(resp.value.as_deref(), Some("v"));

    r1.server.shutdown();
    r2.server.shutdown();
}

#[test]
fn two_phase_commit_aborts_on_oversize_value() {
    let replica = spawn_replica_with(true, 4);

    let config = Config {
        slave_capacity: 1,
        redundancy: 1,
        ..Config::default()
    };
    let coordinator = Coordinator::new(config);
    coordinator.registry().register("localhost", replica.port).unwrap();

    let resp = coordinator.handle(
        &Message::new(MessageType::PutReq)
            .with_key("k")
            .with_value("too long for the cap"),
    );
    assert!(!resp.is_success());

    let resp = coordinator.handle(&Message::new(MessageType::GetReq).with_key("k"));
    assert_eq!(resp.message.as_deref(), Some(Kind::NoKey.wire_message()));

    replica.server.shutdown();
}

#[test]
fn get_falls_through_to_successor_when_primary_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let live = spawn_replica(false);

    let config = Config {
        slave_capacity: 2,
        redundancy: 2,
        connect_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let coordinator = Coordinator::new(config);
    coordinator.registry().register("localhost", dead_port).unwrap();
    coordinator.registry().register("localhost", live.port).unwrap();

    // Seed the value directly on the reachable replica, standing in for
    // "a prior successful PUT the dead primary also held".
    let seed = Message::new(MessageType::PutReq).with_key("k").with_value("v");
    let response = Connector::default().round_trip("localhost", live.port, &seed).unwrap();
    assert!(response.is_success());

    let resp = coordinator.handle(&Message::new(MessageType::GetReq).with_key("k"));
    assert_eq!(resp.value.as_deref(), Some("v"));

    live.server.shutdown();
}

#[test]
fn register_is_idempotent_over_the_wire() {
    let config = Config {
        slave_capacity: 1,
        ..Config::default()
    };
    let coordinator = Coordinator::new(config);

    let register = Message::new(MessageType::Register).with_key("localhost").with_value("9000");
    assert!(coordinator.handle(&register).is_success());
    assert!(coordinator.handle(&register).is_success());
    assert_eq!(coordinator.registry().len(), 1);
}
