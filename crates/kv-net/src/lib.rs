//! TCP acceptor and client-side connector for the wire protocol.
//!
//! [`Server`] decouples accepting connections from servicing them: one
//! acceptor thread pushes accepted sockets onto a [`kv_workqueue::WorkQueue`],
//! and a fixed pool of worker threads pops and services them. [`Connector`]
//! is the inverse: a bounded-timeout dial used by a coordinator reaching out
//! to a replica.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kv_error::Error;
use kv_wire::Message;
use kv_workqueue::WorkQueue;

/// Default connect/round-trip timeout, matching the design's `T_CONNECT`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the acceptor thread and worker pool for one listening socket.
pub struct Server {
    queue: Arc<WorkQueue<TcpStream>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Spawns `max_threads` workers invoking `handler` for each accepted
    /// connection, plus a detached acceptor thread feeding the queue.
    pub fn start<H>(listener: TcpListener, max_threads: usize, handler: H) -> Self
    where
        H: Fn(TcpStream) + Send + Sync + 'static,
    {
        let queue = Arc::new(WorkQueue::new());
        let handler = Arc::new(handler);

        let workers = (0..max_threads)
            .map(|_| {
                let queue = queue.clone();
                let handler = handler.clone();
                thread::spawn(move || {
                    while let Some(stream) = queue.pop() {
                        handler(stream);
                    }
                })
            })
            .collect();

        {
            let queue = queue.clone();
            thread::spawn(move || {
                for conn in listener.incoming() {
                    match conn {
                        Ok(stream) => queue.push(stream),
                        Err(error) => {
                            tracing::warn!(%error, "accept failed");
                        }
                    }
                }
            });
        }

        Server { queue, workers }
    }

    /// Stops accepting new work for existing workers and waits for the
    /// pool to drain. The acceptor thread itself is not joined: it blocks
    /// forever in `accept()` once the process is done serving.
    pub fn shutdown(self) {
        self.queue.close();
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

/// A thin client-side dial helper with a bounded connect timeout.
#[derive(Debug, Clone, Copy)]
pub struct Connector {
    timeout: Duration,
}

impl Connector {
    pub fn new(timeout: Duration) -> Self {
        Connector { timeout }
    }

    pub fn dial(&self, host: &str, port: u16) -> Result<TcpStream, Error> {
        let peer = format!("{host}:{port}");
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| Error::Connect {
                peer: peer.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| Error::Connect {
                peer: peer.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(|source| Error::Connect {
            peer: peer.clone(),
            source,
        })?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|source| Error::Connect { peer: peer.clone(), source })?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|source| Error::Connect { peer, source })?;
        Ok(stream)
    }

    /// Opens a connection, writes one framed request, and reads one
    /// framed response. Mirrors the open/send-one/read-one round trip of
    /// a journal client's single-shot append.
    pub fn round_trip(&self, host: &str, port: u16, request: &Message) -> Result<Message, Error> {
        let mut stream = self.dial(host, port)?;
        kv_wire::write_message(&mut stream, request)?;
        kv_wire::read_message(&mut stream)
    }
}

impl Default for Connector {
    fn default() -> Self {
        Connector::new(DEFAULT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_wire::MessageType;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn server_dispatches_accepted_connections_to_workers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        let server = Server::start(listener, 2, move |mut stream| {
            let mut buf = [0u8; 5];
            if stream.read_exact(&mut buf).is_ok() {
                let _ = tx.send(buf);
            }
        });

        let mut client = TcpStream::connect(addr).unwrap();
        use std::io::Write;
        client.write_all(b"hello").unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&received, b"hello");

        server.shutdown();
    }

    #[test]
    fn connector_round_trips_a_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::start(listener, 1, move |mut stream| {
            let req = kv_wire::read_message(&mut stream).unwrap();
            assert_eq!(req.kind, MessageType::GetReq);
            kv_wire::write_message(&mut stream, &Message::success()).unwrap();
        });

        let connector = Connector::new(Duration::from_secs(1));
        let request = Message::new(MessageType::GetReq).with_key("k");
        let response = connector
            .round_trip(&addr.ip().to_string(), addr.port(), &request)
            .unwrap();
        assert!(response.is_success());

        server.shutdown();
    }

    #[test]
    fn dial_to_a_closed_port_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = Connector::new(Duration::from_millis(200));
        let err = connector.dial(&addr.ip().to_string(), addr.port());
        assert!(err.is_err());
    }
}
