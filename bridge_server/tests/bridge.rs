//! End-to-end tests over real sockets, speaking the wire protocol directly.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use mtbridge_common::net::{Endpoint, Stream};
use mtbridge_common::wire::{
    FrameReader, Notification, Operation, Reply, RequestFrame, ServerFrame, write_frame,
};
use mtbridge_common::{
    Arg, BridgeError, Command, EngineEvent, Quote, Response, ResponseValue, SessionHandle,
};
use mtbridge_server::model::executor::EngineWaker;
use mtbridge_server::{BridgeServer, EngineAdapter, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

fn loopback_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        local_channel: false,
        network_interfaces: false,
        idle_teardown: Duration::from_millis(100),
        command_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

/// Engine stand-in: answers every command of its sessions through the adapter.
fn start_engine(config: ServerConfig) -> Arc<EngineAdapter> {
    let (wake_tx, wake_rx) = unbounded::<SessionHandle>();
    let waker: Arc<dyn EngineWaker> = Arc::new(wake_tx);
    let adapter = Arc::new(EngineAdapter::new(config, waker));
    let engine = Arc::downgrade(&adapter);
    thread::spawn(move || {
        for handle in wake_rx.iter() {
            let Some(adapter) = engine.upgrade() else {
                break;
            };
            while let Ok(command_type) = adapter.get_command_type(handle) {
                if command_type == 0 {
                    break;
                }
                let response = match command_type {
                    17 => Response::ok(ResponseValue::Double(1.2345)),
                    // Echoes its first argument.
                    1 => match adapter.get_command_parameter(handle, 0) {
                        Ok(Some(Arg::Int(v))) => Response::ok(ResponseValue::Int(v)),
                        _ => Response::error(4051, "invalid parameter"),
                    },
                    _ => Response::error(4014, "unknown command"),
                };
                if adapter.send_response(handle, response).is_err() {
                    break;
                }
            }
        }
    });
    adapter
}

fn server_addr(adapter: &EngineAdapter) -> SocketAddr {
    let server = adapter.server(0).unwrap().unwrap();
    server.tcp_addrs().unwrap()[0]
}

struct RawClient {
    writer: Stream,
    frames: Receiver<ServerFrame>,
    early: Vec<(u64, Reply)>,
    next_id: u64,
}

impl RawClient {
    fn open(endpoint: &Endpoint) -> RawClient {
        let stream = Stream::connect(endpoint, WAIT).unwrap();
        let writer = stream.try_clone().unwrap();
        let (tx, rx) = unbounded();
        thread::spawn(move || {
            let mut reader = FrameReader::new(stream);
            while let Ok(Some(frame)) = reader.read::<ServerFrame>() {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        RawClient {
            writer,
            frames: rx,
            early: Vec::new(),
            next_id: 0,
        }
    }

    fn tcp(addr: SocketAddr) -> RawClient {
        RawClient::open(&Endpoint::tcp(&addr.ip().to_string(), addr.port()))
    }

    fn send(&mut self, op: Operation) -> u64 {
        self.next_id += 1;
        write_frame(&mut self.writer, &RequestFrame { id: self.next_id, op }).unwrap();
        self.next_id
    }

    /// Reply to `id`; replies to other requests are kept for later.
    fn reply(&mut self, id: u64) -> Reply {
        if let Some(pos) = self.early.iter().position(|(got, _)| *got == id) {
            return self.early.remove(pos).1;
        }
        loop {
            match self.frames.recv_timeout(WAIT).unwrap() {
                ServerFrame::Reply { id: got, reply } if got == id => return reply,
                ServerFrame::Reply { id: got, reply } => self.early.push((got, reply)),
                ServerFrame::Notify(_) => continue,
            }
        }
    }

    fn call(&mut self, op: Operation) -> Reply {
        let id = self.send(op);
        self.reply(id)
    }

    fn connect(&mut self, sessions: Vec<SessionHandle>) {
        assert_eq!(
            self.call(Operation::Connect { sessions }),
            Reply::Connected(true)
        );
    }

    fn next_notification(&self) -> Notification {
        loop {
            if let ServerFrame::Notify(n) = self.frames.recv_timeout(WAIT).unwrap() {
                return n;
            }
        }
    }
}

#[test]
fn command_reaches_its_session_and_returns_the_engine_value() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(7, 0, "EURUSD", 1.2345, 1.2347, false).unwrap();
    let mut client = RawClient::tcp(server_addr(&adapter));
    client.connect(vec![7]);

    let command = Command::new(17, vec!["EURUSD".into(), 1i32.into()], 7);
    match client.call(Operation::SendCommand(command)) {
        Reply::Command(response) => assert_eq!(response.into_result::<f64>().unwrap(), 1.2345),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn unknown_session_fails_at_once() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(1, 0, "EURUSD", 1.1, 1.2, false).unwrap();
    let mut client = RawClient::tcp(server_addr(&adapter));
    client.connect(vec![]);

    let started = Instant::now();
    let reply = client.call(Operation::SendCommand(Command::new(17, vec![], 99)));
    assert!(started.elapsed() < Duration::from_secs(1));
    let Reply::Fault(fault) = reply else {
        panic!("expected a fault, got {reply:?}");
    };
    let err = BridgeError::from(fault);
    assert!(err.is_connection());
    assert!(matches!(err, BridgeError::SessionNotFound(99)));
}

#[test]
fn engine_error_code_travels_back() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(2, 0, "EURUSD", 1.1, 1.2, false).unwrap();
    let mut client = RawClient::tcp(server_addr(&adapter));
    client.connect(vec![2]);

    let reply = client.call(Operation::SendCommand(Command::new(99, vec![], 2)));
    let Reply::Command(response) = reply else {
        panic!("unexpected {reply:?}");
    };
    assert_eq!(response.into_result::<()>().unwrap_err().engine_code(), Some(4014));
}

#[test]
fn commands_of_one_session_complete_in_order() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(4, 0, "EURUSD", 1.1, 1.2, false).unwrap();
    let mut client = RawClient::tcp(server_addr(&adapter));
    client.connect(vec![4]);

    let sent: Vec<(u64, i32)> = (10..15)
        .map(|value| {
            let command = Command::new(1, vec![Arg::Int(value)], 4);
            (client.send(Operation::SendCommand(command)), value)
        })
        .collect();
    for (id, value) in sent {
        match client.reply(id) {
            Reply::Command(response) => {
                assert_eq!(response.into_result::<i32>().unwrap(), value)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn reserved_op_code_does_not_block_the_session() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(7, 0, "EURUSD", 1.2345, 1.2347, false).unwrap();
    let mut client = RawClient::tcp(server_addr(&adapter));
    client.connect(vec![7]);

    let started = Instant::now();
    let idle = client.send(Operation::SendCommand(Command::new(0, vec![], 7)));
    let real = client.send(Operation::SendCommand(Command::new(17, vec![], 7)));

    let Reply::Fault(fault) = client.reply(idle) else {
        panic!("expected a fault");
    };
    assert!(BridgeError::from(fault).is_protocol());
    match client.reply(real) {
        Reply::Command(response) => assert_eq!(response.into_result::<f64>().unwrap(), 1.2345),
        other => panic!("unexpected {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn three_subscribers_see_quotes_in_emission_order() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(1, 0, "EURUSD", 1.0, 1.1, false).unwrap();
    let addr = server_addr(&adapter);
    let mut clients: Vec<RawClient> = (0..3).map(|_| RawClient::tcp(addr)).collect();
    for client in &mut clients {
        client.connect(vec![]);
    }

    let bids = [1.1, 1.2, 1.3, 1.4];
    for bid in bids {
        adapter.update_quote(1, "EURUSD", bid, bid + 0.0002).unwrap();
    }
    for client in &clients {
        let received: Vec<f64> = (0..bids.len())
            .map(|_| match client.next_notification() {
                Notification::QuoteUpdate(q) => q.bid,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(received, bids);
    }
}

#[test]
fn engine_events_reach_bound_clients_only() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(1, 0, "EURUSD", 1.0, 1.1, false).unwrap();
    adapter.init_expert(2, 0, "GBPUSD", 1.3, 1.4, false).unwrap();
    let addr = server_addr(&adapter);
    let mut bound = RawClient::tcp(addr);
    bound.connect(vec![1]);
    let mut other = RawClient::tcp(addr);
    other.connect(vec![2]);

    adapter.send_event(1, 1, r#"{"Symbol":"EURUSD"}"#).unwrap();
    adapter.update_quote(1, "EURUSD", 1.01, 1.11).unwrap();

    assert_eq!(
        bound.next_notification(),
        Notification::EngineEvent(EngineEvent {
            event_type: 1,
            payload: r#"{"Symbol":"EURUSD"}"#.into(),
            expert_handle: 1,
        })
    );
    // The quote update is the first thing the other client sees.
    assert!(matches!(other.next_notification(), Notification::QuoteUpdate(_)));
}

#[test]
fn sessions_are_announced_and_listed() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(1, 0, "EURUSD", 1.0, 1.1, false).unwrap();
    let mut client = RawClient::tcp(server_addr(&adapter));
    client.connect(vec![]);

    adapter.init_expert(2, 0, "GBPUSD", 1.3, 1.4, false).unwrap();
    assert_eq!(
        client.next_notification(),
        Notification::QuoteAdded(Quote::new("GBPUSD", 1.3, 1.4, 2))
    );
    match client.call(Operation::GetQuotes) {
        Reply::Quotes(quotes) => {
            let handles: Vec<SessionHandle> = quotes.iter().map(|q| q.expert_handle).collect();
            assert_eq!(handles, vec![1, 2]);
        }
        other => panic!("unexpected {other:?}"),
    }

    adapter.deinit_expert(2).unwrap();
    assert_eq!(
        client.next_notification(),
        Notification::QuoteRemoved(Quote::new("GBPUSD", 1.3, 1.4, 2))
    );
}

#[test]
fn idle_teardown_tells_clients_before_closing() {
    let adapter = start_engine(loopback_config());
    adapter.init_expert(1, 0, "EURUSD", 1.0, 1.1, false).unwrap();
    let server: Arc<BridgeServer> = adapter.server(0).unwrap().unwrap();
    let mut client = RawClient::tcp(server.tcp_addrs().unwrap()[0]);
    client.connect(vec![]);

    adapter.deinit_expert(1).unwrap();
    assert!(matches!(client.next_notification(), Notification::QuoteRemoved(_)));
    assert_eq!(client.next_notification(), Notification::ServerStopped);
    assert!(server.stopped().recv_timeout(WAIT).is_err());
    assert!(server.is_stopped());
}

#[test]
fn malformed_frame_does_not_end_the_connection() {
    use std::io::Write;

    let adapter = start_engine(loopback_config());
    adapter.init_expert(1, 0, "EURUSD", 1.0, 1.1, false).unwrap();
    let mut client = RawClient::tcp(server_addr(&adapter));
    client.writer.write_all(b"{not json}\n").unwrap();
    client.connect(vec![]);
}

#[cfg(unix)]
#[test]
fn local_channel_serves_the_same_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        port: 9311,
        runtime_dir: dir.path().to_path_buf(),
        local_channel: true,
        loopback: false,
        ..loopback_config()
    };
    let adapter = start_engine(config);
    adapter.init_expert(7, 9311, "EURUSD", 1.2345, 1.2347, false).unwrap();
    let path = adapter.server(9311).unwrap().unwrap().local_path().unwrap().unwrap();
    assert_eq!(path, dir.path().join("mtbridge_9311.sock"));

    let mut client = RawClient::open(&Endpoint::Local { path });
    client.connect(vec![7]);
    let mut named = BTreeMap::new();
    named.insert("Comment".to_string(), "local".into());
    let command = Command::new(17, vec!["EURUSD".into()], 7).with_named(named);
    match client.call(Operation::SendCommand(command)) {
        Reply::Command(response) => assert_eq!(response.into_result::<f64>().unwrap(), 1.2345),
        other => panic!("unexpected {other:?}"),
    }
}
