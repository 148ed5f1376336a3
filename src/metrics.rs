//! Process counters exposed as Prometheus text (spec §2's per-component
//! shares translate naturally into named counters/gauges). Served by a
//! tiny hand-rolled HTTP responder rather than a framework — the one
//! ambient surface the teacher itself serves without routing
//! middleware (`proxy`'s `http::health_server`).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{info, warn};

pub struct Metrics {
    registry: Registry,
    pub connections_accepted: IntCounter,
    pub connections_closed: IntCounter,
    pub connections_denied: IntCounter,
    pub connections_blacklisted: IntCounter,
    pub connections_auto_blacklisted: IntCounter,
    pub bytes_sent: IntCounter,
    pub bytes_received: IntCounter,
    pub live_connections: IntGauge,
    pub event_loop_registrations: IntGauge,
    pub analyzer_faults: IntCounter,
    pub db_reconnects: IntCounter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        macro_rules! counter {
            ($name:literal, $help:literal) => {{
                let c = IntCounter::new($name, $help).unwrap();
                registry.register(Box::new(c.clone())).unwrap();
                c
            }};
        }
        macro_rules! gauge {
            ($name:literal, $help:literal) => {{
                let g = IntGauge::new($name, $help).unwrap();
                registry.register(Box::new(g.clone())).unwrap();
                g
            }};
        }

        Arc::new(Metrics {
            connections_accepted: counter!("tcp_proxy_connections_accepted_total", "accepted client connections"),
            connections_closed: counter!("tcp_proxy_connections_closed_total", "closed connections"),
            connections_denied: counter!("tcp_proxy_connections_denied_total", "connections refused by policy"),
            connections_blacklisted: counter!("tcp_proxy_connections_blacklisted_total", "connections refused, persistent blocklist"),
            connections_auto_blacklisted: counter!("tcp_proxy_connections_auto_blacklisted_total", "connections refused, in-memory auto blocklist"),
            bytes_sent: counter!("tcp_proxy_bytes_sent_total", "bytes relayed client to backend"),
            bytes_received: counter!("tcp_proxy_bytes_received_total", "bytes relayed backend to client"),
            live_connections: gauge!("tcp_proxy_live_connections", "currently tracked connection records"),
            event_loop_registrations: gauge!("tcp_proxy_event_loop_registrations", "active event loop registrations"),
            analyzer_faults: counter!("tcp_proxy_analyzer_faults_total", "analyzer plugin panics caught"),
            db_reconnects: counter!("tcp_proxy_db_reconnects_total", "successful database reconnects"),
            registry,
        })
    }

    fn render(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buf).expect("metric encoding never fails");
        buf
    }

    /// Blocking one-request-at-a-time HTTP responder, intended to be
    /// run on its own thread. Good enough for a scrape endpoint; no
    /// keep-alive, no routing beyond `GET /metrics`.
    pub fn serve(self: Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        info!(addr, "metrics endpoint listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let metrics = self.clone();
                    std::thread::spawn(move || metrics.handle_one(stream));
                }
                Err(e) => warn!(error = %e, "metrics listener accept failed"),
            }
        }
        Ok(())
    }

    fn handle_one(&self, mut stream: TcpStream) {
        let mut buf = [0u8; 512];
        let _ = stream.read(&mut buf);
        let body = self.render();
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = stream.write_all(header.as_bytes());
        let _ = stream.write_all(&body);
    }
}
