use mill_tcp::error::Result;
use mill_tcp::prelude::*;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Frames are `[u32 length][u32 kind]` followed by `length` bytes.
const HEADER_SIZE: usize = 8;

fn frame(kind: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn body_len(header: &[u8]) -> usize {
    u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize
}

fn kind(header: &[u8]) -> u32 {
    u32::from_le_bytes([header[4], header[5], header[6], header[7]])
}

/// Sends every frame straight back on the connection it came from.
struct EchoHandler {
    ctx: BackendContext,
}

impl FrameHandler for EchoHandler {
    fn on_header(&self, conn_id: ConnectionId, header: &[u8]) -> HeaderAction {
        match body_len(header) {
            0 => match self.ctx.send(conn_id, header, "echo") {
                Ok(()) => HeaderAction::Continue,
                Err(_) => HeaderAction::Disconnect,
            },
            len => HeaderAction::Body(vec![0; len]),
        }
    }

    fn on_body(&self, conn_id: ConnectionId, header: &[u8], body: Vec<u8>, failed: bool) -> bool {
        !failed
            && self
                .ctx
                .send(conn_id, &frame(kind(header), &body), "echo")
                .is_ok()
    }
}

/// Forwards echoed frames to the main thread.
struct Collector {
    tx: mpsc::Sender<(u32, Vec<u8>)>,
}

impl FrameHandler for Collector {
    fn on_header(&self, _conn_id: ConnectionId, header: &[u8]) -> HeaderAction {
        match body_len(header) {
            0 => HeaderAction::Continue,
            len => HeaderAction::Body(vec![0; len]),
        }
    }

    fn on_body(&self, _conn_id: ConnectionId, header: &[u8], body: Vec<u8>, _failed: bool) -> bool {
        self.tx.send((kind(header), body)).is_ok()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mill_tcp=info".into()),
        )
        .init();

    let server = TcpBackend::new(
        TcpBackendConfig::builder()
            .reactor_workers(2)
            .log_prefix("server")
            .status_update_seconds(5)
            .build(),
    )?;
    server.start_listen(0, "127.0.0.1", |ctx, id, peer| {
        println!("[INFO] {id} connected from {peer}");
        let on_disconnect = |id: ConnectionId, uid: Uuid, reason: DisconnectReason| {
            println!("[INFO] {id} ({uid}) disconnected: {reason}");
        };
        ctx.set_disconnect_callback(id, Arc::new(on_disconnect)).is_ok()
            && ctx
                .set_recv_callbacks(
                    id,
                    HEADER_SIZE,
                    Arc::new(EchoHandler { ctx: ctx.clone() }),
                    "echo server",
                )
                .is_ok()
    })?;
    let addr = server.listen_addrs()[0];
    println!("[INFO] Server listening on {addr}");

    let client = TcpBackend::new(TcpBackendConfig::builder().log_prefix("client").build())?;
    let (tx, rx) = mpsc::channel();
    let id = client.connect("127.0.0.1", addr.port(), move |ctx, id, _peer| {
        ctx.set_recv_callbacks(id, HEADER_SIZE, Arc::new(Collector { tx }), "echo client")
            .is_ok()
    })?;

    for (kind, text) in ["hello", "framed", "world"].iter().enumerate() {
        client.send(id, &frame(kind as u32, text.as_bytes()), "client")?;
    }
    for _ in 0..3 {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok((kind, body)) => {
                println!("[INFO] echo #{kind}: {}", String::from_utf8_lossy(&body))
            }
            Err(_) => {
                eprintln!("[ERROR] no echo within 5s");
                break;
            }
        }
    }

    let (sent, recv) = client.total_send_and_recv();
    println!("[INFO] client sent {sent} bytes, received {recv} bytes");
    client.validate(&[id]);
    Ok(())
}
