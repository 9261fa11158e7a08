use futures::{SinkExt, StreamExt};
use protocol::Message;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

// Bounds the fan-out buffer per subscriber. A subscriber that falls this
// far behind starts losing messages; delivery is best-effort.
const FANOUT_CAPACITY: usize = 1024;

/// Handle onto the forwarder's fan-out channel. The broker's own publisher
/// and subscriber attach here in-process; models attach over TCP.
#[derive(Clone)]
pub struct Fanout(broadcast::Sender<String>);

impl Fanout {
    pub fn publish_line(&self, line: String) {
        // No receivers is not an error: subscribers come and go.
        let _ = self.0.send(line);
    }

    pub fn publish(&self, message: &Message) -> Result<(), protocol::Error> {
        self.publish_line(message.encode()?);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.0.subscribe()
    }
}

/// The proxy between models: every line accepted on the ingress port is
/// re-emitted verbatim to every connection on the egress port. Order is
/// preserved per publisher; nothing is guaranteed across publishers.
pub struct Forwarder {
    ingress: TcpListener,
    egress: TcpListener,
    fanout: broadcast::Sender<String>,
}

impl Forwarder {
    pub async fn bind(ingress: &str, egress: &str) -> anyhow::Result<Self> {
        let ingress = TcpListener::bind(ingress).await?;
        let egress = TcpListener::bind(egress).await?;
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        tracing::info!(
            ingress = %ingress.local_addr()?,
            egress = %egress.local_addr()?,
            "forwarder is listening"
        );
        Ok(Self {
            ingress,
            egress,
            fanout,
        })
    }

    pub fn ingress_addr(&self) -> std::io::Result<SocketAddr> {
        self.ingress.local_addr()
    }

    pub fn egress_addr(&self) -> std::io::Result<SocketAddr> {
        self.egress.local_addr()
    }

    pub fn handle(&self) -> Fanout {
        Fanout(self.fanout.clone())
    }

    /// Accept and serve connections until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accept = self.ingress.accept() => {
                    let Ok((socket, addr)) = accept else { continue };
                    tracing::debug!(%addr, "publisher connected");
                    tokio::spawn(serve_publisher(socket, self.fanout.clone(), cancel.child_token()));
                }
                accept = self.egress.accept() => {
                    let Ok((socket, addr)) = accept else { continue };
                    tracing::debug!(%addr, "subscriber connected");
                    tokio::spawn(serve_subscriber(socket, self.fanout.subscribe(), cancel.child_token()));
                }
            }
        }
    }
}

// Pump one publisher's lines into the fan-out, verbatim.
async fn serve_publisher(socket: TcpStream, fanout: broadcast::Sender<String>, cancel: CancellationToken) {
    let mut lines = FramedRead::new(
        socket,
        LinesCodec::new_with_max_length(transport::MAX_LINE_BYTES),
    );
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    let _ = fanout.send(line);
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "dropping publisher connection");
                    return;
                }
                None => return,
            },
        }
    }
}

// Pump the fan-out into one subscriber connection.
async fn serve_subscriber(
    socket: TcpStream,
    mut fanout: broadcast::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut sink = FramedWrite::new(
        socket,
        LinesCodec::new_with_max_length(transport::MAX_LINE_BYTES),
    );
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = SinkExt::<String>::close(&mut sink).await;
                return;
            }
            next = fanout.recv() => match next {
                Ok(line) => {
                    if let Err(err) = sink.send(line).await {
                        tracing::debug!(error = %err, "subscriber went away");
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged; messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}
