use futures::{SinkExt, StreamExt};
use protocol::Message;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Upper bound on one wire line. Data payloads scale with instance counts,
/// and county-level payloads run to megabytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

const RETRY_FLOOR: Duration = Duration::from_millis(50);
const RETRY_CEILING: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cancelled while connecting to {0}")]
    Cancelled(String),
    #[error("transport IO failure")]
    Io(#[from] std::io::Error),
    #[error("line framing failure")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
}

fn framed(stream: TcpStream) -> Framed<TcpStream, LinesCodec> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
}

// Retries until the endpoint accepts or the token cancels. Models routinely
// start before the broker is listening.
async fn connect_with_retry(addr: &str, cancel: &CancellationToken) -> Result<TcpStream, Error> {
    let mut delay = RETRY_FLOOR;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled(addr.to_string())),
            attempt = TcpStream::connect(addr) => match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!(%addr, "connected");
                    return Ok(stream);
                }
                Err(err) => {
                    tracing::debug!(%addr, %err, "connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CEILING);
                }
            },
        }
    }
}

/// The publishing half: a connection to the broker's ingress port.
pub struct Publisher {
    framed: Framed<TcpStream, LinesCodec>,
    addr: String,
}

impl Publisher {
    pub async fn connect(addr: &str, cancel: &CancellationToken) -> Result<Self, Error> {
        let stream = connect_with_retry(addr, cancel).await?;
        Ok(Self {
            framed: framed(stream),
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), Error> {
        let line = message.encode()?;
        self.framed.send(line).await?;
        Ok(())
    }

    /// Flush and close with bounded linger.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            SinkExt::<String>::close(&mut self.framed),
        )
        .await;
    }
}

/// The subscribing half: a connection to the broker's egress port.
/// Subscribers join without replay and may miss earlier traffic.
pub struct Subscriber {
    framed: Framed<TcpStream, LinesCodec>,
    addr: String,
}

impl Subscriber {
    pub async fn connect(addr: &str, cancel: &CancellationToken) -> Result<Self, Error> {
        let stream = connect_with_retry(addr, cancel).await?;
        Ok(Self {
            framed: framed(stream),
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The next decodable message, or None once the peer closes. Lines that
    /// fail to decode are logged and skipped.
    pub async fn recv(&mut self) -> Result<Option<Message>, Error> {
        while let Some(line) = self.framed.next().await {
            let line = line?;
            match Message::decode(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable line");
                }
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) {
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            SinkExt::<String>::close(&mut self.framed),
        )
        .await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use protocol::Status;
    use tokio::io::AsyncWriteExt;

    async fn listener() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn publisher_lines_arrive_in_order() {
        let (listener, addr) = listener().await;
        let cancel = CancellationToken::new();

        let mut publisher = Publisher::connect(&addr, &cancel).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = framed(stream);

        for step in 1..=3 {
            let msg = Message::broker_status(Status::Booted, step, 2016);
            publisher.send(&msg).await.unwrap();
        }
        for step in 1..=3u32 {
            let line = lines.next().await.unwrap().unwrap();
            let msg = Message::decode(&line).unwrap();
            assert_eq!(msg.incstep, step);
        }
        publisher.close().await;
    }

    #[tokio::test]
    async fn subscriber_skips_garbage_lines() {
        let (listener, addr) = listener().await;
        let cancel = CancellationToken::new();

        let mut subscriber = Subscriber::connect(&addr, &cancel).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let good = Message::broker_status(Status::Booting, 1, 2016)
            .encode()
            .unwrap();
        stream
            .write_all(format!("not json\n{good}\n").as_bytes())
            .await
            .unwrap();
        drop(stream);

        let got = subscriber.recv().await.unwrap().unwrap();
        assert_eq!(got.signal(), "status");
        assert!(subscriber.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connect_retries_until_listener_appears() {
        let port = portpicker::pick_unused_port().unwrap();
        let addr = format!("127.0.0.1:{port}");
        let cancel = CancellationToken::new();

        let pending = tokio::spawn({
            let addr = addr.clone();
            let cancel = cancel.clone();
            async move { Publisher::connect(&addr, &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        let publisher = pending.await.unwrap().unwrap();
        assert_eq!(publisher.addr(), addr);
        drop(listener);
    }

    #[tokio::test]
    async fn connect_honors_cancellation() {
        let port = portpicker::pick_unused_port().unwrap();
        let addr = format!("127.0.0.1:{port}");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let got = Subscriber::connect(&addr, &cancel).await;
        assert!(matches!(got, Err(Error::Cancelled(_))));
    }
}
