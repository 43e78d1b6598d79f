use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use url::Url;
use yawc::{Options, WebSocket};

/// Outbound half of a duplex text transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// An open duplex connection.
///
/// The transport is considered closed once `inbound` ends.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub inbound: BoxStream<'static, String>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports for the streaming client.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human readable endpoint, used in logs and hook payloads.
    fn endpoint(&self) -> String;

    async fn connect(&self) -> anyhow::Result<Transport>;
}

/// WebSocket [`Connector`].
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn endpoint(&self) -> String {
        self.url.to_string()
    }

    async fn connect(&self) -> anyhow::Result<Transport> {
        let ws = WebSocket::connect(self.url.clone())
            .with_options(Options::default().with_no_delay())
            .await?;

        let (out_tx, out_rx) = unbounded_channel();
        let (in_tx, in_rx) = unbounded_channel();
        tokio::spawn(pump(ws, out_rx, in_tx));

        let inbound = futures::stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|text| (text, rx))
        })
        .boxed();

        Ok(Transport {
            sink: Box::new(WsSink { tx: Some(out_tx) }),
            inbound,
        })
    }
}

/// Owns the socket. Exits when either side goes away, which drops the socket.
async fn pump(
    mut ws: WebSocket,
    mut outbound: UnboundedReceiver<String>,
    inbound: UnboundedSender<String>,
) {
    loop {
        tokio::select! {
            text = outbound.recv() => {
                let Some(text) = text else {
                    break;
                };
                let value: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        log::warn!("refusing to send non-json frame: {err:?}");
                        continue;
                    }
                };
                if let Err(err) = ws.send_json(&value).await {
                    log::warn!("send failed: {err:?}");
                    break;
                }
            }
            frame = ws.next() => {
                let Some(frame) = frame else {
                    break;
                };
                match std::str::from_utf8(&frame.payload) {
                    Ok(text) if !text.is_empty() => {
                        if inbound.send(text.to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("dropping non utf-8 frame: {err:?}"),
                }
            }
        }
    }
}

struct WsSink {
    tx: Option<UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("sink closed"))?;
        tx.send(text)
            .map_err(|_| anyhow::anyhow!("connection closed"))?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.tx.take();
        Ok(())
    }
}
