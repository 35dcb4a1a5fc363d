// WebSocket server for the player bridge page.
//
// The page hosts the streaming service's browser playback SDK, which is the
// only way to register a playback device. It relays device and player-state
// events here and receives token and connect commands back.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

/// Events emitted by the WebSocket server to the application layer.
#[derive(Debug, PartialEq)]
pub enum WsEvent {
    /// A new bridge page has connected.
    Connected { addr: String },
    /// The current bridge page has disconnected.
    Disconnected,
    /// A text message was received from the page (raw JSON string).
    Message(String),
}

/// Run the WebSocket server on the given port.
///
/// Binds `127.0.0.1:{port}` and serves one bridge page at a time. Inbound
/// text frames are forwarded as [`WsEvent::Message`]; strings received on
/// `outbound` are written to the connected page. Outbound messages queued
/// while no page is connected are dropped when the next one connects.
pub async fn run(
    port: u16,
    tx: mpsc::Sender<WsEvent>,
    mut outbound: mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        let addr_str = addr.to_string();
        info!("Accepted TCP connection from {addr_str}");

        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {addr_str}: {e}");
                continue;
            }
        };

        let mut stale = 0;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Dropped {stale} outbound messages queued while disconnected");
        }

        if tx
            .send(WsEvent::Connected {
                addr: addr_str.clone(),
            })
            .await
            .is_err()
        {
            break;
        }

        let (mut write, read) = ws_stream.split();
        if serve_connection(read, &mut write, &tx, &mut outbound, &addr_str)
            .await
            .is_err()
        {
            break;
        }

        if tx.send(WsEvent::Disconnected).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Pump one connection: forward inbound text frames through `tx` and write
/// outbound strings to `write`, until the page closes, errors, or goes away.
///
/// Returns `Err(())` if either channel is closed on the application side,
/// signalling the caller to stop. Generic over the stream and sink so it can
/// be tested without opening TCP ports.
pub async fn serve_connection<St, Si>(
    mut read: St,
    write: &mut Si,
    tx: &mpsc::Sender<WsEvent>,
    outbound: &mut mpsc::Receiver<String>,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    Si: Sink<Message> + Unpin,
    Si::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            biased;

            out = outbound.recv() => {
                let Some(text) = out else {
                    return Err(());
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("Failed to write to {addr}: {e}");
                    break;
                }
            }

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if tx.send(WsEvent::Message(text.to_string())).await.is_err() {
                        return Err(());
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Client {addr} sent close frame");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error from {addr}: {e}");
                    break;
                }
                None => break,
                Some(Ok(_)) => {
                    // Ignore Binary, Ping, Pong, Frame variants.
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    /// Helper: create a stream of Message results from a vec.
    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    async fn serve(
        messages: Vec<Result<Message, WsError>>,
        tx: &mpsc::Sender<WsEvent>,
    ) -> (Result<(), ()>, Vec<Message>) {
        let (_out_tx, mut out_rx) = mpsc::channel::<String>(8);
        let mut written: Vec<Message> = Vec::new();
        let result =
            serve_connection(mock_stream(messages), &mut written, tx, &mut out_rx, "test").await;
        (result, written)
    }

    #[tokio::test]
    async fn text_messages_forwarded_in_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text(r#"{"type":"HEARTBEAT"}"#.into())),
            Ok(Message::Text("second".into())),
        ];

        let (result, _) = serve(messages, &tx).await;
        result.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            WsEvent::Message(r#"{"type":"HEARTBEAT"}"#.into())
        );
        assert_eq!(rx.recv().await.unwrap(), WsEvent::Message("second".into()));
    }

    #[tokio::test]
    async fn close_frame_stops_processing() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Text("before_close".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("after_close_should_not_appear".into())),
        ];

        serve(messages, &tx).await.0.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            WsEvent::Message("before_close".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_stops_processing() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Err(WsError::ConnectionClosed),
            Ok(Message::Text("after_error_should_not_appear".into())),
        ];

        serve(messages, &tx).await.0.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_and_ping_messages_are_ignored() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Text("after_ignored".into())),
        ];

        serve(messages, &tx).await.0.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            WsEvent::Message("after_ignored".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn returns_err_when_event_channel_closed() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let (result, _) = serve(vec![Ok(Message::Text("orphan".into()))], &tx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn outbound_messages_are_written_to_the_page() {
        let (tx, _rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(8);
        out_tx.send(r#"{"type":"DISCONNECT"}"#.to_string()).await.unwrap();
        let mut written: Vec<Message> = Vec::new();

        serve_connection(mock_stream(vec![]), &mut written, &tx, &mut out_rx, "test")
            .await
            .unwrap();

        assert_eq!(written, vec![Message::Text(r#"{"type":"DISCONNECT"}"#.into())]);
    }

    #[tokio::test]
    async fn returns_err_when_outbound_channel_closed() {
        let (tx, _rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(8);
        drop(out_tx);
        let mut written: Vec<Message> = Vec::new();
        let result =
            serve_connection(mock_stream(vec![]), &mut written, &tx, &mut out_rx, "test").await;
        assert!(result.is_err());
    }
}
