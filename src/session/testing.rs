//! In-Process WebSocket-Server für Tests

use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use url::Url;

pub(crate) type ServerStream = WebSocketStream<TcpStream>;

pub(crate) fn ws_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{}/live", addr)).unwrap()
}

/// Startet einen Server für genau eine Verbindung
///
/// Das Ergebnis des Handlers kommt über den zurückgegebenen Receiver.
pub(crate) async fn serve<F, Fut, T>(handler: F) -> (Url, mpsc::UnboundedReceiver<T>)
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (result_tx, result_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        let _ = result_tx.send(handler(ws).await);
    });

    (ws_url(addr), result_rx)
}

/// Liest die Setup-Nachricht und bestätigt sie
pub(crate) async fn accept_setup(ws: &mut ServerStream) -> serde_json::Value {
    let setup = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<serde_json::Value>(&text).unwrap(),
        other => panic!("expected setup message, got {:?}", other),
    };
    assert!(setup.get("setup").is_some());

    ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string()))
        .await
        .unwrap();
    setup
}
