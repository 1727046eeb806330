//! Gotify stream source against a local websocket server.

use futures_util::{SinkExt, StreamExt};
use gotify_matrix_relay::gotify::GotifySource;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Accept one connection, record the request path and token header, then
/// hand the socket to `script`.
async fn serve_once<F, Fut>(script: F) -> (String, tokio::task::JoinHandle<(String, Option<String>)>)
where
    F: FnOnce(
            tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        ) -> Fut
        + Send
        + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut seen = (String::new(), None);
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                seen = (
                    req.uri().path().to_string(),
                    req.headers()
                        .get("X-Gotify-Key")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                );
                Ok(resp)
            },
        )
        .await
        .unwrap();
        script(ws).await;
        seen
    });

    (url, handle)
}

#[tokio::test]
async fn test_frames_are_forwarded_in_order() {
    let (url, server) = serve_once(|mut ws| async move {
        ws.send(Message::Text(r#"{"title":"a","message":"1"}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Ping(vec![7].into())).await.unwrap();
        ws.send(Message::Binary(br#"{"title":"b","message":"2"}"#.to_vec().into()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
        while ws.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(8);
    let result = GotifySource::new(&url, "client-token").run(tx).await;

    // The server closing the stream is reported as an error.
    assert!(result.is_err());
    assert_eq!(rx.recv().await.unwrap(), br#"{"title":"a","message":"1"}"#);
    assert_eq!(rx.recv().await.unwrap(), br#"{"title":"b","message":"2"}"#);
    assert!(rx.recv().await.is_none());

    let (path, token) = server.await.unwrap();
    assert_eq!(path, "/stream");
    assert_eq!(token.as_deref(), Some("client-token"));
}

#[tokio::test]
async fn test_stops_cleanly_when_relay_is_gone() {
    let (url, server) = serve_once(|mut ws| async move {
        ws.send(Message::Text("{}".into())).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    GotifySource::new(&url, "t").run(tx).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_is_an_error() {
    let (tx, _rx) = mpsc::channel(1);
    assert!(GotifySource::new("ws://127.0.0.1:1", "t").run(tx).await.is_err());
}
