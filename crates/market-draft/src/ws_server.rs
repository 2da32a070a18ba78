// WebSocket server: accepts client connections and runs one read task per
// connection, routing text frames to the app.

use std::sync::Arc;

use futures_util::stream::Stream;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::app::App;
use crate::hub::{Connection, WsSink};

/// Bind `host:port` and serve clients until the task is cancelled.
pub async fn run(host: &str, port: u16, app: App) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    serve(listener, app).await
}

/// Accept connections from an already-bound listener. Each client gets its
/// own task, so a slow client never holds up the accept loop.
pub async fn serve(listener: TcpListener, app: App) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Accepted TCP connection from {addr}");
        let app = app.clone();
        tokio::spawn(async move {
            handle_connection(stream, addr.to_string(), app).await;
        });
    }
}

/// Perform the handshake, register the write half with the hub, and read
/// until the client goes away.
async fn handle_connection<S>(stream: S, addr: String, app: App)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let (write, read) = ws_stream.split();
    let conn = app.hub().register(Box::new(WsSink::new(write)));
    info!("Client {addr} connected as connection {}", conn.id());

    let handled = process_message_stream(read, &app, &conn, &addr).await;

    app.connection_closed(&conn).await;
    info!(
        "Client {addr} (connection {}) disconnected after {handled} messages",
        conn.id()
    );
}

/// Route text frames from `stream` to `app` on behalf of `conn` until the
/// client closes, errors, or the hub drops the connection. Returns how many
/// text frames were handled.
///
/// Generic over the stream type so it can be driven by in-memory streams.
pub async fn process_message_stream<St>(
    mut stream: St,
    app: &App,
    conn: &Arc<Connection>,
    addr: &str,
) -> usize
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut handled = 0;
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                app.handle_text(conn, text.as_str()).await;
                handled += 1;
                if conn.is_closed() {
                    info!("Connection {} for {addr} was dropped by the hub", conn.id());
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry no commands.
            }
        }
    }
    handled
}
