//! Connection handler
//!
//! Owns one accepted connection end-to-end: login negotiation, the message
//! loop, and teardown. Outgoing lines flow through the session's sink into a
//! dedicated writer task; the handler itself only reads.

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::error::{AppError, LoginError};
use crate::protocol::{ClientLine, ServerMessage};
use crate::registry::RegistryHandle;
use crate::session::{Session, Sink};
use crate::types::{SessionId, Username};

type LineReader<S> = Lines<BufReader<ReadHalf<S>>>;

/// Handle a new TCP connection
///
/// Runs the whole session lifecycle. Login rejections are not errors;
/// only I/O and internal channel failures are returned.
pub async fn handle_connection(
    stream: TcpStream,
    registry: RegistryHandle,
    sink_capacity: usize,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    handle_stream(stream, peer_addr, registry, sink_capacity).await
}

/// Handle any bidirectional byte stream as a chat connection
pub async fn handle_stream<S>(
    stream: S,
    peer: String,
    registry: RegistryHandle,
    sink_capacity: usize,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    let session_id = SessionId::new();
    info!("Session {} connected from {}", session_id, peer);

    // Channel for server -> client lines
    let (line_tx, line_rx) = mpsc::channel::<String>(sink_capacity);
    let write_task = tokio::spawn(write_lines(writer, line_rx, session_id));

    let mut session = Session::new(session_id, peer, Sink::new(session_id, line_tx));
    let broadcaster = Broadcaster::new(registry.clone());

    let result = run_session(&mut session, &mut lines, &registry, &broadcaster).await;

    teardown(session, &registry, &broadcaster, write_task).await;

    match result {
        Err(AppError::Login(reason)) => {
            info!("Session {} rejected: {}", session_id, reason);
            Ok(())
        }
        other => other,
    }
}

async fn run_session<S>(
    session: &mut Session,
    lines: &mut LineReader<S>,
    registry: &RegistryHandle,
    broadcaster: &Broadcaster,
) -> Result<(), AppError>
where
    S: AsyncRead,
{
    let username = negotiate_login(session, lines, registry).await?;

    session
        .sink
        .send(&ServerMessage::Welcome {
            username: username.clone(),
        })
        .await?;
    broadcaster
        .broadcast(&ServerMessage::UserJoined {
            username: username.clone(),
        })
        .await?;

    session.mark_active();
    relay_messages(session, &username, lines, broadcaster).await
}

/// Prompt for a username and claim it in the registry
async fn negotiate_login<S>(
    session: &mut Session,
    lines: &mut LineReader<S>,
    registry: &RegistryHandle,
) -> Result<Username, AppError>
where
    S: AsyncRead,
{
    session.sink.send(&ServerMessage::LoginPrompt).await?;

    let first_line = lines.next_line().await?;
    let Some(username) = first_line.as_deref().and_then(Username::parse) else {
        return reject(session, LoginError::EmptyUsername).await;
    };

    if !registry
        .try_insert(username.clone(), session.sink.clone())
        .await?
    {
        return reject(session, LoginError::UsernameTaken(username.to_string())).await;
    }

    session.mark_registered(username.clone());
    Ok(username)
}

async fn reject<T>(session: &Session, reason: LoginError) -> Result<T, AppError> {
    session
        .sink
        .send(&ServerMessage::from(reason.clone()))
        .await?;
    Err(reason.into())
}

/// Broadcast every line until end-of-stream, `/exit`, or the writer stops
async fn relay_messages<S>(
    session: &Session,
    username: &Username,
    lines: &mut LineReader<S>,
    broadcaster: &Broadcaster,
) -> Result<(), AppError>
where
    S: AsyncRead,
{
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = session.sink.closed() => {
                debug!("Writer stopped for {}, ending session", session.id);
                return Ok(());
            }
        };

        let Some(line) = line else {
            debug!("Session {} reached end of stream", session.id);
            return Ok(());
        };

        match ClientLine::parse(&line) {
            ClientLine::Exit => {
                debug!("Session {} sent exit command", session.id);
                return Ok(());
            }
            ClientLine::Text(text) => {
                broadcaster
                    .broadcast(&ServerMessage::Chat {
                        from: username.clone(),
                        text: text.to_string(),
                    })
                    .await?;
            }
        }
    }
}

/// Release everything the session holds
///
/// Runs on every exit path. Failures are logged, never returned.
async fn teardown(
    mut session: Session,
    registry: &RegistryHandle,
    broadcaster: &Broadcaster,
    write_task: JoinHandle<std::io::Result<()>>,
) {
    let session_id = session.id;
    if session.sink.is_closed() {
        debug!("Writer for {} had already stopped", session_id);
    }

    if let Some(username) = session.close() {
        match registry.remove(username.clone()).await {
            Ok(true) => {
                let left = ServerMessage::UserLeft { username };
                if let Err(e) = broadcaster.broadcast(&left).await {
                    warn!("Failed to announce departure of {}: {}", session_id, e);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to unregister {}: {}", session_id, e),
        }
    }

    // Dropping the last sink lets the writer drain and shut the socket down
    drop(session);

    match write_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Write error for {}: {}", session_id, e),
        Err(e) => error!("Write task for {} failed: {}", session_id, e),
    }

    info!("Session {} disconnected", session_id);
}

/// Drain queued lines into the socket, then close the write direction
async fn write_lines<S>(
    mut writer: WriteHalf<S>,
    mut line_rx: mpsc::Receiver<String>,
    session_id: SessionId,
) -> std::io::Result<()>
where
    S: AsyncWrite,
{
    while let Some(mut line) = line_rx.recv().await {
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    debug!("Write task ended for {}", session_id);

    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    struct TestClient {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<Result<(), AppError>>,
    }

    impl TestClient {
        fn connect(registry: &RegistryHandle) -> Self {
            Self::connect_wrapped(registry, |server| server)
        }

        /// Connect with the server end of the pipe wrapped by `wrap`
        fn connect_wrapped<S>(
            registry: &RegistryHandle,
            wrap: impl FnOnce(DuplexStream) -> S,
        ) -> Self
        where
            S: AsyncRead + AsyncWrite + Send + 'static,
        {
            let (client, server) = tokio::io::duplex(4096);
            let task = tokio::spawn(handle_stream(
                wrap(server),
                "duplex".to_string(),
                registry.clone(),
                16,
            ));
            let (reader, writer) = tokio::io::split(client);
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
                task,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            self.lines.next_line().await.unwrap()
        }

        /// Answer the prompt and consume the welcome and own join notice
        async fn login(&mut self, name: &str) {
            assert_eq!(self.recv().await.as_deref(), Some("Введите логин:"));
            self.send(name).await;
            assert_eq!(self.recv().await, Some(format!("Добро пожаловать, {name}!")));
            assert_eq!(
                self.recv().await,
                Some(format!("Сервер: Пользователь {name} присоединился к чату!"))
            );
        }
    }

    /// Server-side stream whose writes start failing once `broken` is set
    struct BreakableWrites {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl AsyncRead for BreakableWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BreakableWrites {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.broken.load(Ordering::SeqCst) {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Register a bare sink to observe broadcasts
    async fn observer(registry: &RegistryHandle, name: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        let inserted = registry
            .try_insert(Username::parse(name).unwrap(), Sink::new(SessionId::new(), tx))
            .await
            .unwrap();
        assert!(inserted);
        rx
    }

    #[tokio::test]
    async fn test_empty_username_rejected() {
        let registry = RegistryHandle::spawn(16);
        let mut client = TestClient::connect(&registry);

        assert_eq!(client.recv().await.as_deref(), Some("Введите логин:"));
        client.send("   ").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("Логин не может быть пустым. Соединение будет закрыто.")
        );
        assert_eq!(client.recv().await, None);

        assert!(client.task.await.unwrap().is_ok());
        assert_eq!(registry.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_eof_before_username_rejected() {
        let registry = RegistryHandle::spawn(16);
        let mut client = TestClient::connect(&registry);

        assert_eq!(client.recv().await.as_deref(), Some("Введите логин:"));
        client.writer.shutdown().await.unwrap();
        assert_eq!(
            client.recv().await.as_deref(),
            Some("Логин не может быть пустым. Соединение будет закрыто.")
        );
        assert!(client.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_taken_username_rejected() {
        let registry = RegistryHandle::spawn(16);
        let mut existing = observer(&registry, "alice").await;
        let mut client = TestClient::connect(&registry);

        client.recv().await;
        client.send("alice").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("Логин занят. Соединение будет закрыто.")
        );
        assert_eq!(client.recv().await, None);
        assert!(client.task.await.unwrap().is_ok());

        // The holder saw nothing and keeps the name
        assert!(existing.try_recv().is_err());
        assert_eq!(registry.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_session_lifecycle() {
        let registry = RegistryHandle::spawn(16);
        let mut watcher = observer(&registry, "watcher").await;
        let mut client = TestClient::connect(&registry);

        client.recv().await;
        client.send("  alice  ").await;
        assert_eq!(client.recv().await.as_deref(), Some("Добро пожаловать, alice!"));
        assert_eq!(
            client.recv().await.as_deref(),
            Some("Сервер: Пользователь alice присоединился к чату!")
        );

        client.send("hello  ").await;
        assert_eq!(client.recv().await.as_deref(), Some("alice: hello  "));

        client.send(" /EXIT \nnever relayed").await;
        assert_eq!(client.recv().await, None);
        assert!(client.task.await.unwrap().is_ok());

        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь alice присоединился к чату!")
        );
        assert_eq!(watcher.recv().await.as_deref(), Some("alice: hello  "));
        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь alice покинул чат.")
        );
        assert!(watcher.try_recv().is_err());
        assert_eq!(registry.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_announced_once() {
        let registry = RegistryHandle::spawn(16);
        let mut watcher = observer(&registry, "watcher").await;
        let mut client = TestClient::connect(&registry);

        client.recv().await;
        client.send("bob").await;
        client.recv().await;
        client.recv().await;

        let TestClient { lines, writer, task } = client;
        drop(lines);
        drop(writer);
        let _ = task.await.unwrap();

        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь bob присоединился к чату!")
        );
        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь bob покинул чат.")
        );
        assert!(watcher.try_recv().is_err());
        assert_eq!(registry.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_burst_reaches_late_reader() {
        const BURST: usize = 2000;

        let registry = RegistryHandle::spawn(16);
        let mut client = TestClient::connect(&registry);
        client.login("alice").await;

        let TestClient {
            mut lines,
            mut writer,
            task,
        } = client;
        let sending = tokio::spawn(async move {
            for i in 0..BURST {
                writer
                    .write_all(format!("line {i}\n").as_bytes())
                    .await
                    .unwrap();
            }
            writer.write_all(b"/exit\n").await.unwrap();
            writer
        });

        // Let the outbound queue fill up well past its capacity
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut received = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            received.push(line);
        }
        let _writer = sending.await.unwrap();

        assert_eq!(received.len(), BURST);
        for (i, line) in received.iter().enumerate() {
            assert_eq!(line, &format!("alice: line {i}"));
        }
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_read_error_announced_once() {
        let registry = RegistryHandle::spawn(16);
        let mut watcher = observer(&registry, "watcher").await;
        let mut client = TestClient::connect(&registry);
        client.login("carol").await;

        client.writer.write_all(b"\xff\n").await.unwrap();

        let result = client.task.await.unwrap();
        assert!(matches!(result, Err(AppError::Io(_))));

        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь carol присоединился к чату!")
        );
        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь carol покинул чат.")
        );
        assert!(watcher.try_recv().is_err());
        assert_eq!(registry.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_announced_once() {
        let registry = RegistryHandle::spawn(16);
        let mut watcher = observer(&registry, "watcher").await;
        let broken = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&broken);
        let mut client = TestClient::connect_wrapped(&registry, move |inner| BreakableWrites {
            inner,
            broken: flag,
        });
        client.login("dave").await;

        broken.store(true, Ordering::SeqCst);
        client.send("boom").await;

        assert!(client.task.await.unwrap().is_ok());

        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь dave присоединился к чату!")
        );
        assert_eq!(watcher.recv().await.as_deref(), Some("dave: boom"));
        assert_eq!(
            watcher.recv().await.as_deref(),
            Some("Сервер: Пользователь dave покинул чат.")
        );
        assert!(watcher.try_recv().is_err());
        assert_eq!(registry.len().await.unwrap(), 1);
    }
}
