use std::{
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use serde::Deserialize;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    sync::{Notify, Semaphore},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    network::http,
    sse::{ConnectionConfig, EventPublisher, SseConnection, SseRegistry, SubscriberId},
};

/// Заголовок с ключом подписчика, проставляемый вышестоящим слоем
/// аутентификации. Ядро доверяет ему безоговорочно.
pub const SUBSCRIBER_HEADER: &str = "X-Subscriber-Id";

/// Пауза accept-цикла после невосстановимой ошибки accept'а (например,
/// исчерпание файловых дескрипторов), чтобы не крутиться вхолостую.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Состояние сервера: реестр, publisher и управление соединениями.
///
/// Конструируется явно и передаётся туда, где нужно, — никакого
/// глобального состояния уровня модуля. Время жизни привязано к
/// запуску/останову процесса.
pub struct ServerState {
    registry: Arc<SseRegistry>,
    publisher: EventPublisher,
    connection_config: ConnectionConfig,
    /// Семафор-ограничитель одновременных соединений
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    /// Сигнал graceful shutdown для accept-цикла и всех соединений
    shutdown_signal: Arc<Notify>,
    /// Взводится до notify_waiters: сигнал его не хранит, флаг хранит
    shutting_down: AtomicBool,
}

/// Тело publish-запроса от соседних сервисов бэкенда.
#[derive(Debug, Deserialize)]
struct PublishRequest {
    subscribers: Vec<String>,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl ServerState {
    pub fn new(settings: &Settings) -> Self {
        let registry = Arc::new(SseRegistry::new());
        Self {
            publisher: EventPublisher::new(registry.clone()),
            connection_config: ConnectionConfig::from_settings(settings),
            connection_limit: Arc::new(Semaphore::new(settings.max_connections)),
            max_connections: settings.max_connections,
            shutdown_signal: Arc::new(Notify::new()),
            shutting_down: AtomicBool::new(false),
            registry,
        }
    }

    /// Реестр живых соединений (для мониторинга и тестов).
    pub fn registry(&self) -> &Arc<SseRegistry> {
        &self.registry
    }

    /// Publish API для остальных модулей процесса.
    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Текущее число принятых соединений.
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.connection_limit.available_permits()
    }

    /// Инициирует graceful shutdown: останавливает accept-цикл и
    /// запрашивает teardown всех живых соединений.
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        // Порядок важен: флаг виден до того, как кто-то пропустит notify
        self.shutting_down.store(true, Ordering::SeqCst);
        self.registry.close_all();
        self.shutdown_signal.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Ждёт, пока все соединения закроются, не дольше заданного таймаута.
    pub async fn wait_for_shutdown(
        &self,
        timeout_duration: Duration,
    ) -> Result<()> {
        let start = Instant::now();

        while self.registry.connection_count() > 0 {
            // Соединение могло зарегистрироваться после снимка close_all —
            // закрываем повторно, пока реестр не опустеет
            self.registry.close_all();
            if start.elapsed() > timeout_duration {
                warn!(
                    "Shutdown timeout reached with {} active connections",
                    self.registry.connection_count()
                );
                anyhow::bail!("Shutdown timeout exceeded");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("All connections closed gracefully");
        Ok(())
    }
}

/// Accept-цикл сервера: по задаче на каждое принятое соединение.
///
/// Возвращается после сигнала shutdown; уже запущенные соединения
/// завершаются собственными teardown'ами.
pub async fn run_server(
    state: Arc<ServerState>,
    listener: TcpListener,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Event push server listening");

    // notify_waiters будит только уже зарегистрированные ожидания, поэтому
    // будущее останова создаётся и включается один раз до цикла; сигнал,
    // выданный ещё раньше, ловится по флагу
    let shutdown_notified = state.shutdown_signal.notified();
    tokio::pin!(shutdown_notified);
    shutdown_notified.as_mut().enable();
    if state.is_shutting_down() {
        info!("Shutdown requested before accept loop started");
        return Ok(());
    }

    loop {
        select! {
            _ = shutdown_notified.as_mut() => {
                info!("Accept loop stopped");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(state, socket, addr).await {
                            debug!(client = %addr, error = %e, "Client connection ended with error");
                        }
                    });
                }
                // Ошибка одного клиента не повод останавливать слушатель
                Err(e) if is_recoverable_accept_error(&e) => {
                    warn!(error = %e, "Recoverable accept error, continuing");
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    Ok(())
}

/// Ошибки accept'а, касающиеся одного входящего соединения, а не самого
/// слушателя: клиент успел отвалиться между SYN и accept.
fn is_recoverable_accept_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

/// Обслуживает одно принятое TCP-соединение: рукопожатие и маршрутизация.
async fn handle_client(
    state: Arc<ServerState>,
    socket: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    // Лимит соединений: перегруженный сервер отвечает сразу, без очереди
    let Ok(_permit) = state.connection_limit.clone().try_acquire_owned() else {
        warn!(client = %addr, "Connection limit reached, rejecting");
        let (_, mut write_half) = socket.into_split();
        http::write_status(&mut write_half, 503, "Service Unavailable").await.ok();
        return Ok(());
    };

    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match timeout(
        state.connection_config.handshake_timeout,
        http::read_request_head(&mut reader),
    )
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            debug!(client = %addr, error = %e, "Malformed handshake");
            http::write_status(&mut write_half, 400, "Bad Request").await.ok();
            return Ok(());
        }
        Err(_) => {
            debug!(client = %addr, "Handshake timed out");
            http::write_status(&mut write_half, 408, "Request Timeout").await.ok();
            return Ok(());
        }
    };

    match (head.method.as_str(), head.path.as_str()) {
        ("GET", "/events") => {
            let subscriber = match head.header(SUBSCRIBER_HEADER) {
                Some(id) if !id.is_empty() => SubscriberId::from(id),
                _ => {
                    debug!(client = %addr, "Missing subscriber identity header");
                    http::write_status(&mut write_half, 400, "Bad Request").await.ok();
                    return Ok(());
                }
            };

            info!(client = %addr, subscriber = %subscriber, "Accepted subscription request");
            let connection = SseConnection::new(
                state.registry.clone(),
                state.connection_config.clone(),
                subscriber,
                reader,
                write_half,
                state.shutdown_signal.clone(),
            );
            connection.run().await
        }

        ("POST", "/publish") => {
            let body = match http::read_body(
                &mut reader,
                head.content_length(),
                state.connection_config.max_body_size,
            )
            .await
            {
                Ok(body) => body,
                Err(crate::error::HandshakeError::BodyTooLarge(len)) => {
                    debug!(client = %addr, bytes = len, "Publish body too large");
                    http::write_status(&mut write_half, 413, "Payload Too Large").await.ok();
                    return Ok(());
                }
                Err(e) => {
                    debug!(client = %addr, error = %e, "Failed to read publish body");
                    http::write_status(&mut write_half, 400, "Bad Request").await.ok();
                    return Ok(());
                }
            };

            match serde_json::from_slice::<PublishRequest>(&body) {
                Ok(request) => {
                    let subscribers: Vec<SubscriberId> = request
                        .subscribers
                        .iter()
                        .map(|id| SubscriberId::from(id.as_str()))
                        .collect();
                    state
                        .publisher
                        .publish_to_many(&subscribers, &request.event, &request.payload);
                    http::write_status(&mut write_half, 204, "No Content").await?;
                    Ok(())
                }
                Err(e) => {
                    debug!(client = %addr, error = %e, "Malformed publish body");
                    http::write_status(&mut write_half, 400, "Bad Request").await.ok();
                    Ok(())
                }
            }
        }

        _ => {
            debug!(client = %addr, method = %head.method, path = %head.path, "Unknown route");
            http::write_status(&mut write_half, 404, "Not Found").await.ok();
            Ok(())
        }
    }
}
