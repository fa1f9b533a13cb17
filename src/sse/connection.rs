use std::{
    fmt,
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        Notify,
    },
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use super::{
    frame,
    registry::{SseRegistry, SubscriberId},
};
use crate::config::Settings;

/// Уникальный ID соединения, выдаётся счётчиком реестра.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Состояние соединения в его жизненном цикле.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Транспорт принят, преамбула ещё не отправлена
    Opening,
    /// Преамбула отправлена, соединение в реестре, heartbeat запущен
    Active,
    /// Терминальное состояние: heartbeat остановлен, транспорт освобождён
    Closed,
}

/// Конфигурация обработки одного соединения.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Интервал heartbeat-кадров
    pub heartbeat_interval: Duration,
    /// Таймаут записи кадра в транспорт
    pub write_timeout: Duration,
    /// Таймаут чтения HTTP-рукопожатия
    pub handshake_timeout: Duration,
    /// Максимальный размер тела publish-запроса
    pub max_body_size: usize,
}

impl ConnectionConfig {
    /// Собирает конфигурацию соединения из настроек сервера.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            ..Default::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_body_size: 64 * 1024,
        }
    }
}

/// Дескриптор живого соединения, хранимый в реестре.
///
/// Владеет отправляющей стороной канала исходящих кадров; сама запись в
/// транспорт выполняется единственной задачей-писателем ([`SseConnection`]),
/// что сериализует конкурентные publish-вызовы в неперемешанные кадры.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    subscriber: SubscriberId,
    created_at: Instant,
    last_heartbeat: parking_lot::Mutex<Instant>,
    state: parking_lot::RwLock<ConnectionState>,
    outbound: UnboundedSender<Bytes>,
    /// Защёлка идемпотентного teardown
    closed: AtomicBool,
    /// Сигнал принудительного закрытия для цикла соединения
    shutdown: Notify,
}

impl ConnectionHandle {
    /// Создаёт дескриптор и приёмник его исходящих кадров.
    ///
    /// Используется драйвером соединения и тестами, которым нужен
    /// дескриптор без реального транспорта.
    ///
    /// # Возвращает
    /// - `(Arc<ConnectionHandle>, UnboundedReceiver<Bytes>)` — дескриптор и
    ///   приёмная сторона канала кадров
    pub fn open(
        id: ConnectionId,
        subscriber: SubscriberId,
    ) -> (Arc<Self>, UnboundedReceiver<Bytes>) {
        let (tx, rx) = unbounded_channel();
        let now = Instant::now();
        let handle = Arc::new(Self {
            id,
            subscriber,
            created_at: now,
            last_heartbeat: parking_lot::Mutex::new(now),
            state: parking_lot::RwLock::new(ConnectionState::Opening),
            outbound: tx,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn subscriber(&self) -> &SubscriberId {
        &self.subscriber
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Время жизни соединения с момента создания.
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Время, прошедшее с последнего heartbeat-кадра.
    pub fn since_last_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Ставит кадр в очередь единственного писателя соединения.
    ///
    /// # Возвращает
    /// - `true` — кадр принят в очередь
    /// - `false` — писатель уже завершился, соединение мертво
    pub fn send(&self, frame: Bytes) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Запрашивает teardown соединения. Идемпотентно: повторные вызовы и
    /// конкурентные вызовы из разных мест безопасны.
    pub fn close(&self) {
        // notify_one хранит разрешение, поэтому сигнал не теряется, даже
        // если цикл соединения ещё не дошёл до ожидания
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_active(&self) {
        *self.state.write() = ConnectionState::Active;
    }

    /// Переводит дескриптор в Closed. Возвращает `false`, если защёлка
    /// уже была взведена другим вызовом.
    fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            *self.state.write() = ConnectionState::Closed;
        }
        first
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }
}

/// Драйвер одного push-соединения: OPENING → ACTIVE → CLOSED.
///
/// Владеет обеими половинами транспорта и является единственным писателем
/// для своего соединения. Реестр никогда не удерживается на время записи:
/// застрявший транспорт тормозит только собственные кадры.
pub struct SseConnection<R, W> {
    handle: Arc<ConnectionHandle>,
    outbound_rx: UnboundedReceiver<Bytes>,
    reader: R,
    writer: W,
    registry: Arc<SseRegistry>,
    config: ConnectionConfig,
    server_shutdown: Arc<Notify>,
}

impl<R, W> SseConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Создаёт драйвер для принятого транспорта. Соединение ещё не
    /// зарегистрировано и не получает fan-out.
    pub fn new(
        registry: Arc<SseRegistry>,
        config: ConnectionConfig,
        subscriber: SubscriberId,
        reader: R,
        writer: W,
        server_shutdown: Arc<Notify>,
    ) -> Self {
        let id = registry.next_connection_id();
        let (handle, outbound_rx) = ConnectionHandle::open(id, subscriber);
        Self {
            handle,
            outbound_rx,
            reader,
            writer,
            registry,
            config,
            server_shutdown,
        }
    }

    /// Дескриптор соединения; по нему publisher ставит кадры в очередь,
    /// а внешний код может запросить teardown.
    pub fn handle(&self) -> Arc<ConnectionHandle> {
        self.handle.clone()
    }

    /// Проводит соединение через весь жизненный цикл и возвращается,
    /// когда оно закрыто.
    ///
    /// Отправляет преамбулу (заголовки + приветственный кадр); при ошибке
    /// записи соединение уходит в CLOSED, так и не попав в реестр. Далее
    /// регистрирует дескриптор и крутит цикл единственного писателя:
    /// heartbeat, исходящие кадры fan-out, ожидание закрытия со стороны
    /// клиента и сигнал останова сервера.
    pub async fn run(self) -> anyhow::Result<()> {
        let SseConnection {
            handle,
            mut outbound_rx,
            mut reader,
            mut writer,
            registry,
            config,
            server_shutdown,
        } = self;

        // Преамбула до регистрации: неудача здесь терминальна и не
        // оставляет следов в реестре
        let preamble = frame::stream_preamble();
        if let Err(e) = write_frame(&mut writer, &preamble, config.write_timeout).await {
            debug!(
                connection_id = %handle.id(),
                subscriber = %handle.subscriber(),
                error = %e,
                "Preamble write failed, closing before registration"
            );
            handle.mark_closed();
            return Ok(());
        }

        registry.register(handle.subscriber(), handle.clone());
        handle.mark_active();
        info!(
            connection_id = %handle.id(),
            subscriber = %handle.subscriber(),
            "Subscriber stream active"
        );

        // Первый tick через полный интервал, а не немедленно
        let start = Instant::now();
        let mut heartbeat = interval_at(start + config.heartbeat_interval, config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut inbound = [0u8; 512];

        // notify_waiters будит только уже зарегистрированные ожидания,
        // поэтому будущее останова включается один раз до цикла, а не
        // пересоздаётся на каждой итерации. Сигнал, выданный ещё до этой
        // строки, доставляется через close_all() по дескриптору.
        let server_shutdown_notified = server_shutdown.notified();
        tokio::pin!(server_shutdown_notified);
        server_shutdown_notified.as_mut().enable();

        loop {
            select! {
                // Останов сервера: рвём все потоки разом
                _ = server_shutdown_notified.as_mut() => {
                    info!(connection_id = %handle.id(), "Received server shutdown signal");
                    break;
                }

                // Явный teardown через дескриптор
                _ = handle.shutdown.notified() => {
                    debug!(connection_id = %handle.id(), "Teardown requested via handle");
                    break;
                }

                // Heartbeat: неудачная запись равнозначна закрытию клиентом
                _ = heartbeat.tick() => {
                    let hb = frame::comment_frame("hb");
                    if let Err(e) = write_frame(&mut writer, &hb, config.write_timeout).await {
                        debug!(
                            connection_id = %handle.id(),
                            error = %e,
                            "Heartbeat write failed, tearing down"
                        );
                        break;
                    }
                    handle.touch_heartbeat();
                }

                // Кадр от publisher'а
                maybe_frame = outbound_rx.recv() => {
                    match maybe_frame {
                        Some(bytes) => {
                            if let Err(e) = write_frame(&mut writer, &bytes, config.write_timeout).await {
                                debug!(
                                    connection_id = %handle.id(),
                                    error = %e,
                                    "Event write failed, tearing down"
                                );
                                break;
                            }
                        }
                        // Дескриптор пропал из реестра — писателю больше нечего делать
                        None => break,
                    }
                }

                // Push-поток ничего не ожидает от клиента: читаем только чтобы
                // заметить закрытие транспорта
                read = reader.read(&mut inbound) => {
                    match read {
                        Ok(0) => {
                            debug!(connection_id = %handle.id(), "Client closed connection");
                            break;
                        }
                        Ok(n) => {
                            // Входящие байты на push-потоке игнорируются
                            debug!(connection_id = %handle.id(), bytes = n, "Ignoring inbound bytes");
                        }
                        Err(e) if is_recoverable_error(&e) => {
                            debug!(connection_id = %handle.id(), error = %e, "Transport closed");
                            break;
                        }
                        Err(e) => {
                            error!(connection_id = %handle.id(), error = %e, "Fatal read error");
                            break;
                        }
                    }
                }
            }
        }

        teardown(&registry, &handle, writer).await;
        Ok(())
    }
}

/// Единственный путь в CLOSED: снимает соединение с реестра, останавливает
/// heartbeat (его таймер живёт в завершившемся цикле) и освобождает
/// транспорт. Безопасен при конкурентных срабатываниях.
async fn teardown<W: AsyncWrite + Unpin>(
    registry: &SseRegistry,
    handle: &ConnectionHandle,
    mut writer: W,
) {
    if !handle.mark_closed() {
        return;
    }

    registry.unregister(handle.subscriber(), handle.id());

    if let Err(e) = writer.shutdown().await {
        // Закрытие уже закрытого транспорта не считается ошибкой
        if e.kind() != ErrorKind::NotConnected {
            debug!(connection_id = %handle.id(), error = %e, "Error during transport shutdown");
        }
    }

    info!(
        connection_id = %handle.id(),
        subscriber = %handle.subscriber(),
        uptime_secs = handle.uptime().as_secs(),
        "Connection closed"
    );
}

/// Записывает кадр целиком с таймаутом и сбросом буфера.
async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
    write_timeout: Duration,
) -> std::io::Result<()> {
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    match timeout(write_timeout, write).await {
        Ok(res) => res,
        Err(_) => {
            warn!("Frame write timed out after {:?}", write_timeout);
            Err(std::io::Error::new(ErrorKind::TimedOut, "frame write timeout"))
        }
    }
}

/// Ошибки чтения, означающие обычное закрытие соединения клиентом.
fn is_recoverable_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
    )
}
