//! Подсистема распределения событий в реальном времени (server-push).
//!
//! Ядро сервера: реестр живых соединений, fan-out публикаций и жизненный
//! цикл соединения. Остальная часть бэкенда лишь вызывает publish или
//! поставляет аутентифицированный ключ подписчика.
//!
//! - `frame`: кодировщик кадров wire-протокола (комментарии и события).
//! - `registry`: потокобезопасная карта подписчик → живые соединения.
//! - `connection`: состояние OPENING→ACTIVE→CLOSED, heartbeat, teardown.
//! - `publisher`: fan-out событий по снимкам реестра.
//!
//! Публичный API переэкспортирует:
//! - `frame::*`
//! - `registry::*`
//! - `connection::*`
//! - `publisher::*`

pub mod connection;
pub mod frame;
pub mod publisher;
pub mod registry;

pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionId, ConnectionState, SseConnection,
};
pub use frame::{comment_frame, encode_event, event_frame, stream_preamble};
pub use publisher::EventPublisher;
pub use registry::{RegistryStats, SseRegistry, SubscriberId};
