//! Сетевой модуль Pushka.
//!
//! Включает приём входящих соединений и минимальное HTTP-рукопожатие,
//! после которого соединение передаётся ядру подписок (`sse`).
//!
//! ## Подмодули
//!
//! - `http`: разбор заголовка HTTP-запроса и короткие статус-ответы.
//! - `server`: accept-цикл на Tokio, лимиты соединений, маршрутизация
//!   подписки и publish-запросов, graceful shutdown.

pub mod http;
pub mod server;

pub use server::{run_server, ServerState, SUBSCRIBER_HEADER};
