use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    frame,
    registry::{SseRegistry, SubscriberId},
};

/// Fan-out опубликованных событий по живым соединениям подписчиков.
///
/// Единственный API, который видят остальные модули системы: они передают
/// ключ подписчика, имя события и JSON-сериализуемый payload и никогда не
/// видят соединения или состояние реестра. Доставка best-effort,
/// at-most-once, без буферизации: подписчик без живых соединений молча не
/// получает ничего.
///
/// Publish никогда не поднимает ошибок к вызывающему коду: отказ записи
/// локален для одного соединения и приводит к его teardown, а не к ошибке
/// публикации.
pub struct EventPublisher {
    registry: Arc<SseRegistry>,
    /// Общее количество вызовов publish
    pub publish_count: AtomicUsize,
    /// Количество соединений, снятых с реестра из-за мёртвого писателя
    pub pruned_count: AtomicUsize,
}

impl EventPublisher {
    /// Создаёт publisher поверх явно переданного реестра.
    pub fn new(registry: Arc<SseRegistry>) -> Self {
        Self {
            registry,
            publish_count: AtomicUsize::new(0),
            pruned_count: AtomicUsize::new(0),
        }
    }

    /// Публикует событие одному подписчику.
    ///
    /// Событие кодируется один раз и рассылается по снимку соединений
    /// подписчика. Отсутствие подписчика в реестре — не ошибка: подписчик
    /// просто офлайн, записей ноль. Отказ одного соединения не мешает
    /// доставке остальным.
    pub fn publish_to_one<P: Serialize>(
        &self,
        subscriber: &SubscriberId,
        event_name: &str,
        payload: &P,
    ) {
        let frame = match frame::encode_event(event_name, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    event = event_name,
                    error = %e,
                    "Dropping event with unserializable payload"
                );
                return;
            }
        };
        self.publish_frame(subscriber, event_name, &frame);
    }

    /// Публикует событие списку подписчиков.
    ///
    /// Payload сериализуется один раз; к каждому ID применяется семантика
    /// [`publish_to_one`](Self::publish_to_one). Порядок между разными
    /// подписчиками не гарантируется.
    pub fn publish_to_many<P: Serialize>(
        &self,
        subscribers: &[SubscriberId],
        event_name: &str,
        payload: &P,
    ) {
        let frame = match frame::encode_event(event_name, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    event = event_name,
                    error = %e,
                    "Dropping event with unserializable payload"
                );
                return;
            }
        };
        for subscriber in subscribers {
            self.publish_frame(subscriber, event_name, &frame);
        }
    }

    /// Рассылает готовый кадр по снимку соединений подписчика.
    ///
    /// Соединение с мёртвым писателем снимается с реестра немедленно,
    /// поэтому следующий `connections_for` его уже не увидит.
    fn publish_frame(
        &self,
        subscriber: &SubscriberId,
        event_name: &str,
        frame: &Bytes,
    ) {
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.registry.connections_for(subscriber);
        if snapshot.is_empty() {
            return;
        }

        for connection in snapshot {
            if !connection.send(frame.clone()) {
                self.pruned_count.fetch_add(1, Ordering::Relaxed);
                self.registry.unregister(subscriber, connection.id());
                connection.close();
                debug!(
                    subscriber = %subscriber,
                    connection_id = %connection.id(),
                    event = event_name,
                    "Pruned dead connection during publish"
                );
            }
        }
    }
}
