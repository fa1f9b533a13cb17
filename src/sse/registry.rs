use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tracing::debug;

use super::connection::{ConnectionHandle, ConnectionId};

/// Непрозрачный стабильный ключ подписчика (например, ID аккаунта).
///
/// Выдаётся внешним слоем аутентификации и используется реестром дословно;
/// ядро не интерпретирует и не проверяет его.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(Arc<str>);

impl SubscriberId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriberId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for SubscriberId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<u64> for SubscriberId {
    fn from(value: u64) -> Self {
        Self(Arc::from(value.to_string()))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Реестр активных push-соединений.
///
/// Единственный разделяемый изменяемый ресурс подсистемы: потокобезопасная
/// карта подписчик → множество его живых соединений. Только учёт, никакого
/// ввода-вывода; блокировка удерживается лишь на короткие операции с картой
/// и никогда — на время записи в транспорт.
///
/// Инвариант: запись существует тогда и только тогда, когда её множество
/// соединений непусто. Размер реестра ограничен числом подключённых сейчас
/// подписчиков, а не историческим оборотом.
#[derive(Debug, Default)]
pub struct SseRegistry {
    /// Хранилище: subscriber -> живые соединения
    buckets: RwLock<HashMap<SubscriberId, Vec<Arc<ConnectionHandle>>>>,
    /// Счётчик для генерации уникальных ID соединений
    id_counter: AtomicU64,
}

/// Сводная статистика реестра для мониторинга.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub subscribers: usize,
    pub connections: usize,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl SseRegistry {
    /// Создаёт новый пустой реестр.
    pub fn new() -> Self {
        Self::default()
    }

    /// Выдаёт следующий уникальный ID соединения.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Добавляет соединение в множество подписчика, создавая множество при
    /// первом использовании. Повторная регистрация того же соединения не
    /// создаёт дубликата.
    pub fn register(
        &self,
        subscriber: &SubscriberId,
        connection: Arc<ConnectionHandle>,
    ) {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(subscriber.clone()).or_default();
        if bucket.iter().any(|c| c.id() == connection.id()) {
            return;
        }
        bucket.push(connection);

        debug!(
            subscriber = %subscriber,
            connections = bucket.len(),
            "Registered connection"
        );
    }

    /// Удаляет соединение из множества подписчика.
    ///
    /// Если множество опустело, запись подписчика удаляется сразу же.
    /// Повторное удаление — тихий no-op, не ошибка.
    pub fn unregister(
        &self,
        subscriber: &SubscriberId,
        connection_id: ConnectionId,
    ) {
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get_mut(subscriber) {
            let before = bucket.len();
            bucket.retain(|c| c.id() != connection_id);

            if bucket.len() != before {
                debug!(
                    subscriber = %subscriber,
                    connection_id = %connection_id,
                    remaining = bucket.len(),
                    "Unregistered connection"
                );
            }

            if bucket.is_empty() {
                buckets.remove(subscriber);
            }
        }
    }

    /// Возвращает неизменяемый снимок текущих соединений подписчика.
    ///
    /// Никогда не выдаёт живое изменяемое множество: итерация по снимку во
    /// время fan-out безопасна при конкурентных unregister.
    ///
    /// # Возвращает
    /// - `Vec<Arc<ConnectionHandle>>` — снимок; пустой, если подписчик
    ///   офлайн
    pub fn connections_for(
        &self,
        subscriber: &SubscriberId,
    ) -> Vec<Arc<ConnectionHandle>> {
        self.buckets
            .read()
            .get(subscriber)
            .cloned()
            .unwrap_or_default()
    }

    /// Возвращает число подписчиков хотя бы с одним живым соединением.
    pub fn subscriber_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Возвращает общее число живых соединений.
    pub fn connection_count(&self) -> usize {
        self.buckets.read().values().map(Vec::len).sum()
    }

    /// Сводная статистика для административного мониторинга.
    pub fn stats(&self) -> RegistryStats {
        let buckets = self.buckets.read();
        RegistryStats {
            subscribers: buckets.len(),
            connections: buckets.values().map(Vec::len).sum(),
        }
    }

    /// Запрашивает teardown всех живых соединений (graceful shutdown).
    pub fn close_all(&self) {
        let buckets = self.buckets.read();
        for bucket in buckets.values() {
            for connection in bucket {
                connection.close();
            }
        }
    }

    /// Очищает реестр. Используется в unit-тестах.
    #[cfg(test)]
    pub fn clear(&self) {
        self.buckets.write().clear();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
