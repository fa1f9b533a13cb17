use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Настройки сервера.
///
/// Загружаются из значений по умолчанию с переопределением через
/// переменные окружения с префиксом `PUSHKA_`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Адрес, на котором слушает сервер
    pub listen_addr: String,
    /// Интервал heartbeat-кадров в секундах
    pub heartbeat_interval_secs: u64,
    /// Максимальное число одновременных соединений
    pub max_connections: usize,
    /// Уровень логирования по умолчанию (перекрывается RUST_LOG)
    pub log_level: String,
    /// Выводить логи в формате JSON
    pub log_json: bool,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            // Значения по умолчанию
            .set_default("listen_addr", "127.0.0.1:8686")?
            .set_default("heartbeat_interval_secs", 20i64)?
            .set_default("max_connections", 10_000i64)?
            .set_default("log_level", "info")?
            .set_default("log_json", false)?
            // Переменные окружения с префиксом PUSHKA_
            .add_source(Environment::with_prefix("PUSHKA").try_parsing(true))
            .build()?;

        // Десериализуем конфигурацию в нашу структуру
        cfg.try_deserialize()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}
