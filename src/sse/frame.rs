use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::EncodeError;

/// Заголовки HTTP-ответа, открывающие push-поток.
///
/// Отправляются единым блоком и сбрасываются в сокет до первого байта
/// полезных данных, чтобы клиент сразу увидел открытый поток.
pub const STREAM_HEADERS: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Connection: keep-alive\r\n\
\r\n";

/// Текст комментарий-кадра, отправляемого сразу после заголовков.
pub const OPEN_COMMENT: &str = "connected";

/// Кодирует комментарий-кадр: `: <text>\n\n`.
///
/// Используется для приветственного кадра и heartbeat'ов. Пассивные
/// потребители обязаны игнорировать такие кадры.
pub fn comment_frame(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 4);
    buf.put_slice(b": ");
    buf.put_slice(text.as_bytes());
    buf.put_slice(b"\n\n");
    buf.freeze()
}

/// Кодирует событие-кадр: строка имени, строка данных, пустой терминатор.
///
/// `json` — уже сериализованный payload. Кодирование чистое и без состояния:
/// одно и то же событие всегда даёт байт-в-байт одинаковый результат.
pub fn event_frame(name: &str, json: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(name.len() + json.len() + 16);
    buf.put_slice(b"event: ");
    buf.put_slice(name.as_bytes());
    buf.put_slice(b"\ndata: ");
    buf.put_slice(json.as_bytes());
    buf.put_slice(b"\n\n");
    buf.freeze()
}

/// Сериализует payload в JSON и кодирует событие-кадр.
///
/// # Возвращает
/// - `Ok(Bytes)` — готовый кадр, разделяемый между всеми соединениями
/// - `Err(EncodeError)` — payload не сериализуется в JSON
pub fn encode_event<P: Serialize>(
    name: &str,
    payload: &P,
) -> Result<Bytes, EncodeError> {
    let json = serde_json::to_string(payload)?;
    Ok(event_frame(name, &json))
}

/// Полная преамбула потока: HTTP-заголовки плюс приветственный
/// комментарий-кадр.
pub fn stream_preamble() -> Bytes {
    let comment = comment_frame(OPEN_COMMENT);
    let mut buf = BytesMut::with_capacity(STREAM_HEADERS.len() + comment.len());
    buf.put_slice(STREAM_HEADERS.as_bytes());
    buf.put_slice(&comment);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Тест проверяет точный формат комментарий-кадра.
    #[test]
    fn test_comment_frame_exact_bytes() {
        assert_eq!(&comment_frame("hb")[..], b": hb\n\n");
        assert_eq!(&comment_frame("")[..], b": \n\n");
    }

    /// Тест проверяет точный формат события из спецификации протокола:
    /// строка имени, строка данных, пустой терминатор.
    #[test]
    fn test_event_frame_exact_bytes() {
        let frame = event_frame("unread_count", "{\"count\":3}");
        assert_eq!(&frame[..], b"event: unread_count\ndata: {\"count\":3}\n\n");
    }

    /// Тест проверяет, что сериализация детерминирована: одно событие,
    /// закодированное дважды, даёт байт-идентичный вывод.
    #[test]
    fn test_encoding_is_deterministic() {
        let a = encode_event("ping", &json!({})).unwrap();
        let b = encode_event("ping", &json!({})).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..], b"event: ping\ndata: {}\n\n");
    }

    /// Тест проверяет, что encode_event сериализует произвольные
    /// serde-значения.
    #[test]
    fn test_encode_event_with_struct_payload() {
        #[derive(serde::Serialize)]
        struct Payload {
            count: u32,
        }

        let frame = encode_event("unread_count", &Payload { count: 3 }).unwrap();
        assert_eq!(&frame[..], b"event: unread_count\ndata: {\"count\":3}\n\n");
    }

    /// Тест проверяет, что преамбула начинается с заголовков и
    /// заканчивается приветственным комментарием.
    #[test]
    fn test_stream_preamble_layout() {
        let preamble = stream_preamble();
        let text = std::str::from_utf8(&preamble).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/event-stream\r\n"));
        assert!(text.contains("Cache-Control: no-cache\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n: connected\n\n"));
    }
}
