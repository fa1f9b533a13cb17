use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;

/// Максимальный размер заголовка запроса.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;
/// Максимальное число заголовков в запросе.
const MAX_HEADERS: usize = 64;

/// Разобранный заголовок HTTP-запроса: строка запроса и заголовки.
/// Тело (при наличии) остаётся в читателе.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Ищет заголовок без учёта регистра имени.
    pub fn header(
        &self,
        name: &str,
    ) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Заявленная длина тела; 0, если заголовка нет или он нечитаем.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Читает строку запроса и заголовки до пустой строки.
///
/// # Возвращает
/// - `Ok(RequestHead)` — разобранный заголовок
/// - `Err(HandshakeError)` — обрыв, превышение лимитов или мусор вместо
///   HTTP
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut total = 0usize;

    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(HandshakeError::UnexpectedEof);
    }
    total += n;

    let request_line = line.trim_end();
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version), None) if version.starts_with("HTTP/") => {
            (method.to_string(), path.to_string())
        }
        _ => return Err(HandshakeError::MalformedRequestLine(request_line.to_string())),
    };

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
        total += n;
        if total > MAX_HEAD_BYTES || headers.len() >= MAX_HEADERS {
            return Err(HandshakeError::HeadTooLarge);
        }

        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(HandshakeError::MalformedHeader(trimmed.to_string()));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        path,
        headers,
    })
}

/// Читает тело запроса заявленной длины с жёстким потолком размера.
pub async fn read_body<R>(
    reader: &mut R,
    len: usize,
    max: usize,
) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    if len > max {
        return Err(HandshakeError::BodyTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HandshakeError::UnexpectedEof
        } else {
            HandshakeError::Io(e)
        }
    })?;
    Ok(body)
}

/// Пишет короткий ответ без тела и сбрасывает буфер.
pub async fn write_status<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response =
        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет разбор обычного GET-запроса с заголовками.
    #[tokio::test]
    async fn test_parse_get_request() {
        let raw = b"GET /events HTTP/1.1\r\nHost: localhost\r\nX-Subscriber-Id: 42\r\n\r\n";
        let head = read_request_head(&mut &raw[..]).await.unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/events");
        assert_eq!(head.header("x-subscriber-id"), Some("42"));
        assert_eq!(head.header("X-SUBSCRIBER-ID"), Some("42"));
        assert_eq!(head.header("missing"), None);
        assert_eq!(head.content_length(), 0);
    }

    /// Тест проверяет разбор POST с Content-Length и чтение тела.
    #[tokio::test]
    async fn test_parse_post_with_body() {
        let raw = b"POST /publish HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd";
        let mut reader = &raw[..];
        let head = read_request_head(&mut reader).await.unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.content_length(), 4);
        let body = read_body(&mut reader, head.content_length(), 1024).await.unwrap();
        assert_eq!(body, b"abcd");
    }

    /// Тест проверяет, что мусор вместо строки запроса отклоняется.
    #[tokio::test]
    async fn test_malformed_request_line() {
        let raw = b"NOT HTTP\r\n\r\n";
        let err = read_request_head(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedRequestLine(_)));
    }

    /// Тест проверяет, что заголовок без двоеточия отклоняется.
    #[tokio::test]
    async fn test_malformed_header() {
        let raw = b"GET / HTTP/1.1\r\nbroken header line\r\n\r\n";
        let err = read_request_head(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedHeader(_)));
    }

    /// Тест проверяет, что обрыв до пустой строки даёт UnexpectedEof.
    #[tokio::test]
    async fn test_truncated_head() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n";
        let err = read_request_head(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedEof));
    }

    /// Тест проверяет потолок размера тела.
    #[tokio::test]
    async fn test_body_too_large() {
        let raw = b"xxxx";
        let err = read_body(&mut &raw[..], 4, 3).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BodyTooLarge(4)));
    }

    /// Тест проверяет формат короткого статус-ответа.
    #[tokio::test]
    async fn test_write_status() {
        let mut out = Vec::new();
        write_status(&mut out, 404, "Not Found").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
