use thiserror::Error;

/// Ошибки HTTP-рукопожатия при приёме входящего соединения.
///
/// Все они локальны для одного соединения: клиент получает короткий
/// ответ со статусом, транспорт закрывается, сервер продолжает работу.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Request head too large")]
    HeadTooLarge,

    #[error("Request body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("Connection closed during handshake")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
