//! Интеграционные тесты graceful shutdown: останов сервера рвёт все
//! живые потоки, реестр пустеет, accept-цикл завершается.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
    time::timeout,
};

use pushka::{
    run_server, ConnectionConfig, ServerState, Settings, SseConnection, SubscriberId,
};

fn test_settings(max_connections: usize) -> Settings {
    Settings {
        listen_addr: "127.0.0.1:0".to_string(),
        heartbeat_interval_secs: 20,
        max_connections,
        log_level: "info".to_string(),
        log_json: false,
    }
}

async fn subscribe_raw(addr: std::net::SocketAddr, subscriber: &str) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET /events HTTP/1.1\r\nX-Subscriber-Id: {subscriber}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    client
}

/// Тест проверяет, что shutdown закрывает все живые потоки: клиенты
/// видят конец потока, реестр пустеет в пределах таймаута.
#[tokio::test]
async fn test_shutdown_closes_all_streams() {
    let state = Arc::new(ServerState::new(&test_settings(16)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(run_server(state.clone(), listener));

    let mut first = subscribe_raw(addr, "1").await;
    let mut second = subscribe_raw(addr, "2").await;

    timeout(Duration::from_secs(5), async {
        while state.registry().connection_count() != 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscribers never registered");

    state.shutdown();
    state
        .wait_for_shutdown(Duration::from_secs(5))
        .await
        .expect("connections did not close in time");
    assert_eq!(state.registry().connection_count(), 0);
    server.await.unwrap().unwrap();

    // Оба клиента дочитывают буферизованные кадры и видят EOF
    for client in [&mut first, &mut second] {
        let mut sink = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut sink))
            .await
            .expect("client never saw EOF")
            .expect("clean stream end");
    }
}

/// Тест проверяет, что shutdown, выданный ещё до запуска accept-цикла,
/// не теряется: цикл замечает его сразу и завершается.
#[tokio::test]
async fn test_shutdown_before_accept_loop_exits_immediately() {
    let state = Arc::new(ServerState::new(&test_settings(4)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    state.shutdown();
    timeout(Duration::from_secs(2), run_server(state, listener))
        .await
        .expect("accept loop ignored a shutdown issued before start")
        .unwrap();
}

/// Тест проверяет, что соединение, зарегистрировавшееся уже после первого
/// close_all, всё равно закрывается: wait_for_shutdown повторяет close_all,
/// пока реестр не опустеет.
#[tokio::test]
async fn test_connection_registered_after_shutdown_is_drained() {
    let state = Arc::new(ServerState::new(&test_settings(4)));
    state.shutdown();

    // Соединение не видело ни broadcast-сигнала, ни первого close_all
    let (server_io, mut client) = duplex(4096);
    let (read_half, write_half) = tokio::io::split(server_io);
    let conn = SseConnection::new(
        state.registry().clone(),
        ConnectionConfig::default(),
        SubscriberId::from("late"),
        read_half,
        write_half,
        Arc::new(Notify::new()),
    );
    let task = tokio::spawn(conn.run());

    timeout(Duration::from_secs(5), async {
        while state.registry().connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("late connection never registered");

    state
        .wait_for_shutdown(Duration::from_secs(5))
        .await
        .expect("late connection was never drained");
    assert_eq!(state.registry().connection_count(), 0);
    task.await.unwrap().unwrap();

    // Клиент дочитывает преамбулу и видит конец потока
    let mut sink = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut sink))
        .await
        .expect("client never saw EOF")
        .expect("clean stream end");
}

/// Тест проверяет лимит соединений: сверхлимитный клиент получает 503,
/// уже подключённые потоки продолжают жить.
#[tokio::test]
async fn test_connection_limit_rejects_with_503() {
    let state = Arc::new(ServerState::new(&test_settings(1)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(run_server(state.clone(), listener));

    let _subscribed = subscribe_raw(addr, "1").await;
    timeout(Duration::from_secs(5), async {
        while state.registry().connection_count() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber never registered");
    assert_eq!(state.active_connections(), 1);

    let mut rejected = TcpStream::connect(addr).await.unwrap();
    rejected
        .write_all(b"GET /events HTTP/1.1\r\nX-Subscriber-Id: 2\r\n\r\n")
        .await
        .unwrap();
    let mut buf = vec![0u8; 128];
    let n = timeout(Duration::from_secs(5), rejected.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 503"));

    // Лимит не тронул живое соединение
    assert_eq!(state.registry().connection_count(), 1);

    state.shutdown();
    server.await.unwrap().unwrap();
}
