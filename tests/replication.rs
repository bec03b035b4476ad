use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use replicated_notes::{
    frame::{encode_http_response, read_frame, Framing},
    primary::Primary,
    replica::{self, ReplicaConfig, DEFAULT_WORKERS},
    store::PrimaryStore,
    upstream,
    request::Method,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, oneshot},
    time::timeout,
};

const TICK: Duration = Duration::from_secs(1);

struct RunningPrimary {
    addr: SocketAddr,
    store: Arc<PrimaryStore>,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

async fn spawn_primary() -> Result<RunningPrimary> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let store = Arc::new(PrimaryStore::new());
    let primary = Primary::new(listener, Arc::clone(&store));
    let addr = primary.local_addr()?;

    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _ = primary
            .run_until(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    Ok(RunningPrimary {
        addr,
        store,
        shutdown,
        task,
    })
}

/// A stand-in replica that records every backup push it receives and always
/// acknowledges. `label` goes into the shared order log.
async fn spawn_fake_replica(
    label: u16,
    order: Arc<Mutex<Vec<u16>>>,
) -> (u16, mpsc::UnboundedReceiver<String>) {
    let (pushes_tx, pushes_rx) = mpsc::unbounded_channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake replica");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(Some(message)) = read_frame(&mut stream, Framing::HeaderDelimited).await else {
                continue;
            };
            order.lock().unwrap().push(label);
            let _ = pushes_tx.send(message);
            let ack = encode_http_response("{\"update\":\"successful\"}");
            let _ = stream.write_all(ack.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (port, pushes_rx)
}

/// Grabs a currently-free port for a component that needs to know its own
/// port number before binding.
fn reserve_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    listener.local_addr().expect("addr").port()
}

fn create_body(title: &str, body: &str) -> String {
    format!("{{\"title\":\"{title}\",\"body\":\"{body}\"}}")
}

#[tokio::test]
async fn bootstrap_seeds_snapshot_and_registers_for_pushes() -> Result<()> {
    let primary = spawn_primary().await?;
    upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("first", "note")),
    )
    .await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let (port, mut pushes) = spawn_fake_replica(1, Arc::clone(&order)).await;

    let snapshot = upstream::bootstrap(primary.addr, port).await?;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].title, "first");

    upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("second", "note")),
    )
    .await?;

    let push = timeout(TICK, pushes.recv())
        .await?
        .expect("replica should receive a backup push");
    assert!(push.starts_with("POST /backup HTTP/1.1\r\n"));
    assert!(push.ends_with(&create_body("second", "note")));

    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}

#[tokio::test]
async fn updates_and_deletes_fan_out_to_replicas() -> Result<()> {
    let primary = spawn_primary().await?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let (port, mut pushes) = spawn_fake_replica(1, Arc::clone(&order)).await;
    upstream::bootstrap(primary.addr, port).await?;

    upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("a", "b")),
    )
    .await?;
    timeout(TICK, pushes.recv()).await?.expect("create push");

    let patched = upstream::call(
        primary.addr,
        Method::Patch,
        "/primary/1",
        Some("{\"title\":\"x\"}"),
    )
    .await?;
    assert_eq!(patched, "{\"id\":1,\"title\":\"x\",\"body\":\"b\"}");
    let push = timeout(TICK, pushes.recv()).await?.expect("patch push");
    assert!(push.starts_with("PATCH /backup/1 HTTP/1.1\r\n"));

    let deleted = upstream::call(primary.addr, Method::Delete, "/primary/1", None).await?;
    assert_eq!(deleted, "{\"msg\":\"OK\"}");
    let push = timeout(TICK, pushes.recv()).await?.expect("delete push");
    assert!(push.starts_with("DELETE /backup/1 HTTP/1.1\r\n"));

    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}

#[tokio::test]
async fn fan_out_follows_registration_order() -> Result<()> {
    let primary = spawn_primary().await?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let (port_a, mut pushes_a) = spawn_fake_replica(1, Arc::clone(&order)).await;
    let (port_b, mut pushes_b) = spawn_fake_replica(2, Arc::clone(&order)).await;

    upstream::bootstrap(primary.addr, port_a).await?;
    upstream::bootstrap(primary.addr, port_b).await?;

    upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("a", "b")),
    )
    .await?;

    timeout(TICK, pushes_a.recv()).await?.expect("push to a");
    timeout(TICK, pushes_b.recv()).await?.expect("push to b");
    // Each push is awaited before the next starts, so the order log is
    // deterministic.
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);

    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}

#[tokio::test]
async fn failed_push_aborts_the_writer_after_earlier_effects() -> Result<()> {
    let primary = spawn_primary().await?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let (port_a, mut pushes_a) = spawn_fake_replica(1, Arc::clone(&order)).await;
    let dead_port = reserve_port();

    upstream::bootstrap(primary.addr, port_a).await?;
    upstream::bootstrap(primary.addr, dead_port).await?;

    let written = upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("a", "b")),
    )
    .await;
    // The push to the dead port fails after the table and the first replica
    // already took the mutation; the writer gets no response, and nothing is
    // rolled back.
    assert!(written.is_err());
    timeout(TICK, pushes_a.recv())
        .await?
        .expect("first replica already received the push");
    assert_eq!(primary.store.list_all().len(), 1);

    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}

#[tokio::test]
async fn unregister_stops_backup_pushes() -> Result<()> {
    let primary = spawn_primary().await?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let (port, mut pushes) = spawn_fake_replica(1, Arc::clone(&order)).await;

    upstream::bootstrap(primary.addr, port).await?;
    upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("a", "b")),
    )
    .await?;
    timeout(TICK, pushes.recv()).await?.expect("push");

    let ack = upstream::unregister(primary.addr, port).await?;
    assert_eq!(ack, "{\"unregister\":\"successful\"}");

    upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("c", "d")),
    )
    .await?;
    assert!(
        timeout(Duration::from_millis(200), pushes.recv()).await.is_err(),
        "no push should arrive after unregistering"
    );

    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}

struct RunningReplica {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

async fn spawn_replica(primary: SocketAddr) -> RunningReplica {
    let port = reserve_port();
    let config = ReplicaConfig {
        name: "App test LS".into(),
        ip: "127.0.0.1".parse().expect("ip"),
        port,
        primary,
        workers: DEFAULT_WORKERS,
    };
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _ = replica::run_until(config, async move {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    // Wait until the replica's listener answers before returning.
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return RunningReplica {
                port,
                shutdown,
                task,
            };
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("replica did not start listening on port {port}");
}

async fn ask_replica(port: u16, envelope: &str) -> Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(envelope.as_bytes()).await?;
    let mut buffer = vec![0u8; 64 * 1024];
    let count = timeout(TICK, stream.read(&mut buffer)).await??;
    Ok(String::from_utf8_lossy(&buffer[..count]).into_owned())
}

#[tokio::test]
async fn write_forward_read_local_end_to_end() -> Result<()> {
    let primary = spawn_primary().await?;
    let replica = spawn_replica(primary.addr).await;

    let created = ask_replica(
        replica.port,
        "{\"method\":\"POST\",\"path\":\"/notes\",\"body\":{\"title\":\"a\",\"body\":\"b\"}}",
    )
    .await?;
    assert_eq!(created, "{\"id\":1,\"title\":\"a\",\"body\":\"b\"}");

    // The primary acknowledged only after the backup push, so the cache
    // already holds the record.
    let read = ask_replica(replica.port, "{\"method\":\"GET\",\"path\":\"/notes/1\"}").await?;
    assert_eq!(read, "{\"id\":1,\"title\":\"a\",\"body\":\"b\"}");

    let deleted =
        ask_replica(replica.port, "{\"method\":\"DELETE\",\"path\":\"/notes/1\"}").await?;
    assert_eq!(deleted, "{\"msg\":\"OK\"}");

    let missing = ask_replica(replica.port, "{\"method\":\"GET\",\"path\":\"/notes/1\"}").await?;
    assert_eq!(missing, "{\"msg\":\"Not exist id - 1\"}");

    drop(replica.shutdown);
    let _ = replica.task.await;
    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}

#[tokio::test]
async fn udp_reads_come_from_the_cache() -> Result<()> {
    let primary = spawn_primary().await?;
    upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("a", "b")),
    )
    .await?;
    let replica = spawn_replica(primary.addr).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket
        .send_to(
            b"{\"method\":\"GET\",\"path\":\"/notes\"}",
            ("127.0.0.1", replica.port),
        )
        .await?;
    let mut buffer = vec![0u8; 64 * 1024];
    let (count, _) = timeout(TICK, socket.recv_from(&mut buffer)).await??;
    assert_eq!(
        String::from_utf8_lossy(&buffer[..count]),
        "[{\"id\":1,\"title\":\"a\",\"body\":\"b\"}]"
    );

    drop(replica.shutdown);
    let _ = replica.task.await;
    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}

#[tokio::test]
async fn replica_unregisters_on_clean_shutdown() -> Result<()> {
    let primary = spawn_primary().await?;
    let replica = spawn_replica(primary.addr).await;

    drop(replica.shutdown);
    let _ = replica.task.await;

    // With the registry empty again, a write needs no fan-out and succeeds.
    let created = upstream::call(
        primary.addr,
        Method::Post,
        "/primary",
        Some(&create_body("a", "b")),
    )
    .await?;
    assert_eq!(created, "{\"id\":1,\"title\":\"a\",\"body\":\"b\"}");

    drop(primary.shutdown);
    let _ = primary.task.await;
    Ok(())
}
