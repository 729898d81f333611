//! End-to-end coverage of the remote protocol: client and server talking
//! over loopback TCP, transactions held across requests, the idle-lock
//! reaper, auth enforcement and the operation journal.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use heron_client::{Client, ClientError};
use heron_server::{Server, ServerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct S {
    s: Option<Box<S>>,
    a: String,
    b: i64,
    c: f64,
}

async fn start(mut mutate: impl FnMut(&mut ServerConfig)) -> (Arc<Server>, String, tokio::sync::oneshot::Sender<()>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::new(dir.path());
    mutate(&mut config);
    let server = Server::new(config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(server.clone().run(listener, async {
        let _ = stopped.await;
    }));

    (server, format!("http://{addr}"), stop, dir)
}

fn client(url: &str) -> Client {
    let mut c = Client::new(url);
    c.retry_count = 3;
    c.retry_sleep = Duration::from_millis(10);
    c
}

#[tokio::test]
async fn no_tx_roundtrip_and_cache() {
    let (_srv, url, _stop, _dir) = start(|_| {}).await;
    let c = client(&url);

    let sp = S {
        a: "test".into(),
        b: 123,
        c: 123.456,
        s: Some(Box::new(S { a: "-".into(), b: 321, c: 654.321, ..Default::default() })),
    };
    c.put("shinyDB", "someBucket", "key", &sp).await.unwrap();

    let got: S = c.get("shinyDB", "someBucket", "key").await.unwrap();
    assert_eq!(got, sp);

    // same answer straight from the server once the cache is dropped
    c.clear_cache();
    let got: S = c.get("shinyDB", "someBucket", "key").await.unwrap();
    assert_eq!(got, sp);

    let mut found = false;
    c.for_each::<S, _>("shinyDB", "someBucket", |key, v| {
        if key == "key" && v.a == "test" && v.b == 123 {
            found = true;
        }
        Ok(())
    })
    .await
    .unwrap();
    assert!(found, "for_each missed the stored key");

    c.delete("shinyDB", "someBucket", "key").await.unwrap();
    let missing = c.get::<S>("shinyDB", "someBucket", "key").await;
    assert!(matches!(missing, Err(ClientError::NotFound(_))));

    // a never-written bucket streams nothing and no error
    let mut n = 0;
    c.for_each::<S, _>("shinyDB", "emptyBucket", |_, _: S| {
        n += 1;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn tx_happy_path_survives_commit() {
    let (_srv, url, _stop, _dir) = start(|_| {}).await;
    let c = client(&url);
    const DB: &str = "shinyDB";
    const BUCKET: &str = "someBucket";

    let mut tx = c.begin(DB).await.unwrap();
    tx.set_next_index(BUCKET, 100).await.unwrap();
    for _ in 0..100 {
        let id = tx.next_index(BUCKET).await.unwrap();
        let v = S {
            a: "test".into(),
            s: Some(Box::new(S { b: id as i64, ..Default::default() })),
            ..Default::default()
        };
        tx.put(BUCKET, &(id + 1000).to_string(), &v).await.unwrap();
    }

    // the open transaction observes its own writes
    let mut seen = 0;
    let mut found = false;
    tx.for_each::<S, _>(BUCKET, |key, v| {
        seen += 1;
        if key == "1105" {
            assert_eq!(v.s.as_ref().map(|s| s.b), Some(105));
            found = true;
        }
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(seen, 100);
    assert!(found);

    let direct: S = tx.get(BUCKET, "1105").await.unwrap();
    assert_eq!(direct.a, "test");
    assert_eq!(direct.s.map(|s| s.b), Some(105));

    tx.commit().await.unwrap();

    // a brand-new client reads the committed data
    let fresh = client(&url);
    let v: S = fresh.get(DB, BUCKET, "1105").await.unwrap();
    assert_eq!(v.s.map(|s| s.b), Some(105));

    // delete inside a second transaction
    let mut tx = fresh.begin(DB).await.unwrap();
    tx.delete(BUCKET, "1105").await.unwrap();
    assert!(tx.get::<S>(BUCKET, "1105").await.is_err());
    tx.commit().await.unwrap();

    let gone = client(&url).get::<S>(DB, BUCKET, "1105").await;
    assert!(gone.is_err());
}

#[tokio::test]
async fn idle_lock_is_reaped_and_later_ops_fail() {
    let (srv, url, _stop, _dir) = start(|c| c.max_unused_lock = Duration::from_millis(100)).await;
    let c = client(&url);

    let mut tx = c.begin("shinyDB").await.unwrap();
    tx.put("someBucket", "1005", &S { a: "test".into(), ..Default::default() }).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let late = tx.put("someBucket", "1005", &S { a: "late".into(), ..Default::default() }).await;
    assert!(matches!(late, Err(ClientError::NotFound(_))), "expected the lock to be gone");
    assert!(tx.commit().await.is_err());

    let stats = srv.stats();
    assert!(stats.timeouts >= 1, "timeouts = {}", stats.timeouts);
    assert_eq!(stats.active_locks, 0);
}

#[tokio::test]
async fn commit_from_a_stale_handle_reports_no_lock() {
    let (_srv, url, _stop, _dir) = start(|_| {}).await;
    let c = client(&url);

    let tx = c.begin("lockDB").await.unwrap();
    // close() releases every held lock behind the transaction's back
    c.close().await.unwrap();
    assert!(matches!(tx.commit().await, Err(ClientError::NoLock(_))));
}

#[tokio::test]
async fn auth_is_enforced_when_configured() {
    let (_srv, url, _stop, _dir) =
        start(|c| c.auth_key = Some("da3b361b0a16be5c31e5ef87eb4a48dc".into())).await;

    let mut c = client(&url);
    let denied = c.put("shinyDB", "someBucket", "11111", &S::default()).await;
    assert!(matches!(denied, Err(ClientError::Unauthorized)));

    c.auth_key = Some("da3b361b0a16be5c31e5ef87eb4a48dc".into());
    c.put("shinyDB", "someBucket", "11111", &S { b: 5, ..Default::default() }).await.unwrap();
    let v: S = c.get("shinyDB", "someBucket", "11111").await.unwrap();
    assert_eq!(v.b, 5);
}

#[tokio::test]
async fn stats_json_is_served_over_plain_http() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (_srv, url, _stop, _dir) = start(|_| {}).await;
    let c = client(&url);
    c.put("jsonDB", "b", "k", &1u32).await.unwrap();

    let host = url.strip_prefix("http://").unwrap();
    let mut stream = tokio::net::TcpStream::connect(host).await.unwrap();
    stream
        .write_all(b"GET /stats.json HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");
    assert!(response.contains("\"activeLocks\":0"));
    assert!(response.contains("\"puts\":1"));
}

#[tokio::test]
async fn counters_and_journal_record_operations() {
    let (srv, url, _stop, _dir) = start(|_| {}).await;
    let c = client(&url);

    for i in 0..10u32 {
        c.put("statsDB", "b", &i.to_string(), &i).await.unwrap();
    }
    // drop the local cache so the read actually hits the server
    c.clear_cache();
    let _: u32 = c.get("statsDB", "b", "3").await.unwrap();
    c.delete("statsDB", "b", "3").await.unwrap();

    let tx = c.begin("statsDB").await.unwrap();
    tx.commit().await.unwrap();
    let tx = c.begin("statsDB").await.unwrap();
    tx.rollback().await.unwrap();

    // via the wire, not the in-process handle
    let stats = c.stats().await.unwrap();
    assert_eq!(stats.puts, 10);
    assert_eq!(stats.gets, 1);
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.locks, 2);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.active_locks, 0);
    assert_eq!(stats, srv.stats());

    // every operation made it into the JSON journal
    let raw = std::fs::read_to_string(srv.journal_path()).unwrap();
    let entries: Vec<heron_server::JournalEntry> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(entries.len() >= 14, "journal has {} entries", entries.len());
    assert!(entries.iter().any(|e| e.op == "Put" && e.db == "statsDB"));
    assert!(entries.iter().any(|e| e.op == "Begin"));
    assert!(entries.iter().any(|e| e.op == "Commit"));
    assert!(entries.iter().any(|e| e.op == "Rollback"));
}
