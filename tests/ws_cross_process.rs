use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use orderfeed::model::{NewOrder, OrderStatus};
use orderfeed::{Database, OrderStore, RelayConfig, ServerMessage};
use serde_json::Value;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

fn reserve_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn wait_until_watching(port: u16) {
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(response) = client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
        {
            if let Ok(body) = response.json::<Value>().await {
                if body["feed"]["status"] == "watching" {
                    return;
                }
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("relay never started watching the change log");
}

async fn collect_updates<S>(read: &mut S, count: usize) -> Vec<(String, String)>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut seen = Vec::new();
    while seen.len() < count {
        let frame = timeout(Duration::from_secs(5), read.next())
            .await
            .expect("relay message in time")
            .expect("socket open")
            .expect("frame ok");
        let Message::Text(text) = frame else { continue };
        match serde_json::from_str::<ServerMessage>(text.as_str()).unwrap() {
            ServerMessage::OrderUpdate(envelope) => seen.push((
                envelope.operation().as_str().to_string(),
                envelope.key().unwrap_or_default().to_string(),
            )),
            ServerMessage::InitialOrders(_) => {}
            other => panic!("unexpected {}", other.name()),
        }
    }
    seen
}

/// A writer with its own connection to the database file stands in for a
/// separate process; both observers see its commits in the same order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observers_see_external_writes_in_commit_order() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("orders.db");
    let port = reserve_port().unwrap();

    let config = RelayConfig {
        port,
        database_path: db_path.clone(),
        feed_poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let server = tokio::spawn(async move {
        let _ = orderfeed::server::serve(config).await;
    });
    wait_until_watching(port).await;

    let url = format!("ws://127.0.0.1:{port}/ws");
    let (ws_a, _) = tokio_tungstenite::connect_async(url.clone()).await.expect("ws A");
    let (ws_b, _) = tokio_tungstenite::connect_async(url).await.expect("ws B");
    let (_write_a, mut read_a) = ws_a.split();
    let (_write_b, mut read_b) = ws_b.split();

    // Both sessions are attached once their snapshots arrive.
    for read in [&mut read_a, &mut read_b] {
        let frame = timeout(Duration::from_secs(5), read.next()).await.unwrap().unwrap().unwrap();
        let Message::Text(text) = frame else { panic!("expected text frame") };
        assert!(matches!(
            serde_json::from_str::<ServerMessage>(text.as_str()).unwrap(),
            ServerMessage::InitialOrders(_)
        ));
    }

    let external = Database::open(&db_path).unwrap();
    let writer = OrderStore::new(Arc::new(external));
    let mut ids = Vec::new();
    for customer in ["Grace Hopper", "Alan Turing", "Barbara Liskov"] {
        let draft = NewOrder::new(customer, "Keyboard", OrderStatus::Pending)
            .validate()
            .unwrap();
        ids.push(writer.insert(draft).await.unwrap().id);
    }
    writer.update_status(&ids[0], OrderStatus::Delivered).await.unwrap();
    writer.delete(&ids[1]).await.unwrap();

    let expected = vec![
        ("insert".to_string(), ids[0].clone()),
        ("insert".to_string(), ids[1].clone()),
        ("insert".to_string(), ids[2].clone()),
        ("update".to_string(), ids[0].clone()),
        ("delete".to_string(), ids[1].clone()),
    ];
    assert_eq!(collect_updates(&mut read_a, expected.len()).await, expected);
    assert_eq!(collect_updates(&mut read_b, expected.len()).await, expected);

    server.abort();
}
