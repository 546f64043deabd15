use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use ticker_core::{ClientMessage, ServerMessage, Tick};
use ticker_price_feed::AggregationEngine;
use ticker_server::{EndpointRegistry, EndpointServer, EndpointServerBuilder, FanOutRouter};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn router() -> Arc<FanOutRouter> {
    Arc::new(FanOutRouter::new(
        Arc::new(AggregationEngine::default()),
        Arc::new(EndpointRegistry::new()),
    ))
}

async fn spawn_server(router: Arc<FanOutRouter>) -> (String, oneshot::Sender<()>) {
    let (url, _server, shutdown) = spawn_server_with_buffer(router, 64).await;
    (url, shutdown)
}

async fn spawn_server_with_buffer(
    router: Arc<FanOutRouter>,
    buffer: usize,
) -> (String, Arc<EndpointServer>, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = Arc::new(EndpointServerBuilder::new().endpoint_buffer(buffer).build(router));
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        serving.serve(listener, shutdown_rx).await.unwrap();
    });

    (url, server, shutdown_tx)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");

        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(client: &mut Client, msg: ClientMessage) {
    client
        .send(Message::Text(msg.to_json().unwrap()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_websocket_consumers_receive_snapshot_updates_and_own_datasets() {
    let router = router();
    router.on_tick_batch(&[Tick::new("AAPL", 100.0)]);
    let (url, shutdown) = spawn_server(Arc::clone(&router)).await;

    let (mut a, _) = connect_async(url.as_str()).await.unwrap();
    let (mut b, _) = connect_async(url.as_str()).await.unwrap();

    let init_a = next_json(&mut a).await;
    let init_b = next_json(&mut b).await;
    assert_eq!(init_a["type"], "init");
    assert_eq!(init_a["data"]["AAPL"]["price"], "100.00");
    assert_eq!(init_b["type"], "init");

    router.on_tick_batch(&[Tick::new("AAPL", 110.0), Tick::new("MSFT", 50.0)]);

    for client in [&mut a, &mut b] {
        let update = next_json(client).await;
        assert_eq!(update["type"], "update");
        assert_eq!(update["data"][0]["name"], "AAPL");
        assert_eq!(update["data"][0]["state"]["change"], "10.00");
        assert_eq!(update["data"][0]["state"]["low"], "100.00");
        assert_eq!(update["data"][1]["name"], "MSFT");
    }

    send(&mut a, ClientMessage::GetDataSet("AAPL".to_string())).await;
    let dataset = next_json(&mut a).await;
    assert_eq!(dataset["type"], "dataset");
    assert_eq!(dataset["data"]["name"], "AAPL");
    assert_eq!(dataset["data"]["dataset"].as_array().unwrap().len(), 2);
    assert_eq!(dataset["data"]["dataset"][1]["price"], "110.00");

    // b never sees a's dataset: its next frame is the following update
    router.on_tick_batch(&[Tick::new("MSFT", 55.0)]);
    assert_eq!(next_json(&mut b).await["type"], "update");
    assert_eq!(next_json(&mut a).await["type"], "update");

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_unknown_instrument_and_bad_frames_over_websocket() {
    let router = router();
    let (url, shutdown) = spawn_server(Arc::clone(&router)).await;

    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "init");

    client
        .send(Message::Text(r#"{"type":"bogus","data":1}"#.to_string()))
        .await
        .unwrap();
    send(&mut client, ClientMessage::GetDataSet("NOPE".to_string())).await;

    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "dataset");
    assert_eq!(reply["data"]["dataset"], serde_json::json!([]));

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_close_message_unregisters_endpoint() {
    let router = router();
    let (url, shutdown) = spawn_server(Arc::clone(&router)).await;

    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "init");
    assert_eq!(router.registry().len(), 1);

    send(&mut client, ClientMessage::Close).await;
    wait_until("endpoint unregistered", || router.registry().is_empty()).await;

    assert_eq!(router.on_tick_batch(&[Tick::new("X", 1.0)]), 0);
    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consumer_that_stops_reading_is_disconnected() {
    let router = router();
    let (url, server, shutdown) = spawn_server_with_buffer(Arc::clone(&router), 4).await;

    // Connected, but never polled again
    let (_silent, _) = connect_async(url.as_str()).await.unwrap();
    wait_until("endpoint registered", || router.registry().len() == 1).await;
    assert_eq!(server.open_connections(), 1);

    let mut round = 0u32;
    while !router.registry().is_empty() {
        assert!(round < 10_000, "lagging endpoint was never dropped");
        let batch: Vec<Tick> = (0..2_000)
            .map(|i| Tick::new(format!("SYM{}", i), 1.0 + f64::from(round)))
            .collect();
        router.on_tick_batch(&batch);
        round += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    wait_until("connection task finished", || server.open_connections() == 0).await;
    let _ = shutdown.send(());
}

#[test]
fn test_in_process_endpoints_share_one_snapshot_then_updates() {
    let router = router();
    let (_a, mut rx_a) = router.connect(8);

    router.on_tick_batch(&[Tick::new("X", 1.0)]);
    let (_b, mut rx_b) = router.connect(8);

    assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::Init(s)) if s.is_empty()));
    assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::Update(_))));
    match rx_b.try_recv() {
        Ok(ServerMessage::Init(snapshot)) => {
            assert_eq!(snapshot["X"].price, Decimal::new(100, 2));
        }
        other => panic!("expected init, got {:?}", other),
    }
    assert!(rx_b.try_recv().is_err());
}

#[test]
fn test_endpoints_gone_before_broadcast_are_pruned() {
    let router = router();
    let mut receivers = Vec::new();
    for _ in 0..8 {
        let (id, mut rx) = router.connect(8);
        rx.try_recv().unwrap();
        receivers.push((id, rx));
    }

    // Half of the consumers go away between batches without saying so
    let survivors: Vec<_> = receivers
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| (i % 2 == 0).then_some(entry))
        .collect();

    let delivered = router.on_tick_batch(&[Tick::new("X", 1.0)]);
    assert_eq!(delivered, 4);
    assert_eq!(router.registry().len(), 4);

    for (_, mut rx) in survivors {
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Update(_))));
    }
}

#[test]
fn test_disconnects_racing_broadcasts_leave_survivors_served() {
    const BATCHES: usize = 200;

    let router = router();
    let (keeper, mut keeper_rx) = router.connect(BATCHES + 1);
    assert!(matches!(keeper_rx.try_recv(), Ok(ServerMessage::Init(_))));

    let mut churned = Vec::new();
    for _ in 0..64 {
        let (id, rx) = router.connect(BATCHES + 1);
        churned.push((id, rx));
    }
    let churned_ids: Vec<_> = churned.iter().map(|(id, _)| *id).collect();

    let disconnecter = {
        let router = Arc::clone(&router);
        std::thread::spawn(move || {
            for id in churned_ids {
                assert!(router.on_disconnect(id));
                std::thread::yield_now();
            }
        })
    };

    for i in 0..BATCHES {
        router.on_tick_batch(&[Tick::new("X", 1.0 + i as f64)]);
    }
    disconnecter.join().unwrap();

    assert_eq!(router.registry().len(), 1);
    assert!(router.registry().contains(keeper));
    for _ in 0..BATCHES {
        assert!(matches!(keeper_rx.try_recv(), Ok(ServerMessage::Update(_))));
    }
    assert!(keeper_rx.try_recv().is_err());
    assert_eq!(router.stats().dropped_endpoints, 0);
    drop(churned);
}
