//! Client dispatch against a live responder: echo, callbacks, timeouts,
//! error answers and close.

mod common;

use common::Responder;
use network::{Client, ClientError, ConnectionState, SequenceGenerator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[test_log::test(tokio::test)]
async fn test_echo_roundtrip() {
    let responder = Responder::start().await;
    let client = Client::new(responder.config()).unwrap();

    let args = HashMap::from([("x".to_string(), 1)]);
    let answer = client.send_quest("echo", &args, None).await.unwrap();

    let echoed: HashMap<String, i32> = answer.decode().unwrap();
    assert_eq!(echoed, args);
    assert_eq!(answer.status(), 0);
    assert!(client.is_connected());
    assert_eq!(client.pending_count(), 0);

    let stats = client.stats();
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.frames_received, 1);

    client.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_lazy_and_explicit_connect() {
    let responder = Responder::start().await;
    let client = Client::new(responder.config()).unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    // already connected
    client.connect().await.unwrap();

    client.send_quest("echo", &1, None).await.unwrap();
    assert_eq!(responder.connections(), 1);
}

#[test_log::test(tokio::test)]
async fn test_oneway_carries_no_sequence() {
    let responder = Responder::start().await;
    let client = Client::new(responder.config()).unwrap();

    client.send_oneway("notify", &"hello").await.unwrap();
    // twoway afterwards so the oneway has been read by the time we look
    client.send_quest("echo", &(), None).await.unwrap();

    let seen = responder.seen();
    assert_eq!(seen[0].method, "notify");
    assert_eq!(seen[0].sequence, None);
    assert_eq!(seen[1].sequence, Some(1));
    assert_eq!(client.pending_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_callback_receives_answer() {
    let responder = Responder::start().await;
    let client = Client::new(responder.config()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .send_quest_with_callback("echo", &vec![1, 2, 3], None, move |outcome| {
            tx.send(outcome).unwrap();
        })
        .await;

    let answer = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(answer.decode::<Vec<i32>>().unwrap(), vec![1, 2, 3]);
}

#[test_log::test(tokio::test)]
async fn test_quest_times_out() {
    let responder = Responder::start().await;
    let client = Client::new(responder.config()).unwrap();

    let started = std::time::Instant::now();
    let err = client
        .send_quest("silent", &(), Some(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Timeout { ref method, timeout_ms: 200, .. } if method == "silent"
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.pending_count(), 0);
    // a timeout leaves the connection usable
    assert!(client.is_connected());
    client.send_quest("echo", &(), None).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_error_status_answer() {
    let responder = Responder::start().await;
    let client = Client::new(responder.config()).unwrap();

    let err = client.send_quest("fail", &(), None).await.unwrap_err();
    match err {
        ClientError::Answer { status, code, ex } => {
            assert_eq!(status, 1);
            assert_eq!(code, 500);
            assert_eq!(ex, "failure");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_callbacks_resolve_exactly_once() {
    const QUESTS: u32 = 200;

    let responder = Responder::start().await;
    let client = Client::new(responder.config()).unwrap();
    let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..QUESTS).map(|_| AtomicUsize::new(0)).collect());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let mut senders = Vec::new();
    for i in 0..QUESTS {
        let client = client.clone();
        let hits = hits.clone();
        let done_tx = done_tx.clone();
        senders.push(tokio::spawn(async move {
            // silent quests expire at staggered deadlines, echoes use the default
            let (method, deadline) = if i % 2 == 0 {
                ("echo", None)
            } else {
                ("silent", Some(Duration::from_millis(50 + u64::from(i % 7) * 20)))
            };
            client
                .send_quest_with_callback(method, &i, deadline, move |outcome| {
                    hits[i as usize].fetch_add(1, Ordering::SeqCst);
                    done_tx.send((i, outcome.is_ok())).unwrap();
                })
                .await;
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }
    drop(done_tx);

    let mut answered = 0;
    for _ in 0..QUESTS {
        let (i, ok) = timeout(Duration::from_secs(10), done_rx.recv()).await.unwrap().unwrap();
        assert_eq!(ok, i % 2 == 0, "quest {i} resolved with the wrong outcome");
        answered += 1;
    }
    assert_eq!(answered, QUESTS);

    // nothing resolves twice even after further sweeps
    tokio::time::sleep(Duration::from_millis(200)).await;
    for (i, count) in hits.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "quest {i}");
    }
    assert_eq!(client.pending_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_close_fails_pending_and_rejects_new_quests() {
    let responder = Responder::start().await;
    let client = Client::new(responder.config().with_quest_timeout(Duration::ZERO)).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .send_quest_with_callback("silent", &(), None, move |outcome| {
            tx.send(outcome).unwrap();
        })
        .await;
    assert_eq!(client.pending_count(), 1);

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    let outcome = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(ClientError::Closed)));
    assert!(matches!(
        client.send_quest("echo", &(), None).await,
        Err(ClientError::Closed)
    ));
    // closing twice is harmless
    client.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_sequence_wraps_on_the_wire() {
    let responder = Responder::start().await;
    let sequence = Arc::new(SequenceGenerator::starting_after(codec::MAX_SEQUENCE - 2));
    let client = Client::with_sequence(responder.config(), sequence).unwrap();

    for _ in 0..4 {
        client.send_quest("echo", &(), None).await.unwrap();
    }

    let sequences: Vec<_> = responder.seen().into_iter().map(|q| q.sequence.unwrap()).collect();
    assert_eq!(sequences, vec![codec::MAX_SEQUENCE - 1, codec::MAX_SEQUENCE, 1, 2]);
}

#[test]
fn test_blocking_quest_from_plain_thread() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let responder = runtime.block_on(Responder::start());
    let client = {
        let _guard = runtime.enter();
        Client::new(responder.config()).unwrap()
    };

    let answer = client.send_quest_blocking("echo", &"blocking", None).unwrap();
    assert_eq!(answer.decode::<String>().unwrap(), "blocking");

    let err = client
        .send_quest_blocking("silent", &(), Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(err.is_timeout());

    runtime.block_on(client.close()).unwrap();
}
