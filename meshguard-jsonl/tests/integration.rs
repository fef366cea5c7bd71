use meshguard::{EventEmitter, EventKind, ResilienceEvent};
use meshguard_jsonl::JsonlSink;
use std::time::Duration;
use tower_service::Service;

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let mut sink = JsonlSink::new(&path);

    let event = ResilienceEvent::new(EventKind::RetryAttempt, "payments")
        .with_meta("attempt", 1)
        .with_meta("delay_ms", 50);
    sink.call(event.clone()).await.unwrap();
    sink.call(ResilienceEvent::new(EventKind::CircuitOpened, "payments")).await.unwrap();

    let contents = std::fs::read_to_string(&path).expect("file");
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("retry_attempt"));
    let parsed: ResilienceEvent = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed, event);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn works_as_emitter_handler() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("emitted.jsonl");
    let emitter = EventEmitter::new();
    assert!(emitter.subscribe("jsonl", JsonlSink::new(&path)));

    for i in 0..10 {
        emitter.emit(ResilienceEvent::new(EventKind::RateLimitHit, "search").with_meta("seq", i));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while emitter.stats().delivered < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("events delivered");

    let contents = std::fs::read_to_string(&path).unwrap();
    let seqs: Vec<String> = contents
        .lines()
        .map(|l| serde_json::from_str::<ResilienceEvent>(l).unwrap())
        .map(|e| e.meta("seq").unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(seqs, expected, "per-handler order is publish order");
}
