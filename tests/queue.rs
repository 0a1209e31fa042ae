// Delivery, retry and dead-letter behavior of the message queue
//
// These tests run on a paused clock so backoff delays and ack deadlines
// elapse instantly while keeping their relative ordering.

use async_trait::async_trait;
use chrono::Utc;
use journal2parquet::dead_letter::DeadLetterQueue;
use journal2parquet::queue::{
    DeliveryAttempt, DeliveryReport, DeliveryTarget, MessageId, MessageQueue, MessageRecord,
    QueueSettings, QueueStore, Settlement, UploadEvent,
};
use opendal::{services, Operator};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

type Script = dyn Fn(&DeliveryAttempt) -> DeliveryReport + Send + Sync;

/// Delivery target whose outcome is decided per attempt, recording every call.
struct ScriptedTarget {
    script: Box<Script>,
    /// Simulated handling time per attempt.
    handling: Box<dyn Fn(u32) -> Duration + Send + Sync>,
    calls: Mutex<Vec<(MessageId, u32, Instant)>>,
}

impl ScriptedTarget {
    fn new(script: impl Fn(&DeliveryAttempt) -> DeliveryReport + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            handling: Box::new(|_| Duration::ZERO),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn with_handling(
        script: impl Fn(&DeliveryAttempt) -> DeliveryReport + Send + Sync + 'static,
        handling: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            handling: Box::new(handling),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(MessageId, u32, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    fn attempt_numbers(&self) -> Vec<u32> {
        self.calls().into_iter().map(|(_, n, _)| n).collect()
    }
}

#[async_trait]
impl DeliveryTarget for ScriptedTarget {
    async fn deliver(&self, attempt: DeliveryAttempt) -> DeliveryReport {
        self.calls.lock().unwrap().push((
            attempt.message_id.clone(),
            attempt.attempt_number,
            Instant::now(),
        ));
        let handling = (self.handling)(attempt.attempt_number);
        if !handling.is_zero() {
            tokio::time::sleep(handling).await;
        }
        (self.script)(&attempt)
    }
}

fn event() -> UploadEvent {
    UploadEvent::new("journals", "logs/2024-01-01.log", 1)
}

async fn settle(rx: &mut broadcast::Receiver<Settlement>, message_id: &MessageId) -> Settlement {
    loop {
        let settlement = rx.recv().await.expect("queue stopped broadcasting");
        if settlement.message_id() == message_id {
            return settlement;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_then_success_are_acknowledged() {
    let target = ScriptedTarget::new(|attempt| {
        if attempt.attempt_number < 5 {
            DeliveryReport::retryable("sink unavailable")
        } else {
            DeliveryReport::acknowledged()
        }
    });
    let dead_letters = DeadLetterQueue::new();
    let (queue, _task) = MessageQueue::new(QueueSettings::default())
        .on_delivery(target.clone())
        .dead_letters(dead_letters.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let message_id = queue.enqueue(event()).await.unwrap();
    let settlement = settle(&mut rx, &message_id).await;

    assert_eq!(
        settlement,
        Settlement::Acknowledged {
            message_id,
            attempts: 5
        }
    );
    assert_eq!(target.attempt_numbers(), vec![1, 2, 3, 4, 5]);
    assert!(dead_letters.is_empty());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.acknowledged_total, 1);
    assert_eq!(stats.retried_total, 4);
    assert_eq!(stats.delivered_total, 5);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_short_circuits_to_dead_letter() {
    let target = ScriptedTarget::new(|_| DeliveryReport::fatal("malformed input"));
    let dead_letters = DeadLetterQueue::new();
    let (queue, _task) = MessageQueue::new(QueueSettings::default())
        .on_delivery(target.clone())
        .dead_letters(dead_letters.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let message_id = queue.enqueue(event()).await.unwrap();
    let settlement = settle(&mut rx, &message_id).await;

    assert!(matches!(
        settlement,
        Settlement::DeadLettered { attempts: 1, .. }
    ));
    assert_eq!(target.attempt_numbers(), vec![1]);

    let entries = dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message_id, message_id);
    assert_eq!(entries[0].final_error, "malformed input");
    assert_eq!(entries[0].attempt_history.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_without_short_circuit_uses_full_budget() {
    let target = ScriptedTarget::new(|_| DeliveryReport::fatal("malformed input"));
    let dead_letters = DeadLetterQueue::new();
    let settings = QueueSettings {
        fatal_short_circuit: false,
        ..QueueSettings::default()
    };
    let (queue, _task) = MessageQueue::new(settings)
        .on_delivery(target.clone())
        .dead_letters(dead_letters.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let message_id = queue.enqueue(event()).await.unwrap();
    let settlement = settle(&mut rx, &message_id).await;

    assert!(matches!(
        settlement,
        Settlement::DeadLettered { attempts: 5, .. }
    ));
    assert_eq!(target.attempt_numbers(), vec![1, 2, 3, 4, 5]);
    assert_eq!(dead_letters.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_dead_lettered_with_history() {
    let target = ScriptedTarget::new(|attempt| {
        DeliveryReport::retryable(format!("timeout on attempt {}", attempt.attempt_number))
    });
    let dead_letters = DeadLetterQueue::new();
    let (queue, _task) = MessageQueue::new(QueueSettings::default())
        .on_delivery(target.clone())
        .dead_letters(dead_letters.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let message_id = queue.enqueue(event()).await.unwrap();
    let settlement = settle(&mut rx, &message_id).await;

    match settlement {
        Settlement::DeadLettered {
            attempts,
            final_error,
            ..
        } => {
            assert_eq!(attempts, 5);
            assert_eq!(final_error, "timeout on attempt 5");
        }
        other => panic!("expected dead letter, got {:?}", other),
    }

    let entries = dead_letters.entries();
    assert_eq!(entries.len(), 1);
    let numbers: Vec<u32> = entries[0]
        .attempt_history
        .iter()
        .map(|a| a.attempt_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert_eq!(entries[0].upload_event, entries[0].attempt_history[0].upload_event);

    // No sixth delivery after dead-lettering.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(target.calls().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn redelivery_gaps_follow_bounded_exponential_backoff() {
    let target = ScriptedTarget::new(|_| DeliveryReport::retryable("unavailable"));
    let (queue, _task) = MessageQueue::new(QueueSettings::default())
        .on_delivery(target.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let message_id = queue.enqueue(event()).await.unwrap();
    settle(&mut rx, &message_id).await;

    let times: Vec<Instant> = target.calls().into_iter().map(|(_, _, at)| at).collect();
    assert_eq!(times.len(), 5);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();

    // Paused time advances to the exact wake-up; allow for scheduling slack.
    let slack = Duration::from_millis(5);
    for (i, gap) in gaps.iter().enumerate() {
        assert!(
            *gap + slack >= Duration::from_secs(10) && *gap <= Duration::from_secs(600) + slack,
            "gap {} out of bounds: {:?}",
            i,
            gap
        );
    }
    for pair in gaps.windows(2) {
        assert!(pair[1] + slack >= pair[0], "gaps decreased: {:?}", gaps);
    }
    // Base delays are 10s, 20s, 40s, 80s plus at most 10% jitter.
    for (gap, base) in gaps.iter().zip([10u64, 20, 40, 80]) {
        assert!(*gap + slack >= Duration::from_secs(base));
        assert!(*gap <= Duration::from_secs_f64(base as f64 * 1.1) + slack);
    }
}

#[tokio::test(start_paused = true)]
async fn missed_ack_deadline_triggers_redelivery() {
    let target = ScriptedTarget::with_handling(
        |_| DeliveryReport::acknowledged(),
        |attempt| {
            if attempt == 1 {
                Duration::from_secs(120)
            } else {
                Duration::ZERO
            }
        },
    );
    let settings = QueueSettings {
        ack_deadline: Duration::from_secs(30),
        ..QueueSettings::default()
    };
    let (queue, _task) = MessageQueue::new(settings)
        .on_delivery(target.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let message_id = queue.enqueue(event()).await.unwrap();
    let settlement = settle(&mut rx, &message_id).await;

    assert_eq!(
        settlement,
        Settlement::Acknowledged {
            message_id,
            attempts: 2
        }
    );
    let calls = target.calls();
    assert_eq!(calls.len(), 2);
    // Deadline (30s) plus the first backoff (10s..11s).
    let gap = calls[1].2 - calls[0].2;
    assert!(gap >= Duration::from_secs(40), "gap was {:?}", gap);
    assert!(gap <= Duration::from_secs(42), "gap was {:?}", gap);
}

#[tokio::test(start_paused = true)]
async fn duplicate_events_are_independent_messages() {
    let target = ScriptedTarget::new(|_| DeliveryReport::acknowledged());
    let (queue, _task) = MessageQueue::new(QueueSettings::default())
        .on_delivery(target.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let first = queue.enqueue(event()).await.unwrap();
    let second = queue.enqueue(event()).await.unwrap();
    assert_ne!(first, second);

    let mut pending: HashSet<MessageId> = [first.clone(), second.clone()].into();
    while !pending.is_empty() {
        let settlement = rx.recv().await.unwrap();
        assert!(matches!(settlement, Settlement::Acknowledged { attempts: 1, .. }));
        pending.remove(settlement.message_id());
    }

    let delivered: HashSet<MessageId> = target.calls().into_iter().map(|(id, _, _)| id).collect();
    assert_eq!(delivered, [first, second].into());
}

#[tokio::test(start_paused = true)]
async fn max_in_flight_bounds_concurrent_deliveries() {
    let active = Arc::new(Mutex::new((0usize, 0usize)));
    let tracker = active.clone();

    struct Tracking(Arc<Mutex<(usize, usize)>>);

    #[async_trait]
    impl DeliveryTarget for Tracking {
        async fn deliver(&self, _attempt: DeliveryAttempt) -> DeliveryReport {
            {
                let mut guard = self.0.lock().unwrap();
                guard.0 += 1;
                guard.1 = guard.1.max(guard.0);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.0.lock().unwrap().0 -= 1;
            DeliveryReport::acknowledged()
        }
    }

    let settings = QueueSettings {
        max_in_flight: 2,
        ..QueueSettings::default()
    };
    let (queue, _task) = MessageQueue::new(settings)
        .on_delivery(Arc::new(Tracking(tracker)))
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    for i in 0..6 {
        queue
            .enqueue(UploadEvent::new("journals", format!("logs/{}.log", i), 1))
            .await
            .unwrap();
    }
    for _ in 0..6 {
        rx.recv().await.unwrap();
    }

    assert_eq!(active.lock().unwrap().1, 2);
}

#[tokio::test(start_paused = true)]
async fn persisted_messages_resume_after_restart() {
    let operator = Operator::new(services::Memory::default()).unwrap().finish();
    let store = QueueStore::new(operator);

    // One message was mid-delivery at shutdown, one had used its whole budget.
    let mut resumable = MessageRecord::new(MessageId::generate(), event());
    resumable.attempt_history.push(DeliveryAttempt {
        message_id: resumable.message_id.clone(),
        upload_event: resumable.upload_event.clone(),
        attempt_number: 1,
        delivered_at: Utc::now(),
    });
    store.save(&resumable).await.unwrap();

    let mut exhausted = MessageRecord::new(
        MessageId::generate(),
        UploadEvent::new("journals", "logs/2024-01-02.log", 7),
    );
    for n in 1..=5 {
        exhausted.attempt_history.push(DeliveryAttempt {
            message_id: exhausted.message_id.clone(),
            upload_event: exhausted.upload_event.clone(),
            attempt_number: n,
            delivered_at: Utc::now(),
        });
    }
    exhausted.last_error = Some("sink unavailable".to_string());
    store.save(&exhausted).await.unwrap();

    let target = ScriptedTarget::new(|_| DeliveryReport::acknowledged());
    let dead_letters = DeadLetterQueue::new();
    let (queue, _task) = MessageQueue::new(QueueSettings::default())
        .on_delivery(target.clone())
        .dead_letters(dead_letters.clone())
        .store(store.clone())
        .start()
        .await
        .unwrap();
    let mut rx = queue.subscribe();

    let entries = dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message_id, exhausted.message_id);
    assert_eq!(entries[0].final_error, "sink unavailable");

    let settlement = settle(&mut rx, &resumable.message_id).await;
    assert_eq!(
        settlement,
        Settlement::Acknowledged {
            message_id: resumable.message_id.clone(),
            attempts: 2
        }
    );
    assert_eq!(target.attempt_numbers(), vec![2]);
    assert!(store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn starting_without_a_target_fails() {
    let result = MessageQueue::new(QueueSettings::default()).start().await;
    assert!(result.is_err());
}
