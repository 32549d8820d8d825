//! Spin stream consumer job.
//!
//! The single logical consumer: waits for published spins (or the poll
//! interval, whichever comes first), then folds each delivered entry into
//! the realtime counters and acks it. Acking only after the counters are
//! updated keeps delivery at-least-once; the counters' per-window sequence
//! dedupe makes the redelivered increments harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::counters::RealtimeCounters;
use crate::stream::SpinStream;

/// Drain one batch. Returns how many entries were processed so the caller
/// can tell a full batch (keep draining) from an empty one.
pub async fn run_once(
    stream: &SpinStream,
    counters: &RealtimeCounters,
    batch: usize,
    now_ms: u64,
) -> usize {
    let entries = stream.consume(batch).await;
    let count = entries.len();
    for (seq, event) in entries {
        counters.apply(seq, &event, now_ms);
        if !stream.ack(seq).await {
            debug!("Spin {seq} was trimmed before its ack");
        }
    }
    count
}

pub fn start(
    stream: Arc<SpinStream>,
    counters: Arc<RealtimeCounters>,
    poll: Duration,
    batch: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            stream.wait_for_events(poll).await;
            loop {
                let processed = run_once(&stream, &counters, batch, crate::now_ms()).await;
                if processed < batch {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EngineMetrics;
    use crate::stream::StreamConfig;
    use paydirt_types::{SpinEvent, HOUR_MS};

    fn spin(event_id: &str, bid: u64, payout: u64) -> SpinEvent {
        SpinEvent {
            event_id: event_id.into(),
            session_id: "s1".into(),
            game_id: "g1".into(),
            player_ref: "p1".into(),
            country: None,
            round: 1,
            bid,
            reward_kind: "ROCK".into(),
            payout,
            win: payout > 0,
            created_at_ms: 100,
        }
    }

    #[tokio::test]
    async fn applies_counters_then_acks() {
        let metrics = Arc::new(EngineMetrics::default());
        let stream = SpinStream::new(StreamConfig::default(), metrics.clone());
        let counters = RealtimeCounters::new(25 * HOUR_MS);

        stream.publish(spin("e1", 10, 0)).await;
        stream.publish(spin("e2", 5, 5)).await;

        assert_eq!(run_once(&stream, &counters, 100, 200).await, 2);
        assert_eq!(stream.depth().await, 0);
        assert_eq!(metrics.snapshot().stream_acked, 2);

        let stats = counters.stats_for("g1", 200);
        assert_eq!(stats[0].total_bets, 15);
        assert_eq!(stats[0].total_wins, 5);
        assert_eq!(stats[0].spin_count, 2);
    }

    #[tokio::test]
    async fn crash_before_ack_cannot_double_count() {
        let metrics = Arc::new(EngineMetrics::default());
        let stream = SpinStream::new(
            StreamConfig {
                redelivery: Duration::from_millis(20),
                ..StreamConfig::default()
            },
            metrics.clone(),
        );
        let counters = RealtimeCounters::new(25 * HOUR_MS);

        stream.publish(spin("e1", 10, 0)).await;

        // A consumer that applied the entry and died before acking.
        let entries = stream.consume(100).await;
        for (seq, event) in &entries {
            counters.apply(*seq, event, 200);
        }
        assert_eq!(stream.depth().await, 1);

        // After the lease lapses the entry is redelivered; the counter
        // update is skipped, the ack finally lands.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(run_once(&stream, &counters, 100, 200).await, 1);
        assert_eq!(stream.depth().await, 0);

        let stats = counters.stats_for("g1", 200);
        assert_eq!(stats[0].total_bets, 10);
        assert_eq!(stats[0].spin_count, 1);
    }

    #[tokio::test]
    async fn empty_stream_processes_nothing() {
        let stream = SpinStream::new(StreamConfig::default(), Arc::new(EngineMetrics::default()));
        let counters = RealtimeCounters::new(25 * HOUR_MS);
        assert_eq!(run_once(&stream, &counters, 100, 0).await, 0);
    }
}
