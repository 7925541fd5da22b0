//! Behavioural tests for the retry and team decorators, driven by a
//! scripted in-memory channel.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use rio_channels::{
    Channel, ChannelMetrics, DrainOrder, Payload, RetryChannel, SendResult, TeamChannel,
    TeamPolicy,
};
use rio_core::notify::{Notification, NotifyBus};

/// Test double: answers sends from a script and records delivered payloads.
struct ScriptedChannel {
    name: String,
    script: Mutex<Vec<SendResult>>,
    fallback: SendResult,
    delivered: Mutex<Vec<String>>,
}

impl ScriptedChannel {
    fn new(name: &str, script: Vec<SendResult>, fallback: SendResult) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script),
            fallback,
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn always(name: &str, result: SendResult) -> Arc<Self> {
        Self::new(name, Vec::new(), result)
    }

    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Payload) -> SendResult {
        let result = {
            let mut script = self.script.lock();
            if script.is_empty() {
                self.fallback
            } else {
                script.remove(0)
            }
        };
        if result.is_ok() {
            self.delivered.lock().push(payload.to_line());
        }
        result
    }

    fn received(&self) -> broadcast::Receiver<Payload> {
        broadcast::channel(1).1
    }

    fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics::default()
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn retry_drains_lifo_after_recovery() {
    // a, b, c fail; everything afterwards succeeds.
    let inner = ScriptedChannel::new(
        "t",
        vec![SendResult::Failed, SendResult::Failed, SendResult::Failed],
        SendResult::Ok,
    );
    let retry = RetryChannel::new(inner.clone(), NotifyBus::new());

    for payload in ["a", "b", "c"] {
        assert_eq!(retry.send(payload.into()).await, SendResult::Failed);
    }
    assert_eq!(retry.holding(), 3);

    assert_eq!(retry.send("d".into()).await, SendResult::Ok);
    assert_eq!(retry.holding(), 0);
    assert_eq!(inner.delivered(), vec!["d", "c", "b", "a"]);
}

#[tokio::test]
async fn retry_fifo_policy_preserves_chronology() {
    let inner = ScriptedChannel::new(
        "t",
        vec![SendResult::Failed, SendResult::Failed],
        SendResult::Ok,
    );
    let retry = RetryChannel::with_order(inner.clone(), NotifyBus::new(), DrainOrder::Fifo);

    retry.send("a".into()).await;
    retry.send("b".into()).await;
    retry.send("c".into()).await;
    assert_eq!(inner.delivered(), vec!["c", "a", "b"]);
}

#[tokio::test]
async fn retry_requeues_items_that_fail_during_drain() {
    // a fails and is held; the next send succeeds but the drained `a`
    // fails once more before finally going through.
    let inner = ScriptedChannel::new(
        "t",
        vec![SendResult::Failed, SendResult::Ok, SendResult::Failed],
        SendResult::Ok,
    );
    let retry = RetryChannel::new(inner.clone(), NotifyBus::new());

    assert_eq!(retry.send("a".into()).await, SendResult::Failed);
    assert_eq!(retry.send("b".into()).await, SendResult::Ok);
    assert_eq!(retry.holding(), 1);

    assert_eq!(retry.send("c".into()).await, SendResult::Ok);
    assert_eq!(retry.holding(), 0);

    // Every payload eventually delivered, none duplicated.
    let mut delivered = inner.delivered();
    delivered.sort();
    assert_eq!(delivered, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn retry_round_trip_preserves_payload_multiset() {
    // Alternate failure and success for a while, then recover fully.
    let mut script = Vec::new();
    for i in 0..40 {
        script.push(if i % 3 == 0 {
            SendResult::Failed
        } else {
            SendResult::Ok
        });
    }
    let inner = ScriptedChannel::new("t", script, SendResult::Ok);
    let retry = RetryChannel::new(inner.clone(), NotifyBus::new());

    let mut expected: Vec<String> = (0..30).map(|i| format!("p{i}")).collect();
    for payload in &expected.clone() {
        retry.send(payload.as_str().into()).await;
    }
    // Flush until the backlog is empty; the script eventually runs out
    // and the fallback delivers everything.
    let mut flushes = 0;
    while retry.holding() > 0 {
        let payload = format!("flush{flushes}");
        retry.send(payload.as_str().into()).await;
        expected.push(payload);
        flushes += 1;
        assert!(flushes < 100, "backlog never drained");
    }

    let mut delivered = inner.delivered();
    delivered.sort();
    expected.sort();
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn retry_recover_replays_persisted_lines() {
    let inner = ScriptedChannel::always("t", SendResult::Ok);
    let retry = RetryChannel::new(inner.clone(), NotifyBus::new());

    retry
        .recover(vec!["old1".into(), "old2".into(), "old3".into()])
        .await;
    assert_eq!(retry.holding(), 0);
    // LIFO: the most recently persisted line ships first.
    assert_eq!(inner.delivered(), vec!["old3", "old2", "old1"]);
}

#[tokio::test]
async fn retry_emits_cumulated_unsent_every_500_pushes() {
    let inner = ScriptedChannel::always("t", SendResult::Failed);
    let notify = NotifyBus::new();
    let mut rx = notify.subscribe();
    let retry = RetryChannel::new(inner, notify.clone());

    for i in 0..500 {
        retry.send(format!("p{i}").into()).await;
    }

    let notification = rx.recv().await.expect("cumulation notification");
    match notification {
        Notification::CumulatedUnsent { channel, lines, .. } => {
            assert_eq!(channel, "t");
            assert_eq!(lines.len(), 500);
            // Chronological snapshot: oldest first.
            assert_eq!(lines[0], "p0");
            assert_eq!(lines[499], "p499");
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    assert!(rx.try_recv().is_none());
}

#[tokio::test]
async fn team_any_short_circuits_on_first_success() {
    let first = ScriptedChannel::always("a", SendResult::Failed);
    let second = ScriptedChannel::always("b", SendResult::Ok);
    let third = ScriptedChannel::always("c", SendResult::Ok);
    let team = TeamChannel::new(
        "team",
        vec![first.clone(), second.clone(), third.clone()],
        TeamPolicy::Any,
    );

    assert_eq!(team.send("x".into()).await, SendResult::Ok);
    assert_eq!(second.delivered(), vec!["x"]);
    // Declaration order: the third member is never attempted.
    assert!(third.delivered().is_empty());
}

#[tokio::test]
async fn team_all_quorum_boundary() {
    // 3 members, quorum 0.5: 2 successes needed.
    let make_team = |oks: usize| {
        let members: Vec<Arc<dyn Channel>> = (0..3)
            .map(|i| {
                ScriptedChannel::always(
                    "m",
                    if i < oks {
                        SendResult::Ok
                    } else {
                        SendResult::NoConnection
                    },
                ) as Arc<dyn Channel>
            })
            .collect();
        TeamChannel::new("team", members, TeamPolicy::All { quorum: 0.5 })
    };

    assert_eq!(make_team(2).send("x".into()).await, SendResult::Ok);
    assert_eq!(
        make_team(1).send("x".into()).await,
        SendResult::NoConnection
    );
    assert_eq!(make_team(3).send("x".into()).await, SendResult::Ok);
}

#[tokio::test]
async fn team_failed_dominates_no_connection() {
    let members: Vec<Arc<dyn Channel>> = vec![
        ScriptedChannel::always("a", SendResult::NoConnection) as Arc<dyn Channel>,
        ScriptedChannel::always("b", SendResult::Failed),
    ];
    let team = TeamChannel::new("team", members, TeamPolicy::All { quorum: 1.0 });
    assert_eq!(team.send("x".into()).await, SendResult::Failed);
    assert!(team.metrics().last_error.is_some());
}
