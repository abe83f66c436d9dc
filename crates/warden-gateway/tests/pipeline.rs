use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use warden_common::WardenConfig;
use warden_core::{InboundEvent, MemberJoinEvent, task_types};
use warden_gateway::{IngestOutcome, TriagePipeline};
use warden_response::{AlertSink, GatewayError, ModerationGateway, ModeratorAlert};

#[derive(Default)]
struct RecordingGateway {
    calls: Mutex<Vec<String>>,
}

impl RecordingGateway {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl ModerationGateway for RecordingGateway {
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), GatewayError> {
        self.push(format!("delete:{channel_id}:{message_id}"));
        Ok(())
    }

    async fn timeout_member(
        &self,
        guild_id: &str,
        actor_id: &str,
        _until: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.push(format!("timeout:{guild_id}:{actor_id}"));
        Ok(())
    }

    async fn ban_member(
        &self,
        guild_id: &str,
        actor_id: &str,
        _reason: &str,
    ) -> Result<(), GatewayError> {
        self.push(format!("ban:{guild_id}:{actor_id}"));
        Ok(())
    }

    async fn dm_actor(&self, actor_id: &str, _content: &str) -> Result<(), GatewayError> {
        self.push(format!("dm:{actor_id}"));
        Ok(())
    }

    async fn lockdown_guild(&self, guild_id: &str) -> Result<u32, GatewayError> {
        self.push(format!("lockdown:{guild_id}"));
        Ok(1)
    }

    async fn lift_lockdown(&self, guild_id: &str) -> Result<u32, GatewayError> {
        self.push(format!("lift:{guild_id}"));
        Ok(1)
    }
}

#[derive(Default)]
struct RecordingAlerts {
    alerts: Mutex<Vec<ModeratorAlert>>,
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send_alert(&self, alert: &ModeratorAlert) -> Result<(), GatewayError> {
        self.alerts.lock().expect("alerts lock").push(alert.clone());
        Ok(())
    }
}

fn event(actor: &str, content: &str) -> InboundEvent {
    InboundEvent {
        guild_id: "guild-1".to_string(),
        channel_id: "channel-1".to_string(),
        message_id: uuid::Uuid::new_v4().to_string(),
        actor_id: actor.to_string(),
        actor_name: actor.to_string(),
        actor_created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        content: content.to_string(),
        mention_count: 0,
        mentions_bot: false,
        timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    }
}

fn pipeline_with(
    cfg: &WardenConfig,
) -> (Arc<TriagePipeline>, Arc<RecordingGateway>, Arc<RecordingAlerts>) {
    let gateway = Arc::new(RecordingGateway::default());
    let alerts = Arc::new(RecordingAlerts::default());
    let pipeline = TriagePipeline::new(
        cfg,
        Arc::clone(&gateway) as Arc<dyn ModerationGateway>,
        Arc::clone(&alerts) as Arc<dyn AlertSink>,
    );
    (pipeline, gateway, alerts)
}

async fn run_briefly(pipeline: &Arc<TriagePipeline>, millis: u64) {
    let runner = {
        let pipeline = Arc::clone(pipeline);
        tokio::spawn(async move { pipeline.run().await })
    };
    tokio::time::sleep(Duration::from_millis(millis)).await;
    pipeline.shutdown();
    runner.await.expect("runner");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn phishing_message_flows_through_to_moderation_actions() {
    let cfg = WardenConfig::default();
    let (pipeline, gateway, alerts) = pipeline_with(&cfg);

    let scam = event(
        "scammer",
        "Free Discord Nitro! Click to verify your account now, limited time! https://bit.ly/xyz",
    );
    let outcome = pipeline.ingest(&scam);
    assert!(matches!(outcome, IngestOutcome::Enqueued { tasks, .. } if tasks >= 2));

    run_briefly(&pipeline, 400).await;

    let calls = gateway.calls();
    assert!(calls.iter().any(|c| c.starts_with("delete:channel-1:")));
    assert!(calls.contains(&"timeout:guild-1:scammer".to_string()));
    assert!(calls.contains(&"dm:scammer".to_string()));
    assert_eq!(alerts.alerts.lock().expect("alerts lock").len(), 1);
    assert!(pipeline.controller().is_quarantined("scammer").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn benign_chatter_triggers_no_moderation() {
    let cfg = WardenConfig::default();
    let (pipeline, gateway, alerts) = pipeline_with(&cfg);

    pipeline.ingest(&event("friend", "just hanging out in the lobby today"));
    run_briefly(&pipeline, 300).await;

    assert!(gateway.calls().is_empty());
    assert!(alerts.alerts.lock().expect("alerts lock").is_empty());
    let stats = pipeline.stats();
    assert_eq!(stats.per_type[task_types::ANALYTICS].processed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sixth_message_in_window_is_rate_limited() {
    let cfg = WardenConfig::default();
    let (pipeline, _gateway, _alerts) = pipeline_with(&cfg);

    for _ in 0..5 {
        assert!(matches!(
            pipeline.ingest(&event("chatterbox", "hi")),
            IngestOutcome::Enqueued { .. }
        ));
    }
    assert_eq!(
        pipeline.ingest(&event("chatterbox", "hi")),
        IngestOutcome::RateLimited
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_queue_drops_tasks_without_blocking() {
    let mut cfg = WardenConfig::default();
    cfg.scheduler.queue_capacity = 2;
    let (pipeline, _gateway, _alerts) = pipeline_with(&cfg);

    // Two tasks fill the queue; the next classification is dropped whole.
    pipeline.ingest(&event("first", "just hanging out in the lobby today"));
    let outcome = pipeline.ingest(&event("second", "also hanging out in the lobby now"));
    assert_eq!(
        outcome,
        IngestOutcome::Enqueued {
            tasks: 0,
            dropped: 2
        }
    );
    assert_eq!(pipeline.stats().dropped_queue_full, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn member_joins_feed_the_analytics_handler() {
    let cfg = WardenConfig::default();
    let (pipeline, _gateway, _alerts) = pipeline_with(&cfg);

    let join = MemberJoinEvent {
        guild_id: "guild-1".to_string(),
        actor_id: "newcomer".to_string(),
        actor_created_at: Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap(),
        joined_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    };
    pipeline.ingest_member_join(&join);
    run_briefly(&pipeline, 300).await;

    assert_eq!(pipeline.stats().per_type[task_types::ANALYTICS].processed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_handlers_receive_their_task_types() {
    let cfg = WardenConfig::default();
    let (pipeline, _gateway, _alerts) = pipeline_with(&cfg);

    let replies: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    pipeline.register_handler(task_types::AI_RESPONSE, move |task| {
        let sink = Arc::clone(&sink);
        async move {
            let content = task
                .payload
                .message()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            sink.lock().expect("replies lock").push(content);
            Ok(())
        }
    });

    pipeline.ingest(&event("curious", "how does the queue work?"));
    run_briefly(&pipeline, 300).await;

    assert_eq!(
        replies.lock().expect("replies lock").clone(),
        vec!["how does the queue work?".to_string()]
    );
}
