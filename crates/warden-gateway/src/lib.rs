//! Triage pipeline: admission control, classification, dispatch, and the
//! built-in security and analytics handlers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use warden_common::WardenConfig;
use warden_core::{
    IngestClassifier, InboundEvent, MemberJoinEvent, RateLimiter, TaskPayload, task_types,
};
use warden_response::{AlertSink, ModerationGateway, ResponseController};
use warden_scheduler::{EnqueueError, StatsSnapshot, TaskScheduler};
use warden_threat::ThreatEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The actor exhausted its admission window; nothing was enqueued.
    RateLimited,
    Enqueued { tasks: usize, dropped: usize },
}

#[derive(Debug, Clone)]
pub struct HousekeepingReport {
    pub profiles_evicted: usize,
    pub events_expired: usize,
    pub quarantines_released: usize,
    pub recovery_candidates: Vec<String>,
}

fn relock<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TriagePipeline {
    limiter: Mutex<RateLimiter>,
    classifier: IngestClassifier,
    scheduler: Arc<TaskScheduler>,
    engine: Arc<AsyncMutex<ThreatEngine>>,
    controller: Arc<ResponseController>,
    profile_retention: Duration,
}

impl TriagePipeline {
    pub fn new(
        cfg: &WardenConfig,
        gateway: Arc<dyn ModerationGateway>,
        alerts: Arc<dyn AlertSink>,
    ) -> Arc<Self> {
        let scheduler = TaskScheduler::new(cfg.scheduler.clone());
        let engine = Arc::new(AsyncMutex::new(ThreatEngine::new(cfg.threat.clone())));
        let controller = Arc::new(ResponseController::new(
            cfg.response.clone(),
            gateway,
            alerts,
        ));

        let pipeline = Arc::new(Self {
            limiter: Mutex::new(RateLimiter::new(&cfg.rate_limit)),
            classifier: IngestClassifier::new(cfg.classifier.clone()),
            scheduler,
            engine,
            controller,
            profile_retention: Duration::days(cfg.response.profile_retention_days),
        });
        pipeline.register_builtin_handlers();
        pipeline
    }

    fn register_builtin_handlers(self: &Arc<Self>) {
        let engine = Arc::clone(&self.engine);
        let controller = Arc::clone(&self.controller);
        self.scheduler
            .register_fn(task_types::SECURITY_CHECK, move |task| {
                let engine = Arc::clone(&engine);
                let controller = Arc::clone(&controller);
                async move {
                    let Some(event) = task.payload.message().cloned() else {
                        anyhow::bail!("security check without a message payload");
                    };
                    let ctx = controller
                        .analysis_context(&event.guild_id, &event.actor_id)
                        .await;
                    let assessment = engine.lock().await.evaluate(&event, &ctx);
                    let outcome = controller.apply(&assessment, &event).await;
                    debug!(
                        event = %outcome.event_id,
                        level = assessment.level.as_str(),
                        deduplicated = outcome.deduplicated,
                        "security check complete"
                    );
                    Ok(())
                }
            });

        // Analytics observes every admitted event exactly once; it is the
        // sole writer of the rolling analysis state.
        let engine = Arc::clone(&self.engine);
        self.scheduler
            .register_fn(task_types::ANALYTICS, move |task| {
                let engine = Arc::clone(&engine);
                async move {
                    match &task.payload {
                        TaskPayload::Message(event) => engine.lock().await.record(event),
                        TaskPayload::MemberJoin(join) => {
                            engine.lock().await.record_member_join(join)
                        }
                    }
                    Ok(())
                }
            });
    }

    /// Admits, classifies, and enqueues one message. Queue saturation drops
    /// individual tasks rather than blocking the caller.
    pub fn ingest(&self, event: &InboundEvent) -> IngestOutcome {
        if !relock(self.limiter.lock()).admit(&event.actor_id) {
            debug!(actor = %event.actor_id, "rate limited, message dropped");
            return IngestOutcome::RateLimited;
        }

        let mut enqueued = 0;
        let mut dropped = 0;
        for task in self.classifier.classify(event) {
            let task_type = task.task_type.clone();
            match self.scheduler.enqueue(task) {
                Ok(()) => enqueued += 1,
                Err(EnqueueError::QueueFull(capacity)) => {
                    warn!(task_type, capacity, "queue full, task dropped");
                    dropped += 1;
                }
                Err(EnqueueError::ShuttingDown) => {
                    debug!(task_type, "scheduler shutting down, task dropped");
                    dropped += 1;
                }
            }
        }
        IngestOutcome::Enqueued {
            tasks: enqueued,
            dropped,
        }
    }

    pub fn ingest_member_join(&self, join: &MemberJoinEvent) -> IngestOutcome {
        let mut enqueued = 0;
        let mut dropped = 0;
        for task in self.classifier.classify_member_join(join) {
            match self.scheduler.enqueue(task) {
                Ok(()) => enqueued += 1,
                Err(err) => {
                    warn!(error = %err, "member join task dropped");
                    dropped += 1;
                }
            }
        }
        IngestOutcome::Enqueued {
            tasks: enqueued,
            dropped,
        }
    }

    /// Additional handlers for task types the pipeline does not service
    /// itself (AI replies, support replies, conversation capture).
    pub fn register_handler<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(warden_core::MessageTask) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.scheduler.register_fn(task_type, handler);
    }

    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn controller(&self) -> Arc<ResponseController> {
        Arc::clone(&self.controller)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.scheduler.snapshot()
    }

    pub async fn run(&self) {
        Arc::clone(&self.scheduler).run().await;
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Periodic maintenance across the pipeline's rolling state.
    pub async fn housekeeping(&self, now: DateTime<Utc>) -> HousekeepingReport {
        relock(self.limiter.lock()).prune_idle(Instant::now());
        let profiles_evicted = self
            .engine
            .lock()
            .await
            .housekeeping(now, self.profile_retention);
        let (events_expired, quarantines_released) = self.controller.housekeeping_at(now).await;
        let recovery_candidates = self.controller.recovery_candidates(now).await;
        for guild in &recovery_candidates {
            info!(
                guild = %guild,
                "lockdown has been quiet, consider lifting via an operator action"
            );
        }
        HousekeepingReport {
            profiles_evicted,
            events_expired,
            quarantines_released,
            recovery_candidates,
        }
    }
}
