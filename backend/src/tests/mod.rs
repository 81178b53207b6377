pub mod helpers;
pub mod integration;

// Shared setup: an engine wired to in-memory stores, a recording mail
// transport and a canned AI provider.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::jobs::JobLockService;
use crate::services::DataEventReceiver;
use crate::workflows::{EngineConfig, ScriptSandbox, TriggerMatcher, WorkflowEngine, WorkflowExecutor};
use fixtures::{MemoryDataLayer, MemoryStore, RecordingEmail, StaticAi};

pub const AI_REPLY: &str = "Generated summary";

pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub data: Arc<MemoryDataLayer>,
    pub email: Arc<RecordingEmail>,
    pub ai: Arc<StaticAi>,
    pub engine: WorkflowEngine,
    pub matcher: TriggerMatcher,
    events: Option<DataEventReceiver>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        helpers::init_tracing();

        let store = Arc::new(MemoryStore::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let data = Arc::new(MemoryDataLayer::with_events(events_tx));
        let email = Arc::new(RecordingEmail::default());
        let ai = Arc::new(StaticAi::new(AI_REPLY));

        let sandbox = ScriptSandbox::new(data.clone(), Duration::from_millis(1000), 32 * 1024 * 1024);
        let executor = WorkflowExecutor::new(reqwest::Client::new(), data.clone(), sandbox)
            .with_email(email.clone())
            .with_ai(ai.clone());

        let engine = WorkflowEngine::new(
            store.clone(),
            executor,
            JobLockService::new(store.clone()),
            config,
        );
        let matcher = TriggerMatcher::new(engine.clone());

        Self {
            store,
            data,
            email,
            ai,
            engine,
            matcher,
            events: Some(events_rx),
        }
    }

    /// Data events published by the document layer. Can be taken once.
    pub fn take_events(&mut self) -> DataEventReceiver {
        self.events.take().unwrap()
    }
}
