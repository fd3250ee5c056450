//! End-to-end reply flows against scripted completion endpoints
//!
//! Backoff units are one millisecond so retry paths run quickly.

use async_trait::async_trait;
use chat_relay::chat::Message;
use chat_relay::completion::{
    Choice, CompletionClient, CompletionError, CompletionResponse, GenerationOptions,
};
use chat_relay::orchestrator::{ChatOrchestrator, Endpoint, OrchestratorSettings};
use chat_relay::{ChatError, Role};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Outcome = Result<CompletionResponse, CompletionError>;

/// Replays queued outcomes and records what it was sent
struct ScriptedClient {
    name: &'static str,
    script: Mutex<VecDeque<Outcome>>,
    calls: Mutex<Vec<Vec<Message>>>,
    delay: Duration,
}

impl ScriptedClient {
    fn new(name: &'static str, script: Vec<Outcome>) -> Arc<Self> {
        Self::with_delay(name, script, Duration::ZERO)
    }

    fn with_delay(name: &'static str, script: Vec<Outcome>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn last_call(&self) -> Vec<Message> {
        self.calls.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    fn model(&self) -> &str {
        self.name
    }

    async fn complete(
        &self,
        messages: &[Message],
        _options: &GenerationOptions,
    ) -> Result<CompletionResponse, CompletionError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(CompletionError::Transport("script exhausted".to_string())))
    }
}

fn reply(text: &str) -> Outcome {
    Ok(CompletionResponse {
        choices: vec![Choice {
            text: text.to_string(),
            stop_reason: Some("stop".to_string()),
        }],
    })
}

fn unavailable() -> Outcome {
    Err(CompletionError::Upstream {
        status: "503 Service Unavailable".to_string(),
        body: "overloaded".to_string(),
    })
}

fn rate_limited(wait: u64) -> Outcome {
    Err(CompletionError::Upstream {
        status: "429 Too Many Requests".to_string(),
        body: format!("Rate limit reached. Please try again in {}s.", wait),
    })
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        backoff_unit: Duration::from_millis(1),
        ..OrchestratorSettings::default()
    }
}

fn orchestrator(primary: Arc<ScriptedClient>, fallback: Arc<ScriptedClient>) -> ChatOrchestrator {
    ChatOrchestrator::new(primary, fallback, settings())
}

async fn history(orchestrator: &ChatOrchestrator, session_id: i64) -> Vec<Message> {
    let session = orchestrator.registry().get(session_id).await.unwrap();
    let buffer = session.lock().await;
    buffer.messages().to_vec()
}

#[tokio::test]
async fn test_reply_appends_both_turns() {
    let primary = ScriptedClient::new("primary", vec![reply("Hello, human!")]);
    let fallback = ScriptedClient::new("fallback", vec![]);
    let orchestrator = orchestrator(primary.clone(), fallback);

    orchestrator.start_session(1, "Be nice.", 10).await;
    let answer = orchestrator.get_reply(1, "Hi there!", false).await.unwrap();

    assert_eq!(answer.text, "Hello, human!");
    assert!(answer.at_end);
    assert_eq!(answer.reply_len, 13);
    assert_eq!(answer.context_len, 8 + 9 + 13);

    let messages = history(&orchestrator, 1).await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].role, Role::User);
    assert_eq!(messages[2].role, Role::Assistant);

    // the model saw system + user
    assert_eq!(primary.last_call().len(), 2);
}

#[tokio::test]
async fn test_missing_session_fails_without_calling_model() {
    let primary = ScriptedClient::new("primary", vec![reply("unused")]);
    let orchestrator = orchestrator(primary.clone(), ScriptedClient::new("fallback", vec![]));

    let result = orchestrator.get_reply(404, "anyone?", false).await;
    assert!(matches!(result, Err(ChatError::SessionNotFound(404))));
    assert_eq!(primary.call_count(), 0);
}

#[tokio::test]
async fn test_unavailable_is_retried() {
    let primary = ScriptedClient::new("primary", vec![unavailable(), unavailable(), reply("finally")]);
    let orchestrator = orchestrator(primary.clone(), ScriptedClient::new("fallback", vec![]));

    orchestrator.start_session(1, "prompt", 0).await;
    let answer = orchestrator.get_reply(1, "question", false).await.unwrap();

    assert_eq!(answer.text, "finally");
    assert_eq!(primary.call_count(), 3);
    assert_eq!(orchestrator.active_endpoint(), Endpoint::Primary);
}

#[tokio::test]
async fn test_exhausted_retries_leave_no_trace() {
    let primary = ScriptedClient::new("primary", (0..5).map(|_| unavailable()).collect());
    let orchestrator = orchestrator(primary.clone(), ScriptedClient::new("fallback", vec![]));

    orchestrator.start_session(1, "prompt", 0).await;
    let before = history(&orchestrator, 1).await;

    let result = orchestrator.get_reply(1, "question", false).await;
    assert!(matches!(result, Err(ChatError::RetriesExhausted { attempts: 5 })));
    assert_eq!(primary.call_count(), 5);
    assert_eq!(history(&orchestrator, 1).await, before);
}

#[tokio::test]
async fn test_rate_limit_fails_over_and_reverts() {
    let primary = ScriptedClient::new("primary", vec![rate_limited(40), reply("back on primary")]);
    let fallback = ScriptedClient::new("fallback", vec![reply("from fallback")]);
    let orchestrator = orchestrator(primary.clone(), fallback.clone());

    orchestrator.start_session(1, "prompt", 0).await;
    let answer = orchestrator.get_reply(1, "question", false).await.unwrap();

    assert_eq!(answer.text, "from fallback");
    assert_eq!(answer.endpoint, Endpoint::Fallback);
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);
    assert_eq!(orchestrator.active_endpoint(), Endpoint::Fallback);

    // wait + 1 units of 1ms, with slack for the scheduler
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orchestrator.active_endpoint(), Endpoint::Primary);

    let answer = orchestrator.get_reply(1, "again", false).await.unwrap();
    assert_eq!(answer.text, "back on primary");
    assert_eq!(answer.endpoint, Endpoint::Primary);
}

#[tokio::test]
async fn test_reply_reports_serving_endpoint_after_mid_call_revert() {
    let primary = ScriptedClient::new("primary", vec![rate_limited(60_000)]);
    let fallback = ScriptedClient::with_delay(
        "fallback",
        vec![reply("slow fallback")],
        Duration::from_millis(50),
    );
    let orchestrator = Arc::new(orchestrator(primary, fallback));
    orchestrator.start_session(1, "prompt", 0).await;

    let pending = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.get_reply(1, "question", false).await })
    };

    // switch back to primary while the fallback call is in flight
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.shutdown();
    assert_eq!(orchestrator.active_endpoint(), Endpoint::Primary);

    let answer = pending.await.unwrap().unwrap();
    assert_eq!(answer.text, "slow fallback");
    assert_eq!(answer.endpoint, Endpoint::Fallback);
}

#[tokio::test]
async fn test_failover_is_shared_by_all_sessions() {
    let primary = ScriptedClient::new("primary", vec![rate_limited(60_000)]);
    let fallback = ScriptedClient::new("fallback", vec![reply("one"), reply("two")]);
    let orchestrator = orchestrator(primary.clone(), fallback.clone());

    orchestrator.start_session(1, "prompt", 0).await;
    orchestrator.start_session(2, "prompt", 0).await;

    orchestrator.get_reply(1, "first", false).await.unwrap();
    let answer = orchestrator.get_reply(2, "second", false).await.unwrap();

    assert_eq!(answer.text, "two");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 2);

    orchestrator.shutdown();
    assert_eq!(orchestrator.active_endpoint(), Endpoint::Primary);
}

#[tokio::test]
async fn test_rate_limit_evicts_history_before_retry() {
    let primary = ScriptedClient::new("primary", vec![reply("a1"), reply("a2"), rate_limited(60_000)]);
    let fallback = ScriptedClient::new("fallback", vec![reply("a3")]);
    let orchestrator = orchestrator(primary.clone(), fallback.clone());

    orchestrator.start_session(1, "prompt", 0).await;
    orchestrator.get_reply(1, "q1", false).await.unwrap();
    orchestrator.get_reply(1, "q2", false).await.unwrap();
    orchestrator.get_reply(1, "q3", false).await.unwrap();

    // the oldest pair was dropped before the fallback call
    let sent = fallback.last_call();
    let texts: Vec<&str> = sent.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["prompt", "q2", "a2", "q3"]);

    let kept: Vec<String> = history(&orchestrator, 1).await.into_iter().map(|m| m.text).collect();
    assert_eq!(kept, vec!["prompt", "q2", "a2", "q3", "a3"]);

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_rate_limit_on_fallback_waits_and_retries() {
    let primary = ScriptedClient::new("primary", vec![rate_limited(60_000)]);
    let fallback = ScriptedClient::new("fallback", vec![rate_limited(2), reply("patience")]);
    let orchestrator = orchestrator(primary.clone(), fallback.clone());

    orchestrator.start_session(1, "prompt", 0).await;
    let answer = orchestrator.get_reply(1, "question", false).await.unwrap();

    assert_eq!(answer.text, "patience");
    assert_eq!(fallback.call_count(), 2);
    assert_eq!(orchestrator.active_endpoint(), Endpoint::Fallback);

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_failed_rate_limited_turn_restores_evicted_history() {
    let primary = ScriptedClient::new("primary", vec![reply("a1"), reply("a2"), rate_limited(60_000)]);
    let fallback = ScriptedClient::new("fallback", (0..4).map(|_| rate_limited(1)).collect());
    let orchestrator = orchestrator(primary, fallback);

    orchestrator.start_session(1, "prompt", 0).await;
    orchestrator.get_reply(1, "q1", false).await.unwrap();
    orchestrator.get_reply(1, "q2", false).await.unwrap();
    let before = history(&orchestrator, 1).await;

    let result = orchestrator.get_reply(1, "q3", false).await;
    assert!(matches!(result, Err(ChatError::RetriesExhausted { .. })));
    assert_eq!(history(&orchestrator, 1).await, before);

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_malformed_wait_hint_aborts() {
    let primary = ScriptedClient::new(
        "primary",
        vec![Err(CompletionError::Upstream {
            status: "429 Too Many Requests".to_string(),
            body: "Please try again in a little while".to_string(),
        })],
    );
    let orchestrator = orchestrator(primary.clone(), ScriptedClient::new("fallback", vec![]));

    orchestrator.start_session(1, "prompt", 0).await;
    let result = orchestrator.get_reply(1, "question", false).await;

    assert!(matches!(result, Err(ChatError::MalformedWaitHint(_))));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(orchestrator.active_endpoint(), Endpoint::Primary);
    assert_eq!(history(&orchestrator, 1).await.len(), 1);
}

#[tokio::test]
async fn test_other_failures_abort_immediately() {
    let primary = ScriptedClient::new(
        "primary",
        vec![Err(CompletionError::Upstream {
            status: "401 Unauthorized".to_string(),
            body: "invalid key".to_string(),
        })],
    );
    let orchestrator = orchestrator(primary.clone(), ScriptedClient::new("fallback", vec![]));

    orchestrator.start_session(1, "prompt", 0).await;
    let result = orchestrator.get_reply(1, "question", false).await;

    assert!(matches!(result, Err(ChatError::Completion(_))));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(history(&orchestrator, 1).await.len(), 1);
}

#[tokio::test]
async fn test_empty_reply_is_a_failure() {
    let primary = ScriptedClient::new(
        "primary",
        vec![reply(""), Ok(CompletionResponse { choices: vec![] })],
    );
    let orchestrator = orchestrator(primary, ScriptedClient::new("fallback", vec![]));

    orchestrator.start_session(1, "prompt", 0).await;
    let result = orchestrator.get_reply(1, "question", false).await;
    assert!(matches!(result, Err(ChatError::EmptyCompletion)));

    let result = orchestrator.get_reply(1, "question", false).await;
    assert!(matches!(result, Err(ChatError::EmptyCompletion)));

    assert_eq!(history(&orchestrator, 1).await.len(), 1);
}

#[tokio::test]
async fn test_idle_conversation_restarts_unless_forced() {
    let primary = ScriptedClient::new("primary", vec![reply("a1"), reply("a2"), reply("a3")]);
    let settings = OrchestratorSettings {
        memory: Duration::from_millis(20),
        ..settings()
    };
    let orchestrator = ChatOrchestrator::new(primary.clone(), ScriptedClient::new("fallback", vec![]), settings);

    orchestrator.start_session(1, "prompt", 0).await;
    orchestrator.get_reply(1, "q1", false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.get_reply(1, "q2", true).await.unwrap();
    assert_eq!(history(&orchestrator, 1).await.len(), 5);

    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.get_reply(1, "q3", false).await.unwrap();

    let texts: Vec<String> = history(&orchestrator, 1).await.into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["prompt", "q3", "a3"]);
}

#[tokio::test]
async fn test_expired_session_is_started_again() {
    let primary = ScriptedClient::new("primary", vec![reply("a1"), reply("a2")]);
    let settings = OrchestratorSettings {
        registry_idle: Duration::from_millis(50),
        ..settings()
    };
    let orchestrator = ChatOrchestrator::new(primary, ScriptedClient::new("fallback", vec![]), settings);

    assert!(orchestrator.ensure_session(1, "prompt", 4).await);
    assert!(!orchestrator.ensure_session(1, "other prompt", 4).await);
    orchestrator.get_reply(1, "q1", false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!orchestrator.has_session(1).await);
    assert!(matches!(
        orchestrator.get_reply(1, "q2", false).await,
        Err(ChatError::SessionNotFound(1))
    ));
    assert!(matches!(
        orchestrator.restart_session(1).await,
        Err(ChatError::SessionNotFound(1))
    ));

    assert!(orchestrator.ensure_session(1, "prompt", 4).await);
    let answer = orchestrator.get_reply(1, "q2", false).await.unwrap();
    assert_eq!(answer.text, "a2");

    let texts: Vec<String> = history(&orchestrator, 1).await.into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["prompt", "q2", "a2"]);
    assert!(orchestrator.restart_session(1).await.is_ok());
}

#[tokio::test]
async fn test_same_session_requests_are_serialized() {
    let primary = ScriptedClient::with_delay(
        "primary",
        vec![reply("a1"), reply("a2")],
        Duration::from_millis(30),
    );
    let orchestrator = Arc::new(orchestrator(primary.clone(), ScriptedClient::new("fallback", vec![])));
    orchestrator.start_session(1, "prompt", 0).await;

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.get_reply(1, "q1", false).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.get_reply(1, "q2", false).await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // the second request saw the complete first turn
    let texts: Vec<String> = primary.last_call().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["prompt", "q1", "a1", "q2"]);
}

#[tokio::test]
async fn test_different_sessions_run_concurrently() {
    let primary = ScriptedClient::with_delay(
        "primary",
        (0..4).map(|i| reply(&format!("a{}", i))).collect(),
        Duration::from_millis(100),
    );
    let orchestrator = Arc::new(orchestrator(primary, ScriptedClient::new("fallback", vec![])));
    for id in 0..4 {
        orchestrator.start_session(id, "prompt", 0).await;
    }

    let start = std::time::Instant::now();
    let tasks: Vec<_> = (0..4)
        .map(|id| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.get_reply(id, "hello", false).await }
        })
        .collect();
    let results = futures::future::join_all(tasks).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(start.elapsed() < Duration::from_millis(350));
}

#[tokio::test]
async fn test_export_and_import_sessions() {
    let primary = ScriptedClient::new("primary", vec![reply("a1"), reply("b1")]);
    let source = orchestrator(primary, ScriptedClient::new("fallback", vec![]));

    source.start_session(1, "first prompt", 6).await;
    source.start_session(2, "second prompt", 0).await;
    source.get_reply(1, "q1", false).await.unwrap();
    source.get_reply(2, "p1", false).await.unwrap();

    let snapshot = source.export_sessions().await;
    assert_eq!(snapshot.session_count(), 2);
    assert_eq!(snapshot.messages.len(), 6);
    assert_eq!(snapshot.max_history.get(&1), Some(&6));

    let target = orchestrator(
        ScriptedClient::new("primary", vec![]),
        ScriptedClient::new("fallback", vec![]),
    );
    assert_eq!(target.import_sessions(&snapshot).await, 2);

    assert_eq!(history(&target, 1).await, history(&source, 1).await);
    assert_eq!(history(&target, 2).await, history(&source, 2).await);

    let session = target.registry().get(1).await.unwrap();
    assert_eq!(session.lock().await.max_count(), 6);
}
