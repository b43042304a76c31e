//! Autonomous-mode state machine wrapping request submission (C11).
//!
//! An explicit `stopped/running/paused/blocked` machine driving periodic,
//! repeated request submissions, since autonomous mode needs
//! external play/pause/stop control that a plain loop doesn't expose.
//! Submission itself is delegated to a [`RequestSubmitter`] — this type owns
//! only the tick/pause/blocking-question state, not the Eventic dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::AgentError;
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    Running,
    Paused,
    Blocked,
}

impl ControllerState {
    fn label(self) -> &'static str {
        match self {
            ControllerState::Stopped => "stopped",
            ControllerState::Running => "running",
            ControllerState::Paused => "paused",
            ControllerState::Blocked => "blocked",
        }
    }
}

/// Submits one request to the engine on the controller's behalf and cancels
/// an in-flight one on `stop()`. Implemented by the crate's top-level engine
/// facade, which owns the real `(conversationName, userInput, options)` path.
#[async_trait]
pub trait RequestSubmitter: Send + Sync {
    async fn submit(&self, conversation: &str, user_input: &str) -> Result<String, AgentError>;
    fn cancel(&self, conversation: &str);
}

/// Assembles the periodic briefing packet (recent workspace changes,
/// outstanding tasks) submitted as the next autonomous-mode user input.
#[async_trait]
pub trait BriefingSource: Send + Sync {
    async fn assemble(&self) -> String;
}

/// A final assistant message is read as a blocking question when its content
/// is a JSON object carrying a non-empty `blockingQuestion` string field.
fn extract_blocking_question(final_response: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(final_response).ok()?;
    value
        .get("blockingQuestion")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Play/pause/stop control over a self-driven request loop for one
/// conversation, with suspension while a blocking question is outstanding.
pub struct AgentLoopController {
    conversation: String,
    submitter: Arc<dyn RequestSubmitter>,
    briefing: Arc<dyn BriefingSource>,
    progress: ProgressSink,
    state: RwLock<ControllerState>,
    blocking_question: RwLock<Option<String>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl AgentLoopController {
    pub fn new(
        conversation: impl Into<String>,
        submitter: Arc<dyn RequestSubmitter>,
        briefing: Arc<dyn BriefingSource>,
        progress: ProgressSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            conversation: conversation.into(),
            submitter,
            briefing,
            progress,
            state: RwLock::new(ControllerState::Stopped),
            blocking_question: RwLock::new(None),
            ticker: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> ControllerState {
        *self.state.read().await
    }

    pub async fn blocking_question(&self) -> Option<String> {
        self.blocking_question.read().await.clone()
    }

    async fn transition(&self, to: ControllerState) {
        let mut state = self.state.write().await;
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        drop(state);
        self.progress
            .publish(ProgressEvent::ControllerStateChanged {
                from: from.label().to_string(),
                to: to.label().to_string(),
            })
            .await;
    }

    /// `stopped → running`: starts periodic briefing submission. A no-op if
    /// already running; rejects being called from `paused` or `blocked`
    /// (use the dedicated transitions instead).
    pub async fn play(self: &Arc<Self>, interval: Duration) -> Result<(), AgentError> {
        let current = self.state().await;
        if current == ControllerState::Running {
            return Ok(());
        }
        if current != ControllerState::Stopped {
            return Err(AgentError::Other(format!(
                "cannot play from controller state {:?}",
                current
            )));
        }

        self.transition(ControllerState::Running).await;
        self.spawn_ticker(interval).await;
        Ok(())
    }

    async fn spawn_ticker(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match this.state().await {
                    ControllerState::Stopped | ControllerState::Blocked => return,
                    ControllerState::Paused => continue,
                    ControllerState::Running => {}
                }

                let packet = this.briefing.assemble().await;
                match this.submitter.submit(&this.conversation, &packet).await {
                    Ok(final_response) => {
                        if let Some(question) = extract_blocking_question(&final_response) {
                            *this.blocking_question.write().await = Some(question.clone());
                            this.transition(ControllerState::Blocked).await;
                            this.progress
                                .publish(ProgressEvent::ControllerBlocked { question })
                                .await;
                            return;
                        }
                    }
                    Err(AgentError::Cancelled) => return,
                    Err(_err) => {
                        // A failed briefing submission doesn't stop autonomous
                        // mode; the next tick tries again.
                    }
                }
            }
        });

        *self.ticker.lock().await = Some(handle);
    }

    /// `running → paused`: stops issuing new briefings; any in-flight request
    /// completes naturally.
    pub async fn pause(&self) -> Result<(), AgentError> {
        let current = self.state().await;
        if current != ControllerState::Running {
            return Err(AgentError::Other(format!(
                "cannot pause from controller state {:?}",
                current
            )));
        }
        self.transition(ControllerState::Paused).await;
        Ok(())
    }

    /// `paused → running`: resumes the ticker (it never actually stopped;
    /// it was only skipping ticks).
    pub async fn resume(&self) -> Result<(), AgentError> {
        let current = self.state().await;
        if current != ControllerState::Paused {
            return Err(AgentError::Other(format!(
                "cannot resume from controller state {:?}",
                current
            )));
        }
        self.transition(ControllerState::Running).await;
        Ok(())
    }

    /// `any → stopped`: cancels any in-flight request and halts ticking.
    pub async fn stop(&self) {
        self.submitter.cancel(&self.conversation);
        self.transition(ControllerState::Stopped).await;
        *self.blocking_question.write().await = None;
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    /// Resolves a `blocked` controller by injecting `text` as the next user
    /// input, then returns to `running` and resumes ticking.
    pub async fn answer(self: &Arc<Self>, text: &str, interval: Duration) -> Result<(), AgentError> {
        let current = self.state().await;
        if current != ControllerState::Blocked {
            return Err(AgentError::Other(format!(
                "cannot answer from controller state {:?}",
                current
            )));
        }

        let response = self.submitter.submit(&self.conversation, text).await?;
        *self.blocking_question.write().await = None;
        self.progress.publish(ProgressEvent::ControllerAnswerAccepted).await;

        if let Some(question) = extract_blocking_question(&response) {
            *self.blocking_question.write().await = Some(question.clone());
            self.transition(ControllerState::Blocked).await;
            self.progress
                .publish(ProgressEvent::ControllerBlocked { question })
                .await;
            return Ok(());
        }

        self.transition(ControllerState::Running).await;
        self.spawn_ticker(interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct EchoSubmitter {
        calls: Arc<AtomicUsize>,
        responses: Arc<TokioMutex<Vec<String>>>,
        cancelled: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl RequestSubmitter for EchoSubmitter {
        async fn submit(&self, _conversation: &str, _user_input: &str) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Ok("ack".to_string())
            } else {
                Ok(responses.remove(0))
            }
        }

        fn cancel(&self, _conversation: &str) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    struct StaticBriefing;
    #[async_trait]
    impl BriefingSource for StaticBriefing {
        async fn assemble(&self) -> String {
            "nothing new".to_string()
        }
    }

    /// **Scenario**: play() transitions stopped -> running and starts ticking.
    #[tokio::test]
    async fn play_transitions_to_running_and_submits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let submitter = Arc::new(EchoSubmitter {
            calls: calls.clone(),
            responses: Arc::new(TokioMutex::new(vec![])),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
        let controller =
            AgentLoopController::new("chat", submitter, Arc::new(StaticBriefing), ProgressSink::new());

        controller.play(Duration::from_millis(10)).await.unwrap();
        assert_eq!(controller.state().await, ControllerState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);

        controller.stop().await;
        assert_eq!(controller.state().await, ControllerState::Stopped);
    }

    /// **Scenario**: pause suppresses new briefings without changing submitted count
    /// once paused.
    #[tokio::test]
    async fn pause_stops_new_submissions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let submitter = Arc::new(EchoSubmitter {
            calls: calls.clone(),
            responses: Arc::new(TokioMutex::new(vec![])),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
        let controller =
            AgentLoopController::new("chat", submitter, Arc::new(StaticBriefing), ProgressSink::new());
        controller.play(Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        controller.pause().await.unwrap();
        let count_at_pause = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), count_at_pause);
        assert_eq!(controller.state().await, ControllerState::Paused);
    }

    /// **Scenario**: a blocking-question response suspends the controller, and answer()
    /// resumes it.
    #[tokio::test]
    async fn blocking_question_suspends_then_answer_resumes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let submitter = Arc::new(EchoSubmitter {
            calls: calls.clone(),
            responses: Arc::new(TokioMutex::new(vec![
                serde_json::json!({ "blockingQuestion": "which branch?" }).to_string(),
            ])),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
        let controller =
            AgentLoopController::new("chat", submitter, Arc::new(StaticBriefing), ProgressSink::new());
        controller.play(Duration::from_millis(10)).await.unwrap();

        let mut state = controller.state().await;
        for _ in 0..50 {
            if state == ControllerState::Blocked {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = controller.state().await;
        }
        assert_eq!(state, ControllerState::Blocked);
        assert_eq!(controller.blocking_question().await.as_deref(), Some("which branch?"));

        controller.answer("main", Duration::from_millis(10)).await.unwrap();
        assert_eq!(controller.state().await, ControllerState::Running);
        assert!(controller.blocking_question().await.is_none());
        controller.stop().await;
    }

    /// **Scenario**: stop() cancels the in-flight conversation and halts ticking from any state.
    #[tokio::test]
    async fn stop_cancels_and_halts_from_any_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let submitter = Arc::new(EchoSubmitter {
            calls: calls.clone(),
            responses: Arc::new(TokioMutex::new(vec![])),
            cancelled: cancelled.clone(),
        });
        let controller =
            AgentLoopController::new("chat", submitter, Arc::new(StaticBriefing), ProgressSink::new());
        controller.play(Duration::from_millis(10)).await.unwrap();
        controller.pause().await.unwrap();
        controller.stop().await;
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(controller.state().await, ControllerState::Stopped);
    }
}
