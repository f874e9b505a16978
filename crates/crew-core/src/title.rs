// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! One-shot, low-budget session title generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crew_model::{
    CompletionRequest, Message, ModelProvider, RequestOptions, ResponseEvent, Role,
};
use crew_session::Session;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::bus::EventBus;
use crate::events::RuntimeEvent;

const TITLE_PROMPT: &str = "Generate a short title for this conversation. \
    Reply with the title only: one line, at most 50 characters, no quotes, \
    no punctuation at the end.";

const TITLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TitleError {
    /// Another generation is in flight; callers may wait or ignore.
    #[error("title generation already in progress")]
    Generating,
    /// Every provider failed or produced an empty title.
    #[error("all providers failed to produce a title")]
    Exhausted,
}

/// Produces a session title from the most recent user messages, trying the
/// primary provider first and each fallback in order.  At most one
/// generation runs at a time.
pub struct TitleGenerator {
    providers: Vec<Arc<dyn ModelProvider>>,
    generating: AtomicBool,
    timeout: Duration,
}

impl TitleGenerator {
    pub fn new(
        primary: Arc<dyn ModelProvider>,
        fallbacks: Vec<Arc<dyn ModelProvider>>,
    ) -> Self {
        let mut providers = vec![primary];
        providers.extend(fallbacks);
        Self {
            providers,
            generating: AtomicBool::new(false),
            timeout: TITLE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate a title, store it on the session, and publish
    /// `SessionTitle`.  Concurrent calls observe [`TitleError::Generating`].
    pub async fn generate(
        &self,
        session: &Arc<RwLock<Session>>,
        bus: &EventBus,
    ) -> Result<String, TitleError> {
        if self.generating.swap(true, Ordering::SeqCst) {
            return Err(TitleError::Generating);
        }
        let result = self.generate_inner(session, bus).await;
        self.generating.store(false, Ordering::SeqCst);
        result
    }

    async fn generate_inner(
        &self,
        session: &Arc<RwLock<Session>>,
        bus: &EventBus,
    ) -> Result<String, TitleError> {
        // Up to the last two top-level user messages, oldest first.
        let users: Vec<String> = {
            let s = session.read().await;
            let mut recent: Vec<String> = s
                .messages()
                .iter()
                .rev()
                .filter(|m| m.message.role == Role::User && m.message.tool_call_id.is_none())
                .take(2)
                .map(|m| m.message.content.clone())
                .collect();
            recent.reverse();
            recent
        };
        if users.is_empty() {
            return Err(TitleError::Exhausted);
        }

        let request = CompletionRequest {
            messages: vec![Message::system(TITLE_PROMPT), Message::user(users.join("\n\n"))],
            tools: Vec::new(),
            options: RequestOptions {
                max_tokens: Some(20),
                thinking: false,
                title_generation: true,
                ..RequestOptions::default()
            },
        };

        for provider in &self.providers {
            match tokio::time::timeout(self.timeout, collect_text(provider, request.clone()))
                .await
            {
                Ok(Ok(raw)) => {
                    let title = sanitize_title(&raw);
                    if title.is_empty() {
                        warn!(provider = provider.id(), "empty title; trying next provider");
                        continue;
                    }
                    session.write().await.title = title.clone();
                    bus.publish(RuntimeEvent::SessionTitle {
                        title: title.clone(),
                    })
                    .await;
                    return Ok(title);
                }
                Ok(Err(e)) => {
                    warn!(provider = provider.id(), "title generation failed: {e:#}");
                }
                Err(_) => {
                    warn!(provider = provider.id(), "title generation timed out");
                }
            }
        }
        Err(TitleError::Exhausted)
    }
}

async fn collect_text(
    provider: &Arc<dyn ModelProvider>,
    request: CompletionRequest,
) -> anyhow::Result<String> {
    let mut stream = provider.create_chat_completion_stream(request).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) => text.push_str(&delta),
            ResponseEvent::Finish(_) => break,
            _ => {}
        }
    }
    Ok(text)
}

/// Titles are single-line by contract: newlines become spaces, wrapping
/// quotes and surrounding whitespace are stripped.
pub fn sanitize_title(raw: &str) -> String {
    raw.replace(|c| c == '\n' || c == '\r', " ")
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use crew_model::mock::Script;
    use crew_model::{ProviderError, ResponseStream, ScriptedMockProvider};
    use crew_session::SessionMessage;

    use super::*;

    fn session_with_user(text: &str) -> Arc<RwLock<Session>> {
        let mut s = Session::new();
        s.push_user("root", text);
        Arc::new(RwLock::new(s))
    }

    // ── Sanitization ──────────────────────────────────────────────────────────

    #[test]
    fn sanitize_removes_newlines_and_quotes() {
        assert_eq!(sanitize_title("\"Fix the\nbuild\"\r\n"), "Fix the build");
    }

    #[test]
    fn sanitized_title_has_no_line_breaks() {
        let t = sanitize_title("a\nb\rc");
        assert!(!t.contains('\n'));
        assert!(!t.contains('\r'));
    }

    // ── Generation ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn title_is_set_and_published() {
        let provider = Arc::new(ScriptedMockProvider::always_text("Build fix session"));
        let generator = TitleGenerator::new(provider, vec![]);
        let session = session_with_user("help me fix the build");
        let bus = EventBus::new();
        let mut rx = bus.subscribe().await;

        let title = generator.generate(&session, &bus).await.unwrap();
        assert_eq!(title, "Build fix session");
        assert_eq!(session.read().await.title, "Build fix session");

        bus.close().await;
        let mut saw = false;
        while let Some(ev) = rx.recv().await {
            if let RuntimeEvent::SessionTitle { title } = ev {
                assert_eq!(title, "Build fix session");
                saw = true;
            }
        }
        assert!(saw, "SessionTitle event must be published");
    }

    #[tokio::test]
    async fn fallback_provider_is_used_on_failure() {
        let failing = Arc::new(ScriptedMockProvider::from_scripts(vec![Script::Fail(
            ProviderError::Fatal("down".into()),
        )]));
        let fallback: Arc<dyn ModelProvider> =
            Arc::new(ScriptedMockProvider::always_text("From fallback"));
        let generator = TitleGenerator::new(failing, vec![fallback]);
        let session = session_with_user("question");
        let bus = EventBus::new();

        let title = generator.generate(&session, &bus).await.unwrap();
        assert_eq!(title, "From fallback");
    }

    #[tokio::test]
    async fn empty_session_is_exhausted() {
        let provider = Arc::new(ScriptedMockProvider::always_text("unused"));
        let generator = TitleGenerator::new(provider, vec![]);
        let session = Arc::new(RwLock::new(Session::new()));
        let bus = EventBus::new();

        assert!(matches!(
            generator.generate(&session, &bus).await,
            Err(TitleError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn thinking_is_disabled_and_budget_is_small() {
        let provider = Arc::new(ScriptedMockProvider::always_text("T"));
        let last_request = Arc::clone(&provider.last_request);
        let generator = TitleGenerator::new(provider, vec![]);
        let session = session_with_user("q");
        let bus = EventBus::new();

        generator.generate(&session, &bus).await.unwrap();
        let req = last_request.lock().unwrap().take().unwrap();
        assert_eq!(req.options.max_tokens, Some(20));
        assert!(!req.options.thinking);
        assert!(req.options.title_generation);
        assert!(req.tools.is_empty());
    }

    #[tokio::test]
    async fn prompt_carries_last_two_user_messages_in_order() {
        let provider = Arc::new(ScriptedMockProvider::always_text("T"));
        let last_request = Arc::clone(&provider.last_request);
        let generator = TitleGenerator::new(provider, vec![]);

        let mut s = Session::new();
        s.push_user("root", "first");
        s.push(SessionMessage::new("root", Message::assistant("r1")));
        s.push_user("root", "second");
        s.push_user("root", "third");
        let session = Arc::new(RwLock::new(s));
        let bus = EventBus::new();

        generator.generate(&session, &bus).await.unwrap();
        let req = last_request.lock().unwrap().take().unwrap();
        let user = &req.messages[1].content;
        assert!(user.contains("second") && user.contains("third"));
        assert!(!user.contains("first"));
        assert!(user.find("second").unwrap() < user.find("third").unwrap());
    }

    // ── Single-flight guard ───────────────────────────────────────────────────

    /// Provider that stalls long enough for a second generate call to
    /// observe the in-flight guard.
    struct SlowProvider;

    #[async_trait]
    impl ModelProvider for SlowProvider {
        fn id(&self) -> &str {
            "slow"
        }

        async fn create_chat_completion_stream(
            &self,
            _req: CompletionRequest,
        ) -> anyhow::Result<ResponseStream> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(ResponseEvent::TextDelta("Slow title".into())),
                Ok(ResponseEvent::Finish(crew_model::FinishReason::Stop)),
            ])))
        }
    }

    #[tokio::test]
    async fn concurrent_generation_observes_sentinel() {
        let generator = Arc::new(TitleGenerator::new(Arc::new(SlowProvider), vec![]));
        let session = session_with_user("q");
        let bus = Arc::new(EventBus::new());

        let first = {
            let (generator, session, bus) =
                (Arc::clone(&generator), Arc::clone(&session), Arc::clone(&bus));
            tokio::spawn(async move { generator.generate(&session, &bus).await })
        };
        // Give the first call time to claim the guard.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = generator.generate(&session, &bus).await;

        assert!(matches!(second, Err(TitleError::Generating)));
        assert_eq!(first.await.unwrap().unwrap(), "Slow title");
    }
}
