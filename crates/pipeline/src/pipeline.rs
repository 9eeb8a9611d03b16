//! Chat pipeline
//!
//! The per-request orchestrator. Stages run in order per request:
//! AUTH -> SESSION -> MOD_IN -> RETRIEVE -> ASSEMBLE -> INFER ->
//! MOD_OUT -> PERSIST -> DONE, with short circuits for blocked input,
//! empty context, the direct-answer bypass, and upstream failure.
//! Auth and validation failures abort before a stream exists; every
//! later failure is converted into an in-stream `error` event and the
//! stream still terminates with exactly one `done`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use orbit_config::{AdapterConfig, AdapterFamily, AdapterKind, Settings};
use orbit_core::{
    new_session_id, AuthFailure, ChatEvent, Direction, Document, Error, GenerationParams,
    HistoryStore, ApiKeyStore, MetadataFilter, PromptStore, Result, RetrieveOptions, Retriever,
    Role, SourceEntry, StreamChunk,
};
use orbit_inference::ClientFactory;
use orbit_moderation::ModeratorChain;
use orbit_retrieval::RetrieverRegistry;
use orbit_supervisor::{inference_target, retriever_target, Supervisor};

use crate::prompt::PromptBuilder;

/// One chat request entering the pipeline.
#[derive(Debug)]
pub struct ChatRequest {
    /// `X-API-Key` value; `None` only when ingress auth is disabled
    pub api_key: Option<String>,
    /// Client-supplied session id; minted when absent
    pub session_id: Option<String>,
    pub message: String,
    /// Whether the caller wants incremental `text` events
    pub stream: bool,
    /// Per-request generation overrides (OpenAI-compatible surface)
    pub params: Option<GenerationParams>,
    /// Metadata filters forwarded to the retriever (e.g. file ids)
    pub filters: Vec<MetadataFilter>,
    /// Request-scoped cancellation, fired on client disconnect
    pub cancel: CancellationToken,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            api_key: None,
            session_id: None,
            message: message.into(),
            stream: true,
            params: None,
            filters: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// An accepted request: the session id for the response header and the
/// event stream for the body.
pub struct ChatStream {
    pub session_id: String,
    pub events: ReceiverStream<ChatEvent>,
}

struct ResolvedBinding {
    client_name: String,
    adapter: Option<AdapterConfig>,
    prompt_id: Option<String>,
}

/// How a turn ended, for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnOutcome {
    Completed,
    DirectAnswer,
    BlockedInput,
    BlockedOutput,
    Failed,
    Cancelled,
}

impl TurnOutcome {
    fn as_str(self) -> &'static str {
        match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::DirectAnswer => "direct_answer",
            TurnOutcome::BlockedInput => "blocked_input",
            TurnOutcome::BlockedOutput => "blocked_output",
            TurnOutcome::Failed => "failed",
            TurnOutcome::Cancelled => "cancelled",
        }
    }
}

/// The stateful per-request orchestrator. One instance per server,
/// shared across requests.
pub struct ChatPipeline {
    settings: Settings,
    keys: Arc<dyn ApiKeyStore>,
    prompts: Arc<dyn PromptStore>,
    history: Arc<dyn HistoryStore>,
    registry: Arc<RetrieverRegistry>,
    clients: Arc<ClientFactory>,
    moderation: Arc<ModeratorChain>,
    supervisor: Arc<Supervisor>,
}

impl ChatPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        keys: Arc<dyn ApiKeyStore>,
        prompts: Arc<dyn PromptStore>,
        history: Arc<dyn HistoryStore>,
        registry: Arc<RetrieverRegistry>,
        clients: Arc<ClientFactory>,
        moderation: Arc<ModeratorChain>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self { settings, keys, prompts, history, registry, clients, moderation, supervisor }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<RetrieverRegistry> {
        &self.registry
    }

    /// Accept a request. Validation and auth reject here, before any
    /// stream exists; everything later is in-stream.
    pub async fn execute(self: &Arc<Self>, request: ChatRequest) -> Result<ChatStream> {
        if request.message.trim().is_empty() {
            return Err(Error::Validation("message must not be empty".into()));
        }

        let binding = self.resolve_binding(request.api_key.as_deref()).await?;

        let session_id = request
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(new_session_id);

        let (tx, rx) = mpsc::channel(32);
        let pipeline = Arc::clone(self);
        let task_session = session_id.clone();
        tokio::spawn(async move {
            pipeline.run(binding, task_session, request, tx).await;
        });

        Ok(ChatStream { session_id, events: ReceiverStream::new(rx) })
    }

    /// AUTH stage. Rejects before any retriever, inference, or session
    /// write can happen.
    async fn resolve_binding(&self, api_key: Option<&str>) -> Result<ResolvedBinding> {
        let Some(token) = api_key else {
            if self.settings.server.require_api_key {
                return Err(Error::Auth(AuthFailure::Missing));
            }
            return Ok(ResolvedBinding {
                client_name: "anonymous".into(),
                adapter: self.settings.adapters.first().cloned(),
                prompt_id: None,
            });
        };

        let binding = self
            .keys
            .resolve(token)
            .await?
            .ok_or(Error::Auth(AuthFailure::Invalid))?;
        if !binding.active {
            return Err(Error::Auth(AuthFailure::Inactive));
        }

        let adapter = self
            .settings
            .adapters
            .iter()
            .find(|a| a.name == binding.adapter_name)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "api key is bound to unknown adapter '{}'",
                    binding.adapter_name
                ))
            })?;
        if adapter.kind == AdapterKind::Retriever && !self.registry.contains(&adapter.name) {
            return Err(Error::Config(format!(
                "adapter '{}' is not registered",
                adapter.name
            )));
        }

        // Usage stamp happens off the hot path
        let keys = Arc::clone(&self.keys);
        let owned = token.to_string();
        tokio::spawn(async move {
            if let Err(e) = keys.touch_last_used(&owned).await {
                tracing::debug!(error = %e, "failed to record key usage");
            }
        });

        Ok(ResolvedBinding {
            client_name: binding.client_name,
            adapter: Some(adapter),
            prompt_id: binding.system_prompt_id,
        })
    }

    async fn run(
        self: Arc<Self>,
        binding: ResolvedBinding,
        session_id: String,
        request: ChatRequest,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        use tracing::Instrument;

        let started = std::time::Instant::now();
        let span = tracing::info_span!(
            "chat",
            client = %binding.client_name,
            adapter = binding.adapter.as_ref().map(|a| a.name.as_str()).unwrap_or("-"),
            session_id = %session_id
        );

        // End-to-end deadline: dropping the stages future releases any
        // in-flight upstream call; the stream still ends with done.
        let deadline = Duration::from_millis(self.settings.timeouts.request_deadline_ms);
        let outcome = match timeout(
            deadline,
            self.run_stages(&binding, &session_id, &request, &tx).instrument(span),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(session_id = %session_id, "request deadline exceeded");
                self.fail(&tx, "request deadline exceeded").await;
                TurnOutcome::Failed
            }
        };

        metrics::counter!("orbit_chat_requests_total", "outcome" => outcome.as_str()).increment(1);
        metrics::histogram!("orbit_chat_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            outcome = outcome.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn finished"
        );
    }

    async fn run_stages(
        &self,
        binding: &ResolvedBinding,
        session_id: &str,
        request: &ChatRequest,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> TurnOutcome {
        let timeouts = &self.settings.timeouts;
        let user_message = request.message.as_str();

        // MOD_IN. A moderator infrastructure failure fails closed:
        // nothing is persisted and nothing reaches retrieval/inference.
        let verdict = match timeout(
            Duration::from_millis(timeouts.moderation_ms),
            self.moderation.check(user_message, Direction::Input),
        )
        .await
        {
            Err(_) => Err(Error::UpstreamTransient {
                target: "moderation".into(),
                message: "input moderation timed out".into(),
            }),
            Ok(result) => result,
        };
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(error = %e, "input moderation unavailable");
                self.fail(tx, "moderation is unavailable, please retry").await;
                return TurnOutcome::Failed;
            }
        };
        if !verdict.safe {
            let refusal = self.moderation.refusal_message().to_string();
            let _ = tx.send(ChatEvent::error(&refusal)).await;
            let _ = tx.send(ChatEvent::Done).await;
            if let Err(e) = self.history.append(session_id, Role::User, user_message, true).await {
                tracing::warn!(error = %e, "failed to record blocked turn");
            }
            return TurnOutcome::BlockedInput;
        }

        // RETRIEVE runs in parallel with prior-message loading; they
        // are independent.
        let adapter = binding.adapter.as_ref();
        let retriever = adapter.and_then(|a| self.registry.get(&a.name).ok().flatten());

        let history_limit = self.settings.session.history_limit;
        let prior_future = self.history.recent(session_id, history_limit);
        let retrieval_future = async {
            match (adapter, retriever) {
                (Some(adapter), Some(retriever)) => {
                    Some(self.retrieve(adapter, retriever, user_message, &request.filters).await)
                }
                _ => None,
            }
        };
        let (prior_result, retrieval) = tokio::join!(prior_future, retrieval_future);

        let prior = prior_result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load session history");
            Vec::new()
        });

        let mut documents: Vec<Document> = Vec::new();
        let mut diagnostics: Vec<SourceEntry> = Vec::new();
        match retrieval {
            Some(Ok(docs)) => documents = docs,
            Some(Err(e)) => {
                // Retriever failure is distinct from "no relevant
                // documents": continue inference-only with a warning.
                tracing::warn!(error = %e, "retrieval failed, continuing without context");
                diagnostics.push(SourceEntry::diagnostic(format!(
                    "retrieval unavailable: {}",
                    e.class()
                )));
            }
            None => {}
        }

        // Direct-answer bypass for QA adapters: the top document's
        // literal answer becomes the assistant text, byte for byte.
        let direct_answer = adapter
            .filter(|a| a.adapter_family == AdapterFamily::Qa)
            .and_then(|a| {
                documents
                    .first()
                    .filter(|d| d.qualifies_as_direct_answer(a.config.confidence_threshold))
            })
            .and_then(|d| d.metadata.answer.clone());

        let (full_text, was_direct) = match direct_answer {
            Some(answer) => (answer, true),
            None => {
                match self
                    .assemble_and_infer(binding, request, &prior, &documents, tx)
                    .await
                {
                    InferenceOutcome::Text(text) => (text, false),
                    InferenceOutcome::Cancelled => {
                        // Client is gone: release upstream, keep the
                        // user message, never the partial assistant.
                        self.persist_user_only(session_id, user_message).await;
                        return TurnOutcome::Cancelled;
                    }
                    InferenceOutcome::Failed(e) => {
                        self.fail(tx, &e.to_string()).await;
                        self.persist_user_only(session_id, user_message).await;
                        return TurnOutcome::Failed;
                    }
                }
            }
        };

        // MOD_OUT on the accumulated text, direct answers included.
        let verdict = match timeout(
            Duration::from_millis(timeouts.moderation_ms),
            self.moderation.check(&full_text, Direction::Output),
        )
        .await
        {
            Err(_) => Err(Error::UpstreamTransient {
                target: "moderation".into(),
                message: "output moderation timed out".into(),
            }),
            Ok(result) => result,
        };
        match verdict {
            Ok(verdict) if !verdict.safe => {
                // The refusal text, not the raw model text, goes to
                // history; the raw completion is dropped.
                let refusal = self.moderation.refusal_message().to_string();
                let _ = tx.send(ChatEvent::error(&refusal)).await;
                let _ = tx.send(ChatEvent::Done).await;
                if let Err(e) = self
                    .history
                    .append_turn(session_id, user_message, &refusal, true)
                    .await
                {
                    tracing::warn!(error = %e, "failed to persist blocked turn");
                }
                return TurnOutcome::BlockedOutput;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "output moderation unavailable");
                self.fail(tx, "moderation is unavailable, please retry").await;
                self.persist_user_only(session_id, user_message).await;
                return TurnOutcome::Failed;
            }
        }

        // Direct answers are emitted whole once moderation clears them.
        if was_direct && tx.send(ChatEvent::text(&full_text)).await.is_err() {
            self.persist_user_only(session_id, user_message).await;
            return TurnOutcome::Cancelled;
        }

        // Sources precede the terminal done.
        if !was_direct && (!documents.is_empty() || !diagnostics.is_empty()) {
            let mut entries: Vec<SourceEntry> =
                documents.iter().map(SourceEntry::from).collect();
            entries.extend(diagnostics);
            let _ = tx.send(ChatEvent::Sources { content: entries }).await;
        }
        let _ = tx.send(ChatEvent::Done).await;

        // PERSIST: the pair lands atomically.
        if let Err(e) = self
            .history
            .append_turn(session_id, user_message, &full_text, false)
            .await
        {
            tracing::warn!(error = %e, "failed to persist turn");
        }

        if was_direct {
            TurnOutcome::DirectAnswer
        } else {
            TurnOutcome::Completed
        }
    }

    /// RETRIEVE via the supervisor, with the stage timeout inside the
    /// retried operation.
    async fn retrieve(
        &self,
        adapter: &AdapterConfig,
        retriever: Arc<dyn Retriever>,
        query: &str,
        filters: &[MetadataFilter],
    ) -> Result<Vec<Document>> {
        let breaker_key = retriever_target(&adapter.name);
        let options =
            RetrieveOptions { top_k: adapter.config.max_results, filters: filters.to_vec() };
        let retrieval_ms = self.settings.timeouts.retrieval_ms;

        self.supervisor
            .call(&breaker_key, || {
                let retriever = Arc::clone(&retriever);
                let query = query.to_string();
                let options = options.clone();
                let timeout_target = breaker_key.clone();
                async move {
                    match timeout(
                        Duration::from_millis(retrieval_ms),
                        retriever.get_relevant_documents(&query, &options),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::UpstreamTransient {
                            target: timeout_target,
                            message: "retrieval timed out".into(),
                        }),
                    }
                }
            })
            .await
    }

    /// ASSEMBLE + INFER.
    async fn assemble_and_infer(
        &self,
        binding: &ResolvedBinding,
        request: &ChatRequest,
        prior: &[orbit_core::StoredMessage],
        documents: &[Document],
        tx: &mpsc::Sender<ChatEvent>,
    ) -> InferenceOutcome {
        // System prompt bound to the key, if any. A dangling prompt id
        // is a configuration error, not a silent fallback.
        let system_text = match &binding.prompt_id {
            Some(id) => match self.prompts.get(id).await {
                Ok(Some(prompt)) => Some(prompt.text),
                Ok(None) => {
                    return InferenceOutcome::Failed(Error::Config(format!(
                        "system prompt '{id}' not found"
                    )))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "prompt store unavailable, continuing without");
                    None
                }
            },
            None => None,
        };

        let provider = binding
            .adapter
            .as_ref()
            .and_then(|a| a.provider.clone())
            .unwrap_or_else(|| self.settings.inference.default_provider.clone());
        let client = match self.clients.get(&provider) {
            Ok(client) => client,
            Err(e) => return InferenceOutcome::Failed(e),
        };

        let mut params = request
            .params
            .clone()
            .unwrap_or_else(|| ClientFactory::default_params(&self.settings.inference));
        params.stream = true;

        let num_ctx = params.num_ctx.map(|n| n as usize).unwrap_or_else(|| client.context_size());
        let messages = PromptBuilder::new(request.message.clone())
            .with_system(system_text)
            .with_prior(prior.to_vec())
            .with_documents(documents)
            .build(num_ctx, self.settings.inference.reserved_output_tokens);

        let breaker_key = inference_target(&provider);
        let established = self
            .supervisor
            .call(&breaker_key, || {
                let client = Arc::clone(&client);
                let messages = messages.clone();
                let params = params.clone();
                async move { client.stream(&messages, &params).await }
            })
            .await;

        let mut token_stream = match established {
            Ok(stream) => stream,
            Err(e) => return InferenceOutcome::Failed(e),
        };

        // Drain the stream: first-token and total timeouts, in-order
        // forwarding, cancellation via token or receiver drop.
        let timeouts = &self.settings.timeouts;
        let total_deadline = tokio::time::Instant::now()
            + Duration::from_millis(timeouts.inference_total_ms);
        let mut first_chunk = true;
        let mut full_text = String::new();

        loop {
            let per_chunk = if first_chunk {
                Duration::from_millis(timeouts.inference_first_token_ms)
            } else {
                total_deadline.saturating_duration_since(tokio::time::Instant::now())
            };

            let next = tokio::select! {
                _ = request.cancel.cancelled() => return InferenceOutcome::Cancelled,
                next = timeout(per_chunk, token_stream.next()) => next,
            };

            match next {
                Err(_) => {
                    let e = Error::UpstreamTransient {
                        target: breaker_key.clone(),
                        message: if first_chunk {
                            "no token within the first-token deadline".into()
                        } else {
                            "generation exceeded the total deadline".into()
                        },
                    };
                    self.supervisor.record_external_failure(&breaker_key, &e);
                    return InferenceOutcome::Failed(e);
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    self.supervisor.record_external_failure(&breaker_key, &e);
                    return InferenceOutcome::Failed(e);
                }
                Ok(Some(Ok(StreamChunk { delta, is_final, .. }))) => {
                    first_chunk = false;
                    if !delta.is_empty() {
                        full_text.push_str(&delta);
                        if request.stream && tx.send(ChatEvent::text(&delta)).await.is_err() {
                            // Receiver dropped: the client disconnected.
                            return InferenceOutcome::Cancelled;
                        }
                    }
                    if is_final {
                        break;
                    }
                }
            }
        }

        InferenceOutcome::Text(full_text)
    }

    async fn persist_user_only(&self, session_id: &str, user_message: &str) {
        if let Err(e) = self.history.append(session_id, Role::User, user_message, false).await {
            tracing::warn!(error = %e, "failed to persist user message");
        }
    }

    /// Emit a terminal in-stream error followed by `done`.
    async fn fail(&self, tx: &mpsc::Sender<ChatEvent>, message: &str) {
        let _ = tx.send(ChatEvent::error(message)).await;
        let _ = tx.send(ChatEvent::Done).await;
    }
}

enum InferenceOutcome {
    Text(String),
    Failed(Error),
    Cancelled,
}
