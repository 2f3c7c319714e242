//! The 3-stage council pipeline.
//!
//! Stage 1 fans the user query out to every available council member. Stage 2
//! shows each member the anonymized stage-1 answers and asks for a ranked
//! verdict. Stage 3 hands everything to the chairman for synthesis. Stages
//! are strict barriers: stage 2 never starts before stage 1 has fully
//! resolved, stage 3 never before stage 2.
//!
//! ```text
//! START → BUILD_PROMPT → STAGE1_FANOUT → STAGE1_COLLECT
//!       → STAGE2_FANOUT → STAGE2_COLLECT → AGGREGATE
//!       → STAGE3_SYNTH  → DONE
//! ```
//!
//! Failure policy: a member that errors is dropped from the stage it failed
//! in, nothing more. Zero stage-1 survivors short-circuits the turn into a
//! persistable error answer. A failing chairman yields an error placeholder
//! that is still persisted so the failure stays visible.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use futures_util::StreamExt;

use crate::council::config::{CouncilConfig, DEFAULT_TITLE_MODEL};
use crate::council::error::CouncilError;
use crate::council::events::{CouncilEvent, LabelMapData, Stage2Metadata};
use crate::council::model::{
    ChairmanAnswer, ModelRanking, ModelResponse, DEFAULT_CONVERSATION_TITLE,
};
use crate::council::multiplexer::StreamMux;
use crate::council::provider::{
    ChatMessage, Provider, StreamChunk, DEFAULT_REQUEST_TIMEOUT, TITLE_REQUEST_TIMEOUT,
};
use crate::council::ranking::{aggregate_rankings, parse_ranking, AggregateRanking, LabelMap};

/// Answer text persisted when every stage-1 worker fails.
pub const ALL_MODELS_FAILED_RESPONSE: &str = "All models failed to respond. Please try again.";

/// Placeholder persisted when the chairman cannot synthesize.
pub const SYNTHESIS_FAILED_RESPONSE: &str = "Error: Unable to generate final synthesis.";

/// Prior context for stage 1: either the joined string of previous finals or
/// an explicit message history. Handlers pass the string form; the message
/// form exists for library callers that manage their own transcripts.
#[derive(Debug, Clone)]
pub enum PriorTurns {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl PriorTurns {
    fn as_text(&self) -> Option<&str> {
        match self {
            PriorTurns::Text(text) => Some(text.as_str()),
            PriorTurns::Messages(_) => None,
        }
    }
}

/// Everything a finished turn produces.
#[derive(Debug, Clone)]
pub struct CouncilOutcome {
    pub stage1: Vec<ModelResponse>,
    pub stage2: Vec<ModelRanking>,
    pub stage3: ChairmanAnswer,
    pub label_map: LabelMap,
    pub aggregate_rankings: Vec<AggregateRanking>,
}

impl CouncilOutcome {
    fn chairman_only(stage3: ChairmanAnswer) -> Self {
        Self {
            stage1: Vec::new(),
            stage2: Vec::new(),
            stage3,
            label_map: LabelMap::default(),
            aggregate_rankings: Vec::new(),
        }
    }
}

/// True when `model` is served by the local runtime, counting `:latest`
/// aliases in both directions.
fn is_available(model: &str, installed: &[String]) -> bool {
    if installed.iter().any(|m| m == model) {
        return true;
    }
    let latest = format!("{}:latest", model);
    if installed.iter().any(|m| *m == latest) {
        return true;
    }
    if let Some(base) = model.strip_suffix(":latest") {
        return installed.iter().any(|m| m == base);
    }
    false
}

/// Runs the 3-stage pipeline against one provider.
pub struct CouncilOrchestrator {
    provider: Arc<dyn Provider>,
    council_models: Vec<String>,
    chairman_model: String,
    timeout: Duration,
}

impl CouncilOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, config: &CouncilConfig) -> Self {
        Self {
            provider,
            council_models: config.council_models.clone(),
            chairman_model: config.chairman_model.clone(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn chairman_model(&self) -> &str {
        &self.chairman_model
    }

    // ── Prompt construction ──────────────────────────────────────────────

    /// Stage-1 message list. A string prior is prepended to the query as one
    /// user turn; a message-list prior keeps its shape with the query
    /// appended as the final turn.
    fn stage1_messages(&self, user_query: &str, prior: Option<&PriorTurns>) -> Vec<ChatMessage> {
        match prior {
            Some(PriorTurns::Text(text)) => {
                vec![ChatMessage::user(format!("{}\n\n{}", text, user_query))]
            }
            Some(PriorTurns::Messages(history)) => {
                let mut messages = history.clone();
                messages.push(ChatMessage::user(user_query));
                messages
            }
            None => vec![ChatMessage::user(user_query)],
        }
    }

    /// The query text stages 2 and 3 see: the user's message framed with the
    /// reply target and/or the prior-context window.
    fn combined_query(
        user_query: &str,
        prior_text: Option<&str>,
        reply_to: Option<&str>,
    ) -> String {
        if let Some(replied) = reply_to {
            let mut combined = format!(
                "The user is replying to this previous response:\n\n\"{}\"\n\nUser's reply: {}",
                replied, user_query
            );
            if let Some(prior) = prior_text {
                combined.push_str("\n\nAdditional context from earlier in the conversation:\n");
                combined.push_str(prior);
            }
            combined
        } else if let Some(prior) = prior_text {
            format!(
                "{}\n\nFor context, here are previous responses:\n{}",
                user_query, prior
            )
        } else {
            user_query.to_string()
        }
    }

    /// Stage-2 ranking prompt plus the label map that anonymizes the stage-1
    /// answers. The same map must score this prompt's outputs.
    fn ranking_prompt(user_query: &str, stage1: &[ModelResponse]) -> (String, LabelMap) {
        let label_map = LabelMap::for_responses(stage1);

        let responses_text = label_map
            .iter()
            .zip(stage1.iter())
            .map(|((label, _), result)| format!("{}:\n{}", label, result.response))
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "You are evaluating different responses to the following question:\n\n\
             Question: {}\n\n\
             Here are the responses from different models (anonymized):\n\n\
             {}\n\n\
             Your task:\n\
             1. First, evaluate each response individually. For each response, explain what it does well and what it does poorly.\n\
             2. Then, at the very end of your response, provide a final ranking.\n\n\
             IMPORTANT: Your final ranking MUST be formatted EXACTLY as follows:\n\
             - Start with the line \"FINAL RANKING:\" (all caps, with colon)\n\
             - Then list the responses from best to worst as a numbered list\n\
             - Each line should be: number, period, space, then ONLY the response label (e.g., \"1. Response A\")\n\
             - Do not add any other text or explanations in the ranking section\n\n\
             Example of the correct format for your ENTIRE response:\n\n\
             Response A provides good detail on X but misses Y...\n\
             Response B is accurate but lacks depth on Z...\n\
             Response C offers the most comprehensive answer...\n\n\
             FINAL RANKING:\n\
             1. Response C\n\
             2. Response A\n\
             3. Response B\n\n\
             Now provide your evaluation and ranking:",
            user_query, responses_text
        );

        (prompt, label_map)
    }

    /// Stage-3 chairman prompt: full stage-1 answers and stage-2 rankings
    /// under their real model names.
    fn chairman_prompt(
        user_query: &str,
        stage1: &[ModelResponse],
        stage2: &[ModelRanking],
    ) -> String {
        let stage1_text = stage1
            .iter()
            .map(|r| format!("Model: {}\nResponse: {}", r.model, r.response))
            .collect::<Vec<_>>()
            .join("\n\n");

        let stage2_text = stage2
            .iter()
            .map(|r| format!("Model: {}\nRanking: {}", r.model, r.ranking))
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "You are the Chairman of an LLM Council. Multiple AI models have provided responses \
             to a user's question, and then ranked each other's responses.\n\n\
             Original Question: {}\n\n\
             STAGE 1 - Individual Responses:\n{}\n\n\
             STAGE 2 - Peer Rankings:\n{}\n\n\
             Your task as Chairman is to synthesize all of this information into a single, \
             comprehensive, accurate answer to the user's original question. Consider:\n\
             - The individual responses and their insights\n\
             - The peer rankings and what they reveal about response quality\n\
             - Any patterns of agreement or disagreement\n\n\
             Provide a clear, well-reasoned final answer that represents the council's \
             collective wisdom:",
            user_query, stage1_text, stage2_text
        )
    }

    // ── Membership ───────────────────────────────────────────────────────

    /// The council members this turn can actually reach. Local providers are
    /// filtered to installed models (with `:latest` alias matching).
    async fn select_members(&self) -> Result<Vec<String>, CouncilError> {
        let mut members = self.council_models.clone();
        if self.provider.is_local() {
            let installed = self.provider.list_models().await;
            members.retain(|m| is_available(m, &installed));
        }
        if members.is_empty() {
            return Err(CouncilError::NoMembersAvailable);
        }
        Ok(members)
    }

    /// The chairman for this turn. On a local provider an uninstalled
    /// chairman is replaced by the first stage-1 respondent.
    async fn resolve_chairman(&self, stage1: &[ModelResponse]) -> String {
        if !self.provider.is_local() {
            return self.chairman_model.clone();
        }
        let installed = self.provider.list_models().await;
        if is_available(&self.chairman_model, &installed) {
            return self.chairman_model.clone();
        }
        stage1
            .first()
            .map(|r| r.model.clone())
            .unwrap_or_else(|| self.chairman_model.clone())
    }

    /// Chairman selection when no stage-1 roster exists (skip-stages mode):
    /// fall back to the first installed model.
    async fn resolve_chairman_direct(&self) -> String {
        if !self.provider.is_local() {
            return self.chairman_model.clone();
        }
        let installed = self.provider.list_models().await;
        if is_available(&self.chairman_model, &installed) {
            return self.chairman_model.clone();
        }
        installed
            .into_iter()
            .next()
            .unwrap_or_else(|| self.chairman_model.clone())
    }

    // ── Request/response pipeline ────────────────────────────────────────

    /// Run the full pipeline and return all three stages.
    pub async fn run(
        &self,
        user_query: &str,
        prior: Option<PriorTurns>,
        reply_to: Option<&str>,
        skip_stages: bool,
    ) -> Result<CouncilOutcome, CouncilError> {
        let prior_text = prior.as_ref().and_then(|p| p.as_text());
        let combined = Self::combined_query(user_query, prior_text, reply_to);

        if skip_stages {
            let chairman = self.resolve_chairman_direct().await;
            let stage3 = match self
                .provider
                .complete(&chairman, &[ChatMessage::user(combined)], self.timeout)
                .await
            {
                Some(completion) => ChairmanAnswer::new(&chairman, completion.content),
                None => ChairmanAnswer::new(&chairman, SYNTHESIS_FAILED_RESPONSE),
            };
            return Ok(CouncilOutcome::chairman_only(stage3));
        }

        let members = self.select_members().await?;

        // Stage 1: individual answers, in parallel.
        let stage1_messages = if reply_to.is_some() {
            vec![ChatMessage::user(combined.clone())]
        } else {
            self.stage1_messages(user_query, prior.as_ref())
        };
        let stage1 = self.complete_parallel(&members, &stage1_messages).await;

        if stage1.is_empty() {
            return Ok(CouncilOutcome::chairman_only(ChairmanAnswer::new(
                "error",
                ALL_MODELS_FAILED_RESPONSE,
            )));
        }

        // Stage 2: anonymized peer rankings from the same members.
        let (ranking_prompt, label_map) = Self::ranking_prompt(&combined, &stage1);
        let ranking_messages = vec![ChatMessage::user(ranking_prompt)];
        let stage2: Vec<ModelRanking> = self
            .complete_parallel(&members, &ranking_messages)
            .await
            .into_iter()
            .map(|r| ModelRanking {
                parsed_ranking: parse_ranking(&r.response),
                model: r.model,
                ranking: r.response,
            })
            .collect();

        let aggregate = aggregate_rankings(&stage2, &label_map);

        // Stage 3: chairman synthesis.
        let chairman = self.resolve_chairman(&stage1).await;
        let chairman_prompt = Self::chairman_prompt(&combined, &stage1, &stage2);
        let stage3 = match self
            .provider
            .complete(&chairman, &[ChatMessage::user(chairman_prompt)], self.timeout)
            .await
        {
            Some(completion) => {
                if log::log_enabled!(log::Level::Debug) {
                    let preview: String = completion.content.chars().take(300).collect();
                    log::debug!("stage3 chairman={} preview={}", chairman, preview);
                }
                ChairmanAnswer::new(&chairman, completion.content)
            }
            None => ChairmanAnswer::new(&chairman, SYNTHESIS_FAILED_RESPONSE),
        };

        Ok(CouncilOutcome {
            stage1,
            stage2,
            stage3,
            label_map,
            aggregate_rankings: aggregate,
        })
    }

    /// Fan `messages` out to every model in parallel; failed models are
    /// omitted from the result, order follows the member list.
    async fn complete_parallel(
        &self,
        models: &[String],
        messages: &[ChatMessage],
    ) -> Vec<ModelResponse> {
        let mut tasks = Vec::with_capacity(models.len());
        for model in models {
            let provider = self.provider.clone();
            let model = model.clone();
            let messages = messages.to_vec();
            let timeout = self.timeout;
            tasks.push(tokio::spawn(async move {
                let result = provider.complete(&model, &messages, timeout).await;
                (model, result)
            }));
        }

        let mut responses = Vec::new();
        for task in tasks {
            match task.await {
                Ok((model, Some(completion))) => responses.push(ModelResponse {
                    model,
                    response: completion.content,
                }),
                Ok((model, None)) => {
                    log::warn!("council member {} produced no response", model);
                }
                Err(e) => {
                    log::error!("council worker panicked: {}", e);
                }
            }
        }
        responses
    }

    // ── Streaming pipeline ───────────────────────────────────────────────

    /// Run the pipeline, forwarding typed events into `events` as tokens
    /// arrive. Returns the same outcome as [`run`](Self::run) for
    /// persistence. A closed events channel aborts the run with
    /// [`CouncilError::Cancelled`]; dropping the internal fan-out then
    /// cancels all in-flight workers.
    pub async fn run_streaming(
        &self,
        user_query: &str,
        prior: Option<PriorTurns>,
        reply_to: Option<&str>,
        skip_stages: bool,
        events: &mpsc::Sender<CouncilEvent>,
    ) -> Result<CouncilOutcome, CouncilError> {
        let prior_text = prior.as_ref().and_then(|p| p.as_text());
        let combined = Self::combined_query(user_query, prior_text, reply_to);

        if skip_stages {
            emit(events, CouncilEvent::Stage3Start).await?;
            let chairman = self.resolve_chairman_direct().await;
            let stage3 = self
                .stream_chairman(
                    &chairman,
                    vec![ChatMessage::user(combined)],
                    "Error: No response generated from chairman.",
                    events,
                )
                .await?;
            emit(
                events,
                CouncilEvent::Stage3Complete {
                    data: stage3.clone(),
                },
            )
            .await?;
            return Ok(CouncilOutcome::chairman_only(stage3));
        }

        let members = self.select_members().await?;

        // ── Stage 1 ──────────────────────────────────────────────────────
        emit(events, CouncilEvent::Stage1Start).await?;

        let stage1_messages = if reply_to.is_some() {
            vec![ChatMessage::user(combined.clone())]
        } else {
            self.stage1_messages(user_query, prior.as_ref())
        };

        let mut responses: Vec<(String, String)> = Vec::new();
        {
            let mut mux = StreamMux::fan_out(
                self.provider.clone(),
                &members,
                &stage1_messages,
                self.timeout,
            );
            while let Some((model, chunk)) = mux.next().await {
                match chunk {
                    StreamChunk::Start => {
                        emit(events, CouncilEvent::Stage1ModelStart { model }).await?;
                    }
                    StreamChunk::Chunk { content } => {
                        append_chunk(&mut responses, &model, &content);
                        emit(events, CouncilEvent::Stage1Chunk { model, content }).await?;
                    }
                    StreamChunk::Done { .. } => {}
                    StreamChunk::Error { message } => {
                        log::warn!("stage1 worker {} failed: {}", model, message);
                    }
                }
            }
        }

        let stage1: Vec<ModelResponse> = responses
            .into_iter()
            .map(|(model, response)| ModelResponse { model, response })
            .collect();
        emit(
            events,
            CouncilEvent::Stage1Complete {
                data: stage1.clone(),
            },
        )
        .await?;

        if stage1.is_empty() {
            // Nothing to rank, nothing to synthesize.
            return Ok(CouncilOutcome::chairman_only(ChairmanAnswer::new(
                "error",
                ALL_MODELS_FAILED_RESPONSE,
            )));
        }

        // ── Stage 2 ──────────────────────────────────────────────────────
        emit(events, CouncilEvent::Stage2Start).await?;

        let (ranking_prompt, label_map) = Self::ranking_prompt(&combined, &stage1);
        emit(
            events,
            CouncilEvent::Stage2Metadata {
                data: LabelMapData {
                    label_to_model: label_map.to_value(),
                },
            },
        )
        .await?;

        let ranking_messages = vec![ChatMessage::user(ranking_prompt)];
        let mut rankings: Vec<(String, String)> = Vec::new();
        {
            let mut mux = StreamMux::fan_out(
                self.provider.clone(),
                &members,
                &ranking_messages,
                self.timeout,
            );
            while let Some((model, chunk)) = mux.next().await {
                match chunk {
                    StreamChunk::Start => {
                        emit(events, CouncilEvent::Stage2ModelStart { model }).await?;
                    }
                    StreamChunk::Chunk { content } => {
                        append_chunk(&mut rankings, &model, &content);
                        emit(events, CouncilEvent::Stage2Chunk { model, content }).await?;
                    }
                    StreamChunk::Done { .. } => {}
                    StreamChunk::Error { message } => {
                        log::warn!("stage2 worker {} failed: {}", model, message);
                    }
                }
            }
        }

        let stage2: Vec<ModelRanking> = rankings
            .into_iter()
            .map(|(model, ranking)| ModelRanking {
                parsed_ranking: parse_ranking(&ranking),
                model,
                ranking,
            })
            .collect();

        let aggregate = aggregate_rankings(&stage2, &label_map);
        emit(
            events,
            CouncilEvent::Stage2Complete {
                data: stage2.clone(),
                metadata: Stage2Metadata {
                    label_to_model: label_map.to_value(),
                    aggregate_rankings: aggregate.clone(),
                },
            },
        )
        .await?;

        // ── Stage 3 ──────────────────────────────────────────────────────
        emit(events, CouncilEvent::Stage3Start).await?;

        let chairman = self.resolve_chairman(&stage1).await;
        let chairman_prompt = Self::chairman_prompt(&combined, &stage1, &stage2);
        let stage3 = self
            .stream_chairman(
                &chairman,
                vec![ChatMessage::user(chairman_prompt)],
                SYNTHESIS_FAILED_RESPONSE,
                events,
            )
            .await?;
        emit(
            events,
            CouncilEvent::Stage3Complete {
                data: stage3.clone(),
            },
        )
        .await?;

        Ok(CouncilOutcome {
            stage1,
            stage2,
            stage3,
            label_map,
            aggregate_rankings: aggregate,
        })
    }

    /// Stream a single chairman call, forwarding `stage3_chunk` events and
    /// accumulating the full text. Upstream errors become an `Error: …`
    /// answer rather than aborting the turn.
    async fn stream_chairman(
        &self,
        chairman: &str,
        messages: Vec<ChatMessage>,
        empty_fallback: &str,
        events: &mpsc::Sender<CouncilEvent>,
    ) -> Result<ChairmanAnswer, CouncilError> {
        let mut accumulated = String::new();
        let mut answer: Option<ChairmanAnswer> = None;

        let mut chunks = self.provider.stream(chairman, messages, self.timeout).await;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                StreamChunk::Start => {}
                StreamChunk::Chunk { content } => {
                    accumulated.push_str(&content);
                    emit(
                        events,
                        CouncilEvent::Stage3Chunk {
                            model: chairman.to_string(),
                            content,
                        },
                    )
                    .await?;
                }
                StreamChunk::Done { response } => {
                    let text = response.unwrap_or_else(|| accumulated.clone());
                    answer = Some(ChairmanAnswer::new(chairman, text));
                    break;
                }
                StreamChunk::Error { message } => {
                    answer = Some(ChairmanAnswer::new(
                        chairman,
                        format!("Error: {}", message),
                    ));
                    break;
                }
            }
        }

        Ok(answer.unwrap_or_else(|| {
            if accumulated.is_empty() {
                ChairmanAnswer::new(chairman, empty_fallback)
            } else {
                ChairmanAnswer::new(chairman, accumulated)
            }
        }))
    }
}

/// Accumulate a delta for `model`, registering it on first sight so result
/// order follows first output.
fn append_chunk(accumulated: &mut Vec<(String, String)>, model: &str, content: &str) {
    match accumulated.iter_mut().find(|(m, _)| m == model) {
        Some((_, text)) => text.push_str(content),
        None => accumulated.push((model.to_string(), content.to_string())),
    }
}

async fn emit(tx: &mpsc::Sender<CouncilEvent>, event: CouncilEvent) -> Result<(), CouncilError> {
    tx.send(event).await.map_err(|_| CouncilError::Cancelled)
}

/// Generate a short conversation title from the first user message.
///
/// Local providers use their first installed model; everything else uses the
/// default title model. Failures fall back to the default title.
pub async fn generate_title(provider: &Arc<dyn Provider>, user_query: &str) -> String {
    let prompt = format!(
        "Generate a very short title (3-5 words maximum) that summarizes the following question.\n\
         The title should be concise and descriptive. Do not use quotes or punctuation in the title.\n\n\
         Question: {}\n\n\
         Title:",
        user_query
    );

    let mut model = DEFAULT_TITLE_MODEL.to_string();
    if provider.is_local() {
        if let Some(first) = provider.list_models().await.into_iter().next() {
            model = first;
        }
    }

    match provider
        .complete(&model, &[ChatMessage::user(prompt)], TITLE_REQUEST_TIMEOUT)
        .await
    {
        Some(completion) => {
            let trimmed = completion
                .content
                .trim()
                .trim_matches(|c| c == '"' || c == '\'');
            if trimmed.is_empty() {
                return DEFAULT_CONVERSATION_TITLE.to_string();
            }
            if trimmed.chars().count() > 50 {
                let mut title: String = trimmed.chars().take(47).collect();
                title.push_str("...");
                title
            } else {
                trimmed.to_string()
            }
        }
        None => DEFAULT_CONVERSATION_TITLE.to_string(),
    }
}
