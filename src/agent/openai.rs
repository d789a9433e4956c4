use crate::agent::types::{
    ChatChunk, ChatCompletion, ChatCompletionRequest, ChatMessage, PartialToolCall, ToolCall,
};
use crate::agent::{AgentClient, AgentError, AgentTurn, FragmentStream, TranscriptEntry};
use crate::config::Config;
use crate::weather::{WeatherLookup, WeatherTool};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "\
你是一个专业的天气助手，专门帮助用户查询天气。
工作流程：
1. 当用户询问天气时，你必须首先从用户问题中提取城市名称
2. 然后调用 qweather_tool 工具查询该城市的天气
3. 根据工具返回的数据，用自然、友好的方式回答用户

重要规则：
- 如果用户询问的问题跟天气无关时，请你拒绝回答任何问题
- 如果用户没有指定城市，先询问用户要查询哪个城市
- 始终调用工具获取真实的天气数据，不要自己编造
- 如果工具调用失败，向用户说明情况
- 用中文回复，使用摄氏度表示温度";

const STREAM_DONE: &str = "[DONE]";

/// Connection settings for the chat completions endpoint.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_steps: usize,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.llm_base_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            temperature: config.llm_temperature,
            timeout: Duration::from_secs(config.llm_timeout_secs),
            max_steps: config.agent_max_steps.max(1),
        }
    }
}

#[derive(Deserialize)]
struct WeatherToolArgs {
    city: String,
}

/// Tool-calling agent over an OpenAI-compatible chat completions API.
///
/// Each round sends the conversation so far; tool calls in the reply are
/// executed against the weather tool and their results appended, until the
/// model answers without calling a tool or the step bound is hit.
#[derive(Clone)]
pub struct OpenAiAgent {
    http: Client,
    settings: AgentSettings,
    tools: Vec<Value>,
    weather: Arc<dyn WeatherLookup>,
}

impl OpenAiAgent {
    pub fn new(
        settings: AgentSettings,
        weather: Arc<dyn WeatherLookup>,
    ) -> Result<Self, reqwest::Error> {
        // No overall timeout here: streamed responses are bounded per event instead
        let http = Client::builder().connect_timeout(settings.timeout).build()?;

        tracing::info!(
            model = %settings.model,
            base_url = %settings.base_url,
            max_steps = settings.max_steps,
            "Agent client created"
        );

        Ok(Self {
            http,
            settings,
            tools: vec![WeatherTool::definition()],
            weather,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn initial_messages(prompt: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)]
    }

    fn timeout_secs(&self) -> u64 {
        self.settings.timeout.as_secs()
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> reqwest::RequestBuilder {
        let body = ChatCompletionRequest {
            model: &self.settings.model,
            messages,
            tools: &self.tools,
            temperature: self.settings.temperature,
            stream,
        };

        self.http
            .post(self.completions_url())
            .bearer_auth(&self.settings.api_key)
            .json(&body)
    }

    /// One non-streaming round trip.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage, AgentError> {
        let response = self
            .request(messages, false)
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(self.timeout_secs())
                } else {
                    AgentError::Request(e)
                }
            })?;

        let completion: ChatCompletion = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| AgentError::InvalidResponse("response contained no choices".into()))
    }

    async fn open_stream(&self, messages: &[ChatMessage]) -> Result<Response, AgentError> {
        let response = tokio::time::timeout(self.settings.timeout, self.request(messages, true).send())
            .await
            .map_err(|_| AgentError::Timeout(self.timeout_secs()))??;

        ensure_success(response).await
    }

    /// Execute a tool call and render its result for the model.
    ///
    /// Always produces a JSON document; failures are reported as
    /// `{"error": ...}` so the model can explain them to the user.
    async fn run_tool(&self, call: &ToolCall) -> String {
        if call.function.name != WeatherTool::NAME {
            tracing::warn!(tool = %call.function.name, "Model requested an unknown tool");
            return json!({ "error": format!("unknown tool {}", call.function.name) }).to_string();
        }

        let args: WeatherToolArgs = match serde_json::from_str(&call.function.arguments) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(arguments = %call.function.arguments, error = %e, "Invalid tool arguments");
                return json!({ "error": format!("invalid arguments: {}", e) }).to_string();
            }
        };

        match self.weather.lookup(&args.city).await {
            Ok(payload) => payload.to_string(),
            Err(e) => {
                tracing::warn!(city = %args.city, error = %e, "Weather tool failed");
                json!({ "error": e.to_string() }).to_string()
            }
        }
    }

    fn into_fragment_stream(self, prompt: String) -> FragmentStream {
        Box::pin(try_stream! {
            let mut messages = Self::initial_messages(&prompt);
            let mut finished = false;

            for step in 0..self.settings.max_steps {
                let response = self.open_stream(&messages).await?;
                let mut events = Box::pin(response.bytes_stream().eventsource());
                let mut content = String::new();
                let mut calls: Vec<PartialToolCall> = Vec::new();

                while let Some(event) = next_event(&mut events, self.settings.timeout).await? {
                    if event.data.trim() == STREAM_DONE {
                        break;
                    }

                    let chunk: ChatChunk = serde_json::from_str(&event.data).map_err(|e| {
                        AgentError::InvalidResponse(format!("{}: {}", e, event.data))
                    })?;
                    if let Some(message) = chunk.error_message() {
                        Err::<(), AgentError>(AgentError::Stream(message))?;
                    }

                    for choice in chunk.choices {
                        for delta in choice.delta.tool_calls.unwrap_or_default() {
                            PartialToolCall::merge(&mut calls, delta)?;
                        }
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            content.push_str(&text);
                            yield text;
                        }
                    }
                }

                if calls.is_empty() {
                    finished = true;
                    break;
                }

                tracing::debug!(step, tool_calls = calls.len(), "Streaming round requested tools");
                let tool_calls: Vec<ToolCall> = calls.into_iter().map(PartialToolCall::finish).collect();
                messages.push(ChatMessage::assistant_tool_calls(content, tool_calls.clone()));

                for call in &tool_calls {
                    let output = self.run_tool(call).await;
                    messages.push(ChatMessage::tool(call.id.clone(), output.clone()));
                    // Tool payloads surface in the stream like any other message
                    yield output;
                }
            }

            if !finished {
                Err::<(), AgentError>(AgentError::StepLimit(self.settings.max_steps))?;
            }
        })
    }
}

#[async_trait]
impl AgentClient for OpenAiAgent {
    async fn submit(&self, prompt: &str) -> Result<AgentTurn, AgentError> {
        let mut messages = Self::initial_messages(prompt);
        let mut turn = AgentTurn::default();

        for step in 0..self.settings.max_steps {
            let message = self.complete(&messages).await?;
            let tool_calls = message.requested_tool_calls().to_vec();
            let text = message.content.clone().unwrap_or_default();

            if tool_calls.is_empty() {
                turn.transcript.push(TranscriptEntry::Assistant(text));
                tracing::debug!(
                    steps = step + 1,
                    tool_calls = turn.tool_invocations(),
                    "Agent loop finished"
                );
                return Ok(turn);
            }

            if !text.is_empty() {
                turn.transcript.push(TranscriptEntry::Assistant(text));
            }
            messages.push(message);

            for call in &tool_calls {
                turn.transcript.push(TranscriptEntry::ToolCall {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                });
                let output = self.run_tool(call).await;
                turn.transcript.push(TranscriptEntry::ToolResult {
                    name: call.function.name.clone(),
                    output: output.clone(),
                });
                messages.push(ChatMessage::tool(call.id.clone(), output));
            }
        }

        Err(AgentError::StepLimit(self.settings.max_steps))
    }

    async fn stream_submit(&self, prompt: &str) -> Result<FragmentStream, AgentError> {
        Ok(self.clone().into_fragment_stream(prompt.to_string()))
    }
}

async fn ensure_success(response: Response) -> Result<Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(AgentError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Next SSE event, or `None` once the upstream closes.
async fn next_event<S, E>(events: &mut S, idle_timeout: Duration) -> Result<Option<Event>, AgentError>
where
    S: Stream<Item = Result<Event, E>> + Unpin,
    E: std::fmt::Display,
{
    match tokio::time::timeout(idle_timeout, events.next()).await {
        Err(_) => Err(AgentError::Timeout(idle_timeout.as_secs())),
        Ok(None) => Ok(None),
        Ok(Some(Err(e))) => Err(AgentError::Stream(e.to_string())),
        Ok(Some(Ok(event))) => Ok(Some(event)),
    }
}
