//! Query resolution around the model/tool loop.
//!
//! A query that does not name a city can still be answered if the caller's
//! address resolves to one. Two strategies exist:
//!
//! - [`CityFallback::Reactive`] (synchronous path): submit the query as is;
//!   if the reply asks for a city, resolve one and resubmit exactly once.
//!   `Start -> FirstAttempt -> Done | NeedsCity -> RetryWithCity -> Done`.
//! - [`CityFallback::Proactive`] (streaming path): if the query text names no
//!   city, resolve one before the single submission.
//!
//! Resolution failures are never errors here. Model failures are not caught
//! and reach the caller unchanged.

use crate::agent::{AgentClient, AgentError, FragmentStream};
use crate::detector::CityDetector;
use crate::geoip::CityResolver;
use crate::stream::filter_fragments;
use std::sync::Arc;

/// An inbound question plus what the caller told us about themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    ip: Option<String>,
    user_id: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ip: None,
            user_id: None,
        }
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip.filter(|ip| !ip.trim().is_empty());
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// A query with an optional inferred city placed in front of its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    query: Query,
    city_prefix: Option<String>,
}

impl ResolvedQuery {
    pub fn unchanged(query: Query) -> Self {
        Self {
            query,
            city_prefix: None,
        }
    }

    pub fn with_city(query: Query, city: impl Into<String>) -> Self {
        Self {
            query,
            city_prefix: Some(city.into()),
        }
    }

    pub fn city_prefix(&self) -> Option<&str> {
        self.city_prefix.as_deref()
    }

    /// Text submitted to the model.
    pub fn prompt(&self) -> String {
        match &self.city_prefix {
            Some(city) => format!("{} {}", city, self.query.text),
            None => self.query.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CityFallback {
    /// Infer the city before submitting, when the query text names none.
    Proactive,
    /// Infer the city after a reply that asks for one, then resubmit.
    Reactive,
}

impl CityFallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            CityFallback::Proactive => "proactive",
            CityFallback::Reactive => "reactive",
        }
    }
}

/// Final answer of the synchronous path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// Number of model submissions made (1 or 2).
    pub attempts: u8,
    pub inferred_city: Option<String>,
}

pub struct QueryOrchestrator {
    agent: Arc<dyn AgentClient>,
    resolver: Option<Arc<dyn CityResolver>>,
    detector: CityDetector,
}

impl QueryOrchestrator {
    pub fn new(agent: Arc<dyn AgentClient>, detector: CityDetector) -> Self {
        Self {
            agent,
            resolver: None,
            detector,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn detector(&self) -> &CityDetector {
        &self.detector
    }

    /// Decide whether `query` should be resubmitted with an inferred city.
    ///
    /// `reply` is the first model answer and is only consulted by the
    /// reactive strategy. Returns `None` when the strategy does not apply, no
    /// resolver is configured, or no city could be resolved.
    pub async fn resolve_missing_city(
        &self,
        fallback: CityFallback,
        query: &Query,
        reply: Option<&str>,
    ) -> Option<ResolvedQuery> {
        let applies = match fallback {
            CityFallback::Proactive => !self.detector.query_names_city(query.text()),
            CityFallback::Reactive => {
                reply.is_some_and(|reply| self.detector.reply_asks_for_city(reply))
            }
        };
        if !applies {
            return None;
        }

        let Some(resolver) = &self.resolver else {
            tracing::debug!(strategy = fallback.as_str(), "No city resolver configured");
            return None;
        };

        let resolution = resolver.resolve_city(query.ip()).await;
        match resolution.city {
            Some(city) => {
                tracing::info!(
                    strategy = fallback.as_str(),
                    city = %city,
                    user_id = query.user_id().unwrap_or("-"),
                    "Inferred city from caller address"
                );
                metrics::counter!("city_fallback_total", "strategy" => fallback.as_str())
                    .increment(1);
                Some(ResolvedQuery::with_city(query.clone(), city))
            }
            None => {
                tracing::debug!(
                    strategy = fallback.as_str(),
                    status = %resolution.status,
                    "No city inferred"
                );
                None
            }
        }
    }

    async fn submit(&self, resolved: &ResolvedQuery) -> Result<String, AgentError> {
        let turn = self.agent.submit(&resolved.prompt()).await?;
        Ok(turn.final_text().to_string())
    }

    /// Answer `query` in one response, retrying once with an inferred city
    /// when the first reply asks for one.
    pub async fn answer(&self, query: &Query) -> Result<Answer, AgentError> {
        let first = self
            .submit(&ResolvedQuery::unchanged(query.clone()))
            .await?;

        let Some(retry) = self
            .resolve_missing_city(CityFallback::Reactive, query, Some(&first))
            .await
        else {
            return Ok(Answer {
                text: first,
                attempts: 1,
                inferred_city: None,
            });
        };

        // Whatever the second reply says, it is final
        let second = self.submit(&retry).await?;
        Ok(Answer {
            text: second,
            attempts: 2,
            inferred_city: retry.city_prefix,
        })
    }

    /// Answer `query` as a stream of user-facing text fragments.
    ///
    /// The city is inferred up front when the query names none; structured
    /// tool payloads are removed from the returned stream.
    pub async fn answer_stream(&self, query: &Query) -> Result<FragmentStream, AgentError> {
        let resolved = self
            .resolve_missing_city(CityFallback::Proactive, query, None)
            .await
            .unwrap_or_else(|| ResolvedQuery::unchanged(query.clone()));

        let upstream = self.agent.stream_submit(&resolved.prompt()).await?;
        Ok(Box::pin(filter_fragments(upstream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentTurn;
    use crate::geoip::GeoResolution;
    use async_trait::async_trait;
    use futures::{stream, TryStreamExt};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted replies and records every prompt it receives.
    #[derive(Default)]
    struct ScriptedAgent {
        replies: Mutex<VecDeque<String>>,
        fragments: Vec<String>,
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    impl ScriptedAgent {
        fn replying(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                ..Default::default()
            }
        }

        fn streaming(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentClient for ScriptedAgent {
        async fn submit(&self, prompt: &str) -> Result<AgentTurn, AgentError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                return Err(AgentError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            Ok(AgentTurn::from_text(reply))
        }

        async fn stream_submit(&self, prompt: &str) -> Result<FragmentStream, AgentError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                return Err(AgentError::Timeout(30));
            }
            let items: Vec<Result<String, AgentError>> =
                self.fragments.iter().cloned().map(Ok).collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    struct FixedResolver {
        city: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl FixedResolver {
        fn new(city: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                city,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CityResolver for FixedResolver {
        async fn resolve_city(&self, _ip: Option<&str>) -> GeoResolution {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.city {
                Some(city) => GeoResolution::found(city),
                None => GeoResolution::absent("no match"),
            }
        }
    }

    const CLARIFY: &str = "请问您想查询哪个城市的天气？";

    fn orchestrator(agent: &Arc<ScriptedAgent>, resolver: Option<Arc<FixedResolver>>) -> QueryOrchestrator {
        let base = QueryOrchestrator::new(agent.clone(), CityDetector::default());
        match resolver {
            Some(resolver) => base.with_resolver(resolver),
            None => base,
        }
    }

    fn query(text: &str) -> Query {
        Query::new(text).with_ip(Some("8.8.8.8".to_string()))
    }

    #[test]
    fn test_resolved_prompt_prefixes_city() {
        let q = Query::new("今天天气怎么样");
        assert_eq!(ResolvedQuery::unchanged(q.clone()).prompt(), "今天天气怎么样");
        assert_eq!(ResolvedQuery::with_city(q, "北京").prompt(), "北京 今天天气怎么样");
    }

    #[test]
    fn test_blank_ip_is_dropped() {
        assert_eq!(Query::new("x").with_ip(Some("  ".into())).ip(), None);
        assert_eq!(Query::new("x").with_ip(Some("1.1.1.1".into())).ip(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn test_direct_answer_skips_resolution() {
        let agent = Arc::new(ScriptedAgent::replying(&["北京今天晴，25°C"]));
        let resolver = FixedResolver::new(Some("上海"));
        let orch = orchestrator(&agent, Some(resolver.clone()));

        let answer = orch.answer(&query("北京今天天气怎么样")).await.unwrap();

        assert_eq!(answer.text, "北京今天晴，25°C");
        assert_eq!(answer.attempts, 1);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(agent.prompts(), vec!["北京今天天气怎么样"]);
    }

    #[tokio::test]
    async fn test_clarifying_reply_retries_once_with_city() {
        let agent = Arc::new(ScriptedAgent::replying(&[CLARIFY, "上海今天多云"]));
        let resolver = FixedResolver::new(Some("上海"));
        let orch = orchestrator(&agent, Some(resolver.clone()));

        let answer = orch.answer(&query("今天天气怎么样")).await.unwrap();

        assert_eq!(answer.text, "上海今天多云");
        assert_eq!(answer.attempts, 2);
        assert_eq!(answer.inferred_city.as_deref(), Some("上海"));
        assert_eq!(resolver.calls(), 1);
        assert_eq!(agent.prompts(), vec!["今天天气怎么样", "上海 今天天气怎么样"]);
    }

    #[tokio::test]
    async fn test_second_clarification_is_returned_without_third_attempt() {
        let agent = Arc::new(ScriptedAgent::replying(&[CLARIFY, CLARIFY, "unused"]));
        let orch = orchestrator(&agent, Some(FixedResolver::new(Some("上海"))));

        let answer = orch.answer(&query("今天天气怎么样")).await.unwrap();

        assert_eq!(answer.text, CLARIFY);
        assert_eq!(answer.attempts, 2);
        assert_eq!(agent.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_city_returns_first_reply() {
        let agent = Arc::new(ScriptedAgent::replying(&[CLARIFY, "unused"]));
        let resolver = FixedResolver::new(None);
        let orch = orchestrator(&agent, Some(resolver.clone()));

        let answer = orch.answer(&query("今天天气怎么样")).await.unwrap();

        assert_eq!(answer.text, CLARIFY);
        assert_eq!(answer.attempts, 1);
        assert_eq!(resolver.calls(), 1);
        assert_eq!(agent.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_no_resolver_returns_first_reply() {
        let agent = Arc::new(ScriptedAgent::replying(&[CLARIFY, "unused"]));
        let orch = orchestrator(&agent, None);

        let answer = orch.answer(&query("今天天气怎么样")).await.unwrap();

        assert_eq!(answer.text, CLARIFY);
        assert_eq!(agent.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_model_error_propagates() {
        let agent = Arc::new(ScriptedAgent::failing());
        let orch = orchestrator(&agent, Some(FixedResolver::new(Some("上海"))));

        let err = orch.answer(&query("今天天气怎么样")).await.unwrap_err();
        assert!(matches!(err, AgentError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_stream_prefixes_inferred_city_and_submits_once() {
        let agent = Arc::new(ScriptedAgent::streaming(&["杭州", "今天", "小雨"]));
        let resolver = FixedResolver::new(Some("杭州"));
        let orch = orchestrator(&agent, Some(resolver.clone()));

        let fragments: Vec<String> = orch
            .answer_stream(&query("今天天气怎么样"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(fragments, vec!["杭州", "今天", "小雨"]);
        assert_eq!(agent.prompts(), vec!["杭州 今天天气怎么样"]);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_stream_with_named_city_skips_resolution() {
        let agent = Arc::new(ScriptedAgent::streaming(&["ok"]));
        let resolver = FixedResolver::new(Some("杭州"));
        let orch = orchestrator(&agent, Some(resolver.clone()));

        orch.answer_stream(&query("北京天气")).await.unwrap();

        assert_eq!(agent.prompts(), vec!["北京天气"]);
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_unresolved_city_submits_raw_query() {
        let agent = Arc::new(ScriptedAgent::streaming(&["ok"]));
        let orch = orchestrator(&agent, Some(FixedResolver::new(None)));

        orch.answer_stream(&query("今天天气怎么样")).await.unwrap();

        assert_eq!(agent.prompts(), vec!["今天天气怎么样"]);
    }

    #[tokio::test]
    async fn test_stream_drops_tool_payloads() {
        let agent = Arc::new(ScriptedAgent::streaming(&[
            "Hello",
            " world",
            r#"{"tool":"x"}"#,
            " done",
        ]));
        let orch = orchestrator(&agent, None);

        let fragments: Vec<String> = orch
            .answer_stream(&query("北京天气"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(fragments, vec!["Hello", " world", " done"]);
    }

    #[tokio::test]
    async fn test_stream_start_failure_propagates() {
        let agent = Arc::new(ScriptedAgent::failing());
        let orch = orchestrator(&agent, None);

        let result = orch.answer_stream(&query("北京天气")).await;
        assert!(matches!(result, Err(AgentError::Timeout(30))));
    }
}
