//! Client for the external summarizer service.
//!
//! The summarizer is an LLM-backed collaborator and unreliable by design:
//! calls are best-effort, bounded by a timeout, and never block a session
//! mutex. Snapshots publish with empty `goal`/`summary` first; results are
//! applied whenever they arrive. The registry keeps at most one call in
//! flight per session.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// HTTP request timeout for summarizer calls.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How many recent transcript lines accompany a request.
pub const RECENT_ENTRY_LIMIT: usize = 8;

/// Errors from a summarizer call. All of them are swallowed by the caller;
/// the variants exist for logging.
#[derive(Error, Debug)]
pub enum SummarizerError {
    /// The HTTP request failed (connect, timeout, body).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("summarizer returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },
}

/// Request body sent to the summarizer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryRequest<'a> {
    session_id: &'a str,
    prompt: &'a str,
    recent_entries: &'a [String],
}

/// Summarizer response; both fields optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryOutcome {
    /// One-line statement of what the session is trying to achieve.
    pub goal: Option<String>,
    /// Short summary of recent activity.
    pub summary: Option<String>,
}

/// Summarizer HTTP client.
#[derive(Debug, Clone)]
pub struct Summarizer {
    client: Client,
    url: String,
}

impl Summarizer {
    /// Creates a client for the given endpoint.
    #[must_use]
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to create HTTP client");
        Self { client, url }
    }

    /// Requests goal/summary text for a session.
    ///
    /// The prompt is de-tagged before sending; `recent` should already be
    /// limited to [`RECENT_ENTRY_LIMIT`] lines.
    ///
    /// # Errors
    ///
    /// Returns `SummarizerError` on transport failure or non-2xx status.
    pub async fn summarize(
        &self,
        session_id: &str,
        prompt: &str,
        recent: &[String],
    ) -> Result<SummaryOutcome, SummarizerError> {
        let cleaned = strip_tags(prompt);
        let request = SummaryRequest {
            session_id,
            prompt: &cleaned,
            recent_entries: recent,
        };

        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SummarizerError::Status {
                status: status.as_u16(),
            });
        }

        let outcome: SummaryOutcome = response.json().await?;
        debug!(
            session_id,
            has_goal = outcome.goal.is_some(),
            has_summary = outcome.summary.is_some(),
            "summarizer responded"
        );
        Ok(outcome)
    }
}

/// Strips angle-bracket tag markup from a prompt, collapsing the whitespace
/// left behind. Prompts arriving through hooks can be wrapped in
/// command/meta tags that would only confuse the summarizer.
#[must_use]
pub fn strip_tags(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    let mut depth = 0usize;
    for c in prompt.chars() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            c if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
