use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// What the oracle thinks of one agent's recent trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    /// Coherence in [0, 1]: how well the recent output tracks the phase goal.
    pub score: f32,
    pub rationale: String,
    /// Corrective instruction, present when the oracle thinks the agent has
    /// drifted.
    pub steering: Option<String>,
}

/// Opaque scoring oracle. A pure function interface: latency or occasional
/// unavailability only ever costs the caller side information, never
/// scheduling correctness.
#[async_trait]
pub trait CoherenceOracle: Send + Sync {
    async fn assess(
        &self,
        phase_instructions: &str,
        task_description: &str,
        recent_output: &[String],
    ) -> Result<Assessment>;
}

#[derive(Debug, Clone)]
pub struct AnthropicOracle {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    system: String,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

const SYSTEM_PROMPT: &str = "You judge whether a worker agent is still doing the right thing. \
Given the phase instructions, the task, and the agent's recent output, respond with exactly:\n\
SCORE: <number between 0 and 1>\n\
RATIONALE: <one or two sentences>\n\
STEER: <a corrective instruction, only if the agent has drifted>";

impl AnthropicOracle {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: "claude-3-5-sonnet-20240620".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    fn build_prompt(
        phase_instructions: &str,
        task_description: &str,
        recent_output: &[String],
    ) -> String {
        format!(
            "Phase instructions:\n{}\n\nTask:\n{}\n\nRecent agent output:\n{}\n\nIs the agent on track?",
            phase_instructions,
            task_description,
            recent_output.join("\n")
        )
    }

    fn parse_assessment(response: &str) -> Assessment {
        let score_re = regex::Regex::new(r"(?i)SCORE:\s*([0-9]*\.?[0-9]+)").unwrap();
        let score = score_re
            .captures(response)
            .and_then(|c| c[1].parse::<f32>().ok())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        let rationale = response
            .lines()
            .find_map(|l| l.strip_prefix("RATIONALE:"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| response.trim().to_string());

        let steering = response
            .lines()
            .find_map(|l| l.strip_prefix("STEER:"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Assessment {
            score,
            rationale,
            steering,
        }
    }
}

#[async_trait]
impl CoherenceOracle for AnthropicOracle {
    async fn assess(
        &self,
        phase_instructions: &str,
        task_description: &str,
        recent_output: &[String],
    ) -> Result<Assessment> {
        let request = AnthropicRequest {
            model: self.model.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: Self::build_prompt(phase_instructions, task_description, recent_output),
            }],
            max_tokens: 512,
            system: SYSTEM_PROMPT.to_string(),
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            anyhow::bail!("Anthropic API error {}: {}", status, body);
        }

        let result: AnthropicResponse = response.json().await?;
        let text = result
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| anyhow::anyhow!("no content in response"))?;

        Ok(Self::parse_assessment(&text))
    }
}

// Mock oracle for testing: returns queued assessments in order, then the
// fallback. Can be told to fail or stall.
pub struct MockOracle {
    queued: Mutex<VecDeque<Assessment>>,
    fallback: Assessment,
    fail: Mutex<bool>,
    delay_ms: Mutex<u64>,
}

impl MockOracle {
    pub fn with_score(score: f32) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: Assessment {
                score,
                rationale: format!("mock assessment at {}", score),
                steering: if score < 0.7 {
                    Some("refocus on the phase goal".to_string())
                } else {
                    None
                },
            },
            fail: Mutex::new(false),
            delay_ms: Mutex::new(0),
        }
    }

    pub fn queue(&self, assessment: Assessment) {
        self.queued.lock().unwrap().push_back(assessment);
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn set_delay_ms(&self, delay: u64) {
        *self.delay_ms.lock().unwrap() = delay;
    }
}

#[async_trait]
impl CoherenceOracle for MockOracle {
    async fn assess(
        &self,
        _phase_instructions: &str,
        _task_description: &str,
        _recent_output: &[String],
    ) -> Result<Assessment> {
        let delay = *self.delay_ms.lock().unwrap();
        if delay > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
        }
        if *self.fail.lock().unwrap() {
            anyhow::bail!("simulated oracle failure");
        }
        let queued = self.queued.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| self.fallback.clone()))
    }
}
