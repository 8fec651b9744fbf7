use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// =============================================================================
// Provider Identity
// =============================================================================

/// An interchangeable language-model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
    Mistral,
    Claude,
    /// Gemini served through Google Cloud Vertex AI.
    Vertex,
    /// Claude served through AWS Bedrock.
    Bedrock,
}

impl Provider {
    /// Every known provider, in declaration order.
    pub const ALL: [Provider; 6] = [
        Provider::OpenAi,
        Provider::Gemini,
        Provider::Mistral,
        Provider::Claude,
        Provider::Vertex,
        Provider::Bedrock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Mistral => "mistral",
            Self::Claude => "claude",
            Self::Vertex => "vertex",
            Self::Bedrock => "bedrock",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            "mistral" => Ok(Self::Mistral),
            "claude" | "anthropic" => Ok(Self::Claude),
            "vertex" => Ok(Self::Vertex),
            "bedrock" => Ok(Self::Bedrock),
            other => Err(Error::invalid_request(format!("unknown provider '{}'", other))),
        }
    }
}

// =============================================================================
// Task Type
// =============================================================================

/// Hint about the nature of a query, used to bias provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    #[serde(alias = "text-generation")]
    Generation,
    Summarization,
    #[serde(alias = "sentiment-analysis")]
    Sentiment,
    #[serde(alias = "qa")]
    QuestionAnswering,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Summarization => "summarization",
            Self::Sentiment => "sentiment",
            Self::QuestionAnswering => "question-answering",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "generation" | "text-generation" => Ok(Self::Generation),
            "summarization" => Ok(Self::Summarization),
            "sentiment" | "sentiment-analysis" => Ok(Self::Sentiment),
            "question-answering" | "qa" => Ok(Self::QuestionAnswering),
            other => Err(Error::invalid_request(format!("unknown task type '{}'", other))),
        }
    }
}
