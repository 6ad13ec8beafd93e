//! Built-in backend presets and the upstream dialects the proxy can speak.
//!
//! Each preset defines the base URL, upstream dialect, and default environment
//! variable for the API key. Users name a preset in their config and the preset
//! fills in the details.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire dialect spoken by the upstream backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// OpenAI Chat Completions (`/v1/chat/completions`, SSE streaming).
    OpenAi,
    /// OpenWebUI (`/api/chat/completions`, Ollama-flavoured tool calls).
    OpenWebUi,
    /// Ollama native chat (`/api/chat`, NDJSON streaming).
    Ollama,
}

impl Dialect {
    /// Publisher recorded on model entries that don't carry one.
    #[must_use]
    pub fn publisher(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenWebUi => "openwebui",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenAi => "OpenAI",
            Self::OpenWebUi => "OpenWebUI",
            Self::Ollama => "Ollama",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct BackendPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub dialect: Dialect,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[BackendPreset] = &[
    BackendPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENAI_API_KEY",
    },
    BackendPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENROUTER_API_KEY",
    },
    BackendPreset {
        name: "openwebui",
        base_url: "http://localhost:3000",
        dialect: Dialect::OpenWebUi,
        default_api_key_env: "OPENWEBUI_API_KEY",
    },
    BackendPreset {
        name: "ollama",
        base_url: "http://localhost:11434",
        dialect: Dialect::Ollama,
        default_api_key_env: "OLLAMA_API_KEY",
    },
    BackendPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "GROQ_API_KEY",
    },
    BackendPreset {
        name: "together",
        base_url: "https://api.together.xyz/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "TOGETHER_API_KEY",
    },
    BackendPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        dialect: Dialect::OpenAi,
        default_api_key_env: "DEEPSEEK_API_KEY",
    },
];

impl BackendPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static BackendPreset> {
        let name = name.to_lowercase();
        PRESETS.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn all() -> &'static [BackendPreset] {
        PRESETS
    }
}

/// Whether a base URL points at OpenRouter, which wants ranking headers and
/// accepts a provider preference object.
#[must_use]
pub fn is_openrouter(base_url: &str) -> bool {
    base_url.contains("openrouter.ai")
}
