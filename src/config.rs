//! Application configuration from the environment

use anyhow::{anyhow, Context};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::connectivity::ProbeConfig;
use crate::gemini::DEFAULT_MODEL;
use crate::stage::StagePlan;

pub const DEFAULT_VOICE: &str = "Aoede";

/// Spoken output language of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    Telugu,
    English,
    Hindi,
}

impl Language {
    /// BCP-47 tag sent in the session setup.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::Telugu => "te-IN",
            Language::English => "en-US",
            Language::Hindi => "hi-IN",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "te-in" | "te" | "telugu" => Ok(Language::Telugu),
            "en-us" | "en" | "english" => Ok(Language::English),
            "hi-in" | "hi" | "hindi" => Ok(Language::Hindi),
            other => Err(anyhow!("unsupported language {:?} (expected te-IN, en-US or hi-IN)", other)),
        }
    }
}

/// Who is on the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub user_name: String,
    pub language: Language,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub profile: Profile,
    pub stages_path: Option<PathBuf>,
    pub input_device: Option<String>,
    pub probe: ProbeConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;
        let language = match get("STAGECALL_LANGUAGE") {
            Some(value) => value.parse::<Language>().context("STAGECALL_LANGUAGE")?,
            None => Language::default(),
        };

        let mut probe = ProbeConfig::default();
        if let Some(host) = get("STAGECALL_PROBE_HOST") {
            probe.address = host;
        }
        if let Some(secs) = get("STAGECALL_PROBE_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("STAGECALL_PROBE_INTERVAL_SECS: {:?} is not a number", secs))?;
            probe.interval = Duration::from_secs(secs.max(1));
        }

        Ok(Self {
            api_key,
            model: get("STAGECALL_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: get("STAGECALL_VOICE").unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            profile: Profile {
                user_name: get("STAGECALL_USER").unwrap_or_else(|| "Guest".to_string()),
                language,
            },
            stages_path: get("STAGECALL_STAGES").map(PathBuf::from),
            input_device: get("STAGECALL_INPUT_DEVICE"),
            probe,
        })
    }

    /// The configured stage plan, or the built-in one.
    pub fn stage_plan(&self) -> anyhow::Result<StagePlan> {
        match &self.stages_path {
            Some(path) => StagePlan::load(path),
            None => Ok(StagePlan::builtin()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("GEMINI_API_KEY", "k")])).unwrap();
        assert_eq!(config.api_key, "k");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.voice, "Aoede");
        assert_eq!(config.profile.language, Language::Telugu);
        assert!(config.stages_path.is_none());
        assert_eq!(config.stage_plan().unwrap().len(), 5);
    }

    #[test]
    fn test_missing_api_key() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "k"),
            ("STAGECALL_LANGUAGE", "hi-IN"),
            ("STAGECALL_USER", "Asha"),
            ("STAGECALL_PROBE_HOST", "127.0.0.1:9"),
            ("STAGECALL_PROBE_INTERVAL_SECS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.profile.language, Language::Hindi);
        assert_eq!(config.profile.user_name, "Asha");
        assert_eq!(config.probe.address, "127.0.0.1:9");
        assert_eq!(config.probe.interval, Duration::from_secs(2));
    }

    #[test]
    fn test_bad_language_rejected() {
        let result = AppConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "k"),
            ("STAGECALL_LANGUAGE", "fr-FR"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_language_tags() {
        assert_eq!("EN-us".parse::<Language>().unwrap(), Language::English);
        assert_eq!(Language::Telugu.tag(), "te-IN");
        assert_eq!(Language::Hindi.to_string(), "hi-IN");
    }
}
