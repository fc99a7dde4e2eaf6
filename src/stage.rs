//! Scripted conversation stages
//!
//! A plan is an ordered, immutable list of stages built once at startup.
//! The current index is the only thing that moves.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub index: usize,
    pub name: String,
    /// Instructions the remote model follows while this stage is current
    pub behavior_script: String,
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(rename = "stage", default)]
    stages: Vec<StageEntry>,
}

#[derive(Debug, Deserialize)]
struct StageEntry {
    name: String,
    script: String,
}

/// Ordered stages plus the current position
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<Stage>,
    current: usize,
}

impl StagePlan {
    pub fn new(entries: Vec<(String, String)>) -> anyhow::Result<Self> {
        if entries.is_empty() {
            bail!("a stage plan needs at least one stage");
        }
        let stages = entries
            .into_iter()
            .enumerate()
            .map(|(index, (name, behavior_script))| Stage {
                index,
                name,
                behavior_script,
            })
            .collect();
        Ok(Self { stages, current: 0 })
    }

    /// Parse a plan written as `[[stage]]` tables with `name` and `script`.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let file: PlanFile = toml::from_str(text).context("invalid stage plan")?;
        Self::new(
            file.stages
                .into_iter()
                .map(|entry| (entry.name, entry.script))
                .collect(),
        )
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading stage plan {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Built-in plan for a guided course-enrollment call.
    pub fn builtin() -> Self {
        let entries = [
            (
                "Introduction",
                "Greet the caller warmly, introduce yourself as the enrollment assistant, \
                 confirm their name and that they enrolled in the course, and ask whether \
                 now is a good time to go through the next steps.",
            ),
            (
                "Payment Options",
                "Explain that the course fee can be paid in full or through a monthly plan. \
                 Answer questions about the options and ask which one the caller prefers.",
            ),
            (
                "NBFC Loan Details",
                "If the caller wants monthly payments, explain that the plan is financed by a \
                 lending partner, that approval depends on a short check, and what the \
                 repayment schedule looks like. Keep figures general.",
            ),
            (
                "KYC & Documentation",
                "Walk the caller through the identity and address documents needed for \
                 verification and how to submit them. Check they have what they need.",
            ),
            (
                "Final Steps & Closing",
                "Summarise what was agreed, tell the caller what happens next and when to \
                 expect it, answer any last questions and close the call politely.",
            ),
        ];
        Self {
            stages: entries
                .iter()
                .enumerate()
                .map(|(index, (name, script))| Stage {
                    index,
                    name: name.to_string(),
                    behavior_script: script.to_string(),
                })
                .collect(),
            current: 0,
        }
    }

    pub fn current(&self) -> &Stage {
        &self.stages[self.current]
    }

    pub fn index(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn is_last(&self) -> bool {
        self.current + 1 == self.stages.len()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Move to the next stage. Returns it, or `None` at the last stage.
    pub fn advance(&mut self) -> Option<&Stage> {
        if self.is_last() {
            return None;
        }
        self.current += 1;
        Some(&self.stages[self.current])
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }
}
