//! Instruction preludes and transcript rendering for reasoner input.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::protocol::COMPLETION_SENTINEL;
use crate::core::types::Turn;
use crate::io::artifact::ARTIFACT_FILE_NAME;
use crate::tool::EXECUTE_TOOL_NAME;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const CODER_TEMPLATE: &str = include_str!("prompts/coder.md");

static PROMPTS: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("coder", CODER_TEMPLATE)
            .expect("coder template should be valid");
        Self { env }
    }

    fn render(&self, name: &str) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("load {name} template"))?;
        let rendered = template
            .render(context! {
                sentinel => COMPLETION_SENTINEL,
                artifact_file => ARTIFACT_FILE_NAME,
                tool_name => EXECUTE_TOOL_NAME,
            })
            .with_context(|| format!("render {name} template"))?;
        debug!(template = name, bytes = rendered.len(), "rendered prompt");
        Ok(rendered)
    }
}

/// Prelude for the Plan phase: goal framing, capability, completion sentinel.
pub fn planner_preamble() -> Result<String> {
    PROMPTS.render("planner")
}

/// Prelude for the code-focused invocation in the Act phase.
pub fn coder_preamble() -> Result<String> {
    PROMPTS.render("coder")
}

/// Render the visible part of a transcript as markdown sections.
///
/// Internal turns are skipped; they are never part of the reasoning context.
pub fn render_transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns.iter().filter(|t| t.role.is_visible()) {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("### ");
        out.push_str(turn.role.as_str());
        out.push('\n');
        out.push_str(turn.text.trim_end());
        out.push('\n');
    }
    out
}

/// Full stdin payload for a command-backed reasoner.
pub fn build_reasoner_input(preamble: &str, transcript: &[Turn]) -> String {
    format!(
        "{}\n\n## Conversation\n\n{}",
        preamble.trim_end(),
        render_transcript(transcript)
    )
}
