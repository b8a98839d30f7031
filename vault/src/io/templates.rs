//! Document templates rendered with minijinja.
//!
//! Templates are compiled into the binary; a template that fails to parse is
//! a build defect, not a runtime condition.

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

pub const PLAN: &str = "plan.md";
pub const ABANDONED_ALERT: &str = "abandoned_alert.md";
pub const CRITICAL_FAILURE_ALERT: &str = "critical_failure_alert.md";
pub const CONTINUATION_PROMPT: &str = "continuation_prompt.md";

const SOURCES: [(&str, &str); 4] = [
    (PLAN, include_str!("templates/plan.md")),
    (ABANDONED_ALERT, include_str!("templates/abandoned_alert.md")),
    (
        CRITICAL_FAILURE_ALERT,
        include_str!("templates/critical_failure_alert.md"),
    ),
    (
        CONTINUATION_PROMPT,
        include_str!("templates/continuation_prompt.md"),
    ),
];

/// Template engine wrapper around minijinja.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);
        for (name, source) in SOURCES {
            env.add_template(name, source)
                .expect("bundled templates should be valid");
        }
        Self { env }
    }

    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("load template {name}"))?;
        template
            .render(ctx)
            .with_context(|| format!("render template {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn all_templates_compile() {
        let engine = TemplateEngine::new();
        for (name, _) in SOURCES {
            assert!(engine.env.get_template(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn continuation_without_output_says_so() {
        let rendered = TemplateEngine::new()
            .render(
                CONTINUATION_PROMPT,
                context! { iteration => 2, token => "<DONE>", goal => "Ship it", tail => "" },
            )
            .expect("render");
        assert!(rendered.starts_with("LOOP CONTINUATION (Iteration 2)\n"));
        assert!(rendered.contains("(no output captured)\n"));
        assert!(!rendered.contains("...("));
        assert!(rendered.ends_with("output exactly: <DONE>\n"));
    }
}
