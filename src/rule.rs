use std::sync::LazyLock;

use cel_interpreter::{Program, Value};
use regex::Regex;
use tracing::debug;

use crate::activity::ActivityLink;
use crate::crd::PolicyRule;
use crate::error::{EngineError, Result};
use crate::expr::{Bindings, LinkBuffer, value_to_string};

/// Canonical summary template pattern: `{{ expr }}`.
static TEMPLATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("template pattern is valid"));

/* ============================= COMPILED RULE ============================= */

/// One `{{ expr }}` occurrence in a summary, pre-compiled.
struct SummaryTemplate {
    expression: String,
    program: Program,
}

/// A rule compiled at policy-admission time.
///
/// Invalid rules are retained but flagged; evaluation skips them silently
/// so one bad expression never poisons the rest of the policy.
pub struct CompiledRule {
    policy_name: String,
    rule_index: usize,
    match_expression: String,
    summary: String,
    match_program: Option<Program>,
    templates: Vec<SummaryTemplate>,
    valid: bool,
    compile_error: Option<String>,
}

impl CompiledRule {
    /// Compile a rule's match expression and its summary templates.
    ///
    /// Compilation failures never propagate; they mark the rule invalid
    /// with the error retained for the status reconciler to surface.
    pub fn compile(policy_name: &str, rule_index: usize, rule: &PolicyRule) -> Self {
        let mut compiled = CompiledRule {
            policy_name: policy_name.to_string(),
            rule_index,
            match_expression: rule.match_expression.clone(),
            summary: rule.summary.clone(),
            match_program: None,
            templates: Vec::new(),
            valid: false,
            compile_error: None,
        };

        match Program::compile(&rule.match_expression) {
            Ok(program) => compiled.match_program = Some(program),
            Err(e) => {
                compiled.compile_error = Some(
                    EngineError::MatchCompile {
                        rule_index,
                        reason: e.to_string(),
                    }
                    .to_string(),
                );
                debug!(
                    policy = %policy_name,
                    rule = rule_index,
                    error = %e,
                    "rule_match_compile_failed"
                );
                return compiled;
            }
        }

        for caps in TEMPLATE_PATTERN.captures_iter(&rule.summary) {
            let expression = caps.get(1).map_or("", |m| m.as_str()).trim().to_string();
            if expression.is_empty() {
                compiled.compile_error = Some(
                    EngineError::TemplateCompile {
                        rule_index,
                        reason: "empty template expression".to_string(),
                    }
                    .to_string(),
                );
                return compiled;
            }
            match Program::compile(&expression) {
                Ok(program) => compiled.templates.push(SummaryTemplate { expression, program }),
                Err(e) => {
                    compiled.compile_error = Some(
                        EngineError::TemplateCompile {
                            rule_index,
                            reason: e.to_string(),
                        }
                        .to_string(),
                    );
                    debug!(
                        policy = %policy_name,
                        rule = rule_index,
                        expression = %expression,
                        error = %e,
                        "rule_template_compile_failed"
                    );
                    return compiled;
                }
            }
        }

        compiled.valid = true;
        compiled
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn compile_error(&self) -> Option<&str> {
        self.compile_error.as_deref()
    }

    pub fn match_expression(&self) -> &str {
        &self.match_expression
    }

    pub fn summary_source(&self) -> &str {
        &self.summary
    }

    /// Evaluate the match expression against the bound input.
    ///
    /// Invalid rules are skipped: `Ok(false)`, never an error. A match
    /// program producing anything but a boolean is an evaluation error
    /// tagged with the rule index.
    pub fn evaluate_match(&self, bindings: &Bindings) -> Result<bool> {
        let Some(program) = (if self.valid { self.match_program.as_ref() } else { None }) else {
            return Ok(false);
        };

        let scratch = LinkBuffer::new();
        let ctx = bindings.evaluation_context(&scratch);
        match program.execute(&ctx) {
            Ok(Value::Bool(matched)) => Ok(matched),
            Ok(_) => Err(EngineError::evaluation(
                &self.policy_name,
                self.rule_index,
                "match expression returned non-boolean value",
            )),
            Err(e) => Err(EngineError::evaluation(&self.policy_name, self.rule_index, e)),
        }
    }

    /// Render the summary against the bound input.
    ///
    /// Templates are spliced left-to-right, one occurrence each, into the
    /// original summary; substituted text is never re-expanded. Returns
    /// the rendered summary and the links captured by `link()` calls, in
    /// call order.
    pub fn evaluate_summary(&self, bindings: &Bindings) -> Result<(String, Vec<ActivityLink>)> {
        if self.templates.is_empty() {
            return Ok((self.summary.clone(), Vec::new()));
        }

        let links = LinkBuffer::new();
        let ctx = bindings.evaluation_context(&links);

        let mut rendered = String::with_capacity(self.summary.len());
        let mut cursor = 0;
        for (found, template) in TEMPLATE_PATTERN
            .find_iter(&self.summary)
            .zip(self.templates.iter())
        {
            let value = template.program.execute(&ctx).map_err(|e| {
                EngineError::evaluation(
                    &self.policy_name,
                    self.rule_index,
                    format!("template '{}': {e}", template.expression),
                )
            })?;
            rendered.push_str(&self.summary[cursor..found.start()]);
            rendered.push_str(&value_to_string(&value));
            cursor = found.end();
        }
        rendered.push_str(&self.summary[cursor..]);

        Ok((rendered, links.take()))
    }
}

/* ============================= TESTS ============================= */
