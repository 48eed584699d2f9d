//! Chain execution over a single chunk: sequence the configured steps,
//! threading each step's output and the prior outputs into the next step's
//! bindings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backend::BackendRegistry;
use crate::context::JobContext;
use crate::error::{Result, TranslateError};
use crate::prompt::{role_for_step, Role, TemplateKind};
use crate::step::{StepExecutor, StepInput, StepKind, StepResult, StepSpec};

/// Reflection verdicts that short-circuit the improvement step
const SHORT_CIRCUIT_PHRASES: &[&str] = &["no issues", "perfect"];

/// Ordered list of steps applied to one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSpec {
    pub steps: Vec<StepSpec>,

    /// Keep going with the last good output when a step fails terminally
    #[serde(default)]
    pub continue_on_error: bool,
}

impl ChainSpec {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            steps,
            continue_on_error: false,
        }
    }

    /// Canonical three-step refinement chain: initial, reflection,
    /// improvement, all on one chat backend.
    pub fn refinement(backend: &str, model: &str) -> Self {
        Self::new(vec![
            StepSpec::new("initial", backend, StepKind::Llm).with_model(model),
            StepSpec::new("reflection", backend, StepKind::Llm).with_model(model),
            StepSpec::new("improvement", backend, StepKind::Llm).with_model(model),
        ])
    }

    /// Single translation step with no refinement
    pub fn single(backend: &str, model: &str, kind: StepKind) -> Self {
        Self::new(vec![StepSpec::new("initial", backend, kind).with_model(model)])
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Validate the chain shape, and the backend assignments when a
    /// registry is supplied.
    pub fn validate(&self, registry: Option<&BackendRegistry>) -> Result<()> {
        if self.steps.is_empty() {
            return Err(TranslateError::validation("chain has no steps"));
        }

        let mut seen = std::collections::HashSet::new();
        let mut passthrough_started = false;
        for (index, step) in self.steps.iter().enumerate() {
            if !seen.insert(step.name.as_str()) {
                return Err(TranslateError::validation(format!(
                    "duplicate step name \"{}\"",
                    step.name
                )));
            }
            if !(0.0..=2.0).contains(&step.temperature) {
                return Err(TranslateError::validation(format!(
                    "step \"{}\" temperature {} out of range [0, 2]",
                    step.name, step.temperature
                )));
            }
            if passthrough_started && step.kind != StepKind::Passthrough {
                return Err(TranslateError::validation(format!(
                    "step \"{}\" follows a passthrough step and must also be passthrough",
                    step.name
                )));
            }
            if step.kind == StepKind::Passthrough {
                passthrough_started = true;
            }
            // Refinement roles need a conversational backend
            if index > 0 && self.steps.len() > 1 && step.kind == StepKind::DirectMt {
                return Err(TranslateError::validation(format!(
                    "step \"{}\" at index {index} is direct-mt; refinement steps must be llm or passthrough",
                    step.name
                )));
            }
            if let Some(registry) = registry {
                if step.kind != StepKind::Passthrough {
                    let adapter = registry.get(&step.backend)?;
                    if index > 0 && !adapter.supports_steps() {
                        return Err(TranslateError::validation(format!(
                            "backend \"{}\" cannot serve refinement step \"{}\"",
                            step.backend, step.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Outcome of running a chain over one chunk
#[derive(Debug)]
pub struct ChainResult {
    pub output: String,
    pub steps: Vec<StepResult>,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<TranslateError>,
}

impl ChainResult {
    pub fn tokens_in(&self) -> u32 {
        self.steps.iter().map(|s| s.tokens_in).sum()
    }

    pub fn tokens_out(&self) -> u32 {
        self.steps.iter().map(|s| s.tokens_out).sum()
    }
}

fn template_for_step(step: &StepSpec, chain_len: usize) -> TemplateKind {
    match role_for_step(&step.name) {
        Role::Reviewer => TemplateKind::Reflection,
        Role::Improver => TemplateKind::Improvement,
        Role::Translator if chain_len == 1 => TemplateKind::Simple,
        Role::Translator => TemplateKind::Standard,
    }
}

fn should_short_circuit(reflection_output: &str) -> bool {
    let lower = reflection_output.to_lowercase();
    SHORT_CIRCUIT_PHRASES.iter().any(|p| lower.contains(p))
}

/// Runs a chain over one chunk at a time
pub struct ChainRunner {
    executor: Arc<StepExecutor>,
    spec: ChainSpec,
}

impl ChainRunner {
    pub fn new(executor: Arc<StepExecutor>, spec: ChainSpec) -> Self {
        Self { executor, spec }
    }

    pub fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    /// Positional variable bindings for the step at `index`
    fn bindings(
        &self,
        index: usize,
        chunk_text: &str,
        results: &[StepResult],
        ctx: &JobContext,
    ) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("source_language".into(), ctx.source_language.clone());
        vars.insert("target_language".into(), ctx.target_language.clone());
        if let Some(country) = &ctx.country {
            vars.insert("country".into(), country.clone());
        }
        vars.insert("original_text".into(), chunk_text.to_string());

        match index {
            0 => {
                vars.insert("text".into(), chunk_text.to_string());
            }
            1 => {
                let initial = results[0].output.clone();
                vars.insert("text".into(), initial.clone());
                vars.insert("translation".into(), initial.clone());
                vars.insert("initial_translation".into(), initial);
            }
            2 => {
                let initial = results[0].output.clone();
                let review = results[1].output.clone();
                vars.insert("text".into(), initial.clone());
                vars.insert("translation".into(), initial.clone());
                vars.insert("initial_translation".into(), initial);
                vars.insert("reflection".into(), review.clone());
                vars.insert("feedback".into(), review.clone());
                vars.insert("ai_review".into(), review);
            }
            _ => {
                // Any later step sees the latest non-empty output
                let latest = results
                    .iter()
                    .rev()
                    .find(|r| !r.output.is_empty())
                    .map(|r| r.output.clone())
                    .unwrap_or_else(|| chunk_text.to_string());
                vars.insert("text".into(), latest.clone());
                vars.insert("translation".into(), latest);
            }
        }
        vars
    }

    /// Prior outputs relevant to the cache fingerprint of step `index`
    fn cache_context(&self, index: usize, results: &[StepResult]) -> Option<String> {
        if index == 0 {
            return None;
        }
        let joined = results
            .iter()
            .take(index)
            .map(|r| r.output.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Some(joined)
    }

    pub async fn run(&self, chunk_text: &str, batch: bool, ctx: &JobContext) -> ChainResult {
        let started = Instant::now();
        let chain_len = self.spec.steps.len();
        let mut results: Vec<StepResult> = Vec::with_capacity(chain_len);
        let mut error: Option<TranslateError> = None;

        for (index, step) in self.spec.steps.iter().enumerate() {
            if ctx.is_cancelled() {
                error = Some(TranslateError::cancelled().with_step(step.name.clone()));
                break;
            }

            // Passthrough echoes the text flowing through the chain; every
            // other kind works from the chunk input.
            let input_text = if step.kind == StepKind::Passthrough {
                results
                    .iter()
                    .rev()
                    .find(|r| !r.output.is_empty())
                    .map(|r| r.output.clone())
                    .unwrap_or_else(|| chunk_text.to_string())
            } else {
                chunk_text.to_string()
            };

            let input = StepInput {
                text: input_text,
                template: template_for_step(step, chain_len),
                vars: self.bindings(index, chunk_text, &results, ctx),
                batch,
                cache_context: self.cache_context(index, &results),
            };

            match self.executor.execute(step, &input, ctx).await {
                Ok(result) => {
                    debug!(step = %step.name, from_cache = result.from_cache, "step complete");
                    let reviewer = role_for_step(&step.name) == Role::Reviewer;
                    let short_circuit = reviewer
                        && index + 1 < chain_len
                        && should_short_circuit(&result.output);
                    results.push(result);
                    if short_circuit {
                        debug!(step = %step.name, "review found no issues, skipping refinement");
                        break;
                    }
                }
                Err(e) => {
                    warn!(step = %step.name, error = %e, "step failed terminally");
                    error = Some(e);
                    break;
                }
            }
        }

        // The final output is the latest non-review output; a review verdict
        // is feedback, not a translation. On a terminal error the partial is
        // only carried forward when the chain is configured to continue;
        // otherwise the chain fails with no output.
        let output = if error.is_none() || self.spec.continue_on_error {
            results
                .iter()
                .rev()
                .find(|r| !r.output.is_empty() && role_for_step(&r.name) != Role::Reviewer)
                .map(|r| r.output.clone())
                .unwrap_or_else(|| chunk_text.to_string())
        } else {
            String::new()
        };

        let success = error.is_none();
        ChainResult {
            output,
            steps: results,
            duration: started.elapsed(),
            success,
            error,
        }
    }
}
