//! Prompt assembly: system roles and step templates.
//!
//! Roles are derived from the step name, templates from the step's position
//! in the chain. Rendering is literal `{{var}}` replacement, so an assembled
//! prompt can never carry an unresolved token for a known variable.

use std::collections::HashMap;

/// System role a step speaks with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Translator,
    Reviewer,
    Improver,
}

/// Derive the role from the step name: reflection/review steps get the
/// reviewer role, improvement/polish steps the improver role, everything
/// else translates.
pub fn role_for_step(step_name: &str) -> Role {
    let lower = step_name.to_lowercase();
    if lower.contains("reflection") || lower.contains("review") {
        Role::Reviewer
    } else if lower.contains("improvement") || lower.contains("improve") || lower.contains("polish")
    {
        Role::Improver
    } else {
        Role::Translator
    }
}

pub fn system_role(role: Role) -> &'static str {
    match role {
        Role::Translator => {
            "You are a professional translator. You translate faithfully, preserving the \
             structure, tone and register of the source text."
        }
        Role::Reviewer => {
            "You are an expert translation reviewer. You examine translations against their \
             source and report concrete, actionable issues."
        }
        Role::Improver => {
            "You are an expert translation editor. You produce a final, polished translation \
             by applying review feedback."
        }
    }
}

/// Template selector, keyed by the step's function in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Standard,
    Reflection,
    Improvement,
    Simple,
}

/// Formatting rules every template carries verbatim
const FORMATTING_RULES: &str = "\
Formatting rules:
- Do not modify Markdown syntax: keep headings, emphasis, links, tables and list markers exactly as they appear.
- Do not modify LaTeX commands or environments.
- Do not modify HTML tags or attributes.";

/// Preserve-marker clause every template carries verbatim
const PRESERVE_CLAUSE: &str = "\
Anything of the form @@PRESERVE_<digits>@@ is an opaque placeholder. Do not translate, alter, reorder or remove these tokens; reproduce each one exactly as it appears.";

/// Node-marker clause added when a batched request is assembled
const NODE_CLAUSE: &str = "\
The text contains node boundary markers of the form @@NODE_START_<digits>@@ and @@NODE_END_<digits>@@. Preserve every marker token exactly as written, on its own line, and translate only the content between a matching start and end pair.";

const STANDARD_TEMPLATE: &str = "\
Translate the following text from {{source_language}} to {{target_language}}.{{country_clause}}

{{formatting_rules}}

{{preserve_clause}}{{node_clause}}{{notes_clause}}

Text to translate:
{{text}}";

const REFLECTION_TEMPLATE: &str = "\
Review the following {{target_language}} translation of a {{source_language}} source text.{{country_clause}}
List concrete issues with accuracy, fluency, terminology and style. If the translation has no issues, answer exactly \"No issues.\"

{{formatting_rules}}

{{preserve_clause}}{{node_clause}}{{notes_clause}}

Source text:
{{original_text}}

Translation to review:
{{translation}}";

const IMPROVEMENT_TEMPLATE: &str = "\
Produce the final {{target_language}} translation of the {{source_language}} source text below, applying the review feedback.{{country_clause}}
Output only the improved translation, with no commentary.

{{formatting_rules}}

{{preserve_clause}}{{node_clause}}{{notes_clause}}

Source text:
{{original_text}}

Current translation:
{{translation}}

Review feedback:
{{feedback}}";

const SIMPLE_TEMPLATE: &str = "\
Translate from {{source_language}} to {{target_language}}. Output only the translation.

{{preserve_clause}}{{node_clause}}{{notes_clause}}

{{text}}";

/// Variables a template may consume
pub const KNOWN_VARS: &[&str] = &[
    "text",
    "source_language",
    "target_language",
    "country",
    "original_text",
    "translation",
    "initial_translation",
    "feedback",
    "reflection",
    "ai_review",
    "additional_notes",
];

fn template_for(kind: TemplateKind) -> &'static str {
    match kind {
        TemplateKind::Standard => STANDARD_TEMPLATE,
        TemplateKind::Reflection => REFLECTION_TEMPLATE,
        TemplateKind::Improvement => IMPROVEMENT_TEMPLATE,
        TemplateKind::Simple => SIMPLE_TEMPLATE,
    }
}

/// Literal `{{var}}` replacement. Unknown variables in the map are applied
/// too; known variables missing from the map render as empty strings.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    for key in KNOWN_VARS {
        out = out.replace(&format!("{{{{{key}}}}}"), "");
    }
    out
}

/// A fully rendered prompt pair
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
}

/// Build the system and user messages for one step invocation.
///
/// `vars` carries the positional bindings from the chain; `batch` switches
/// the node-marker clause on; `additional_notes` is the step's free-form
/// user guidance.
pub fn assemble(
    step_name: &str,
    kind: TemplateKind,
    vars: &HashMap<String, String>,
    batch: bool,
    additional_notes: &str,
) -> AssembledPrompt {
    let mut vars = vars.clone();
    let country_clause = vars
        .get("country")
        .filter(|c| !c.is_empty())
        .map(|c| format!(" Use phrasing natural for {c}."))
        .unwrap_or_default();
    vars.insert("country_clause".to_string(), country_clause);
    vars.insert(
        "formatting_rules".to_string(),
        FORMATTING_RULES.to_string(),
    );
    vars.insert("preserve_clause".to_string(), PRESERVE_CLAUSE.to_string());
    vars.insert(
        "node_clause".to_string(),
        if batch {
            format!("\n\n{NODE_CLAUSE}")
        } else {
            String::new()
        },
    );
    vars.insert(
        "notes_clause".to_string(),
        if additional_notes.trim().is_empty() {
            String::new()
        } else {
            format!("\n\nAdditional notes:\n{}", additional_notes.trim())
        },
    );

    AssembledPrompt {
        system: system_role(role_for_step(step_name)).to_string(),
        user: render(template_for(kind), &vars),
    }
}
