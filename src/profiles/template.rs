use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::Deserialize;

/// Placeholder carrying the base64-encoded image into a prompt.
pub const PLACEHOLDER_IMAGE: &str = "IMAGE";
/// Placeholder carrying the output under correction into a rewrite prompt.
pub const PLACEHOLDER_PRIOR_OUTPUT: &str = "PRIOR_OUTPUT";

fn placeholder_pattern() -> Regex {
    // Compiled per call-site once via OnceLock in callers that loop; the
    // template set is only parsed at load/reload time.
    Regex::new(r"\{\{([A-Z][A-Z0-9_]*)\}\}").unwrap()
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template uses undeclared placeholder {{{{{0}}}}}")]
    UndeclaredPlaceholder(String),

    #[error("template must contain {{{{{0}}}}}")]
    MissingRequiredPlaceholder(String),

    #[error("no value supplied for placeholder {{{{{0}}}}}")]
    MissingValue(String),
}

/// On-disk shape of a prompt block.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptDoc {
    pub system: String,
    pub user: String,
    #[serde(default)]
    pub placeholders: Vec<String>,
}

/// A validated prompt pair. Placeholders found in the text are guaranteed
/// to be a subset of the declared set.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system: String,
    pub user: String,
    declared: BTreeSet<String>,
}

impl PromptTemplate {
    /// Compile a prompt doc, rejecting undeclared placeholders. Unknown
    /// placeholders are a load-time error, never a render-time one.
    pub fn compile(doc: &PromptDoc) -> Result<Self, TemplateError> {
        let declared: BTreeSet<String> = doc.placeholders.iter().cloned().collect();
        let pattern = placeholder_pattern();
        for text in [&doc.system, &doc.user] {
            for cap in pattern.captures_iter(text) {
                let name = &cap[1];
                if !declared.contains(name) {
                    return Err(TemplateError::UndeclaredPlaceholder(name.to_string()));
                }
            }
        }
        Ok(Self {
            system: doc.system.clone(),
            user: doc.user.clone(),
            declared,
        })
    }

    /// Compile and additionally require the given placeholders to appear in
    /// the user template (corrective rewrites must carry the image and the
    /// prior output).
    pub fn compile_requiring(doc: &PromptDoc, required: &[&str]) -> Result<Self, TemplateError> {
        let template = Self::compile(doc)?;
        for name in required {
            let token = format!("{{{{{name}}}}}");
            if !template.user.contains(&token) {
                return Err(TemplateError::MissingRequiredPlaceholder(name.to_string()));
            }
        }
        Ok(template)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    /// Substitute placeholder values into both prompts. Every placeholder
    /// present in the text must have a value.
    pub fn render(
        &self,
        values: &BTreeMap<&str, String>,
    ) -> Result<RenderedPrompt, TemplateError> {
        Ok(RenderedPrompt {
            system: render_one(&self.system, values)?,
            user: render_one(&self.user, values)?,
        })
    }
}

fn render_one(text: &str, values: &BTreeMap<&str, String>) -> Result<String, TemplateError> {
    let pattern = placeholder_pattern();
    let mut missing: Option<String> = None;
    let rendered = pattern.replace_all(text, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        match values.get(name) {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(TemplateError::MissingValue(name)),
        None => Ok(rendered.into_owned()),
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}
