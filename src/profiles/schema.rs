use garde::Validate;
use regex::Regex;
use serde::Deserialize;
use strum::{Display, EnumString};

use crate::models::qa::QaTier;
use crate::models::task::AnalysisType;
use crate::profiles::template::{
    PromptDoc, PromptTemplate, TemplateError, PLACEHOLDER_IMAGE, PLACEHOLDER_PRIOR_OUTPUT,
};

const DEFAULT_ANALYSIS_DEADLINE_SECS: u64 = 60;
const DEFAULT_QA_DEADLINE_SECS: u64 = 30;
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("profile validation failed: {0}")]
    Constraints(#[from] garde::Report),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("field '{field}' has an invalid pattern: {source}")]
    BadPattern {
        field: String,
        source: regex::Error,
    },

    #[error("file declares {declared} but was loaded for {expected}")]
    TypeMismatch { declared: String, expected: String },

    #[error("review prompt is required for the {0} tier")]
    MissingReviewPrompt(QaTier),
}

/// Model parameters shared by analysis and corrective profiles.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ModelParams {
    #[garde(length(min = 1))]
    pub name: String,

    #[garde(range(min = 0.0, max = 2.0))]
    pub temperature: f64,

    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[garde(range(min = 0))]
    #[serde(default = "default_top_k")]
    pub top_k: i64,

    #[garde(range(min = 1024, max = 131072))]
    pub context_size: i64,

    #[garde(range(min = 1))]
    pub max_output_tokens: i64,
}

fn default_top_p() -> f64 {
    0.9
}

fn default_top_k() -> i64 {
    40
}

/// Value kinds the structural tier can check a field against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// On-disk field constraint in an output schema.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FieldSpecDoc {
    #[garde(length(min = 1))]
    pub name: String,

    #[garde(skip)]
    pub kind: FieldKind,

    #[garde(skip)]
    #[serde(default = "default_required")]
    pub required: bool,

    #[garde(skip)]
    #[serde(default)]
    pub enum_values: Vec<String>,

    #[garde(skip)]
    pub min_length: Option<usize>,

    #[garde(skip)]
    pub max_length: Option<usize>,

    #[garde(skip)]
    pub min_items: Option<usize>,

    #[garde(skip)]
    pub max_items: Option<usize>,

    #[garde(skip)]
    pub pattern: Option<String>,
}

fn default_required() -> bool {
    true
}

/// A field constraint with its regex compiled at load time.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub enum_values: Vec<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub pattern: Option<Regex>,
}

impl FieldSpec {
    fn compile(doc: &FieldSpecDoc) -> Result<Self, SchemaError> {
        let pattern = match &doc.pattern {
            Some(p) => Some(Regex::new(p).map_err(|source| SchemaError::BadPattern {
                field: doc.name.clone(),
                source,
            })?),
            None => None,
        };
        Ok(Self {
            name: doc.name.clone(),
            kind: doc.kind,
            required: doc.required,
            enum_values: doc.enum_values.clone(),
            min_length: doc.min_length,
            max_length: doc.max_length,
            min_items: doc.min_items,
            max_items: doc.max_items,
            pattern,
        })
    }
}

/// Declared shape of a model output document.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
struct OutputSchemaDoc {
    #[garde(length(min = 1), dive)]
    fields: Vec<FieldSpecDoc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
struct QaSettingsDoc {
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_confidence_threshold")]
    confidence_threshold: f64,
}

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl Default for QaSettingsDoc {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// On-disk shape of one analysis profile (`config/analysis/<type>.yaml`).
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AnalysisProfileDoc {
    #[garde(skip)]
    pub analysis_type: AnalysisType,

    #[garde(length(min = 1))]
    pub version: String,

    #[garde(dive)]
    pub model: ModelParams,

    #[garde(skip)]
    pub prompts: PromptDoc,

    #[garde(dive)]
    output_schema: OutputSchemaDoc,

    #[garde(skip)]
    #[serde(default)]
    pub prohibited_phrases: Vec<String>,

    #[garde(dive)]
    #[serde(default)]
    qa: QaSettingsDoc,

    #[garde(range(min = 1, max = 600))]
    #[serde(default = "default_analysis_deadline")]
    pub deadline_seconds: u64,
}

fn default_analysis_deadline() -> u64 {
    DEFAULT_ANALYSIS_DEADLINE_SECS
}

/// Validated, compiled analysis profile. Immutable once built.
#[derive(Debug, Clone)]
pub struct AnalysisProfile {
    pub analysis_type: AnalysisType,
    pub version: String,
    pub model: ModelParams,
    pub prompt: PromptTemplate,
    pub output_schema: OutputSchema,
    pub prohibited_phrases: Vec<String>,
    pub confidence_threshold: f64,
    pub deadline_seconds: u64,
}

impl AnalysisProfile {
    pub fn from_yaml(raw: &str, expected: AnalysisType) -> Result<Self, SchemaError> {
        let doc: AnalysisProfileDoc = serde_yaml::from_str(raw)?;
        doc.validate()?;
        if doc.analysis_type != expected {
            return Err(SchemaError::TypeMismatch {
                declared: doc.analysis_type.to_string(),
                expected: expected.to_string(),
            });
        }
        let prompt = PromptTemplate::compile(&doc.prompts)?;
        let fields = doc
            .output_schema
            .fields
            .iter()
            .map(FieldSpec::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            analysis_type: doc.analysis_type,
            version: doc.version,
            model: doc.model,
            prompt,
            output_schema: OutputSchema { fields },
            prohibited_phrases: doc.prohibited_phrases,
            confidence_threshold: doc.qa.confidence_threshold,
            deadline_seconds: doc.deadline_seconds,
        })
    }
}

/// On-disk shape of one corrective stage
/// (`config/corrective/<type>/<tier>.yaml`).
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CorrectiveStageDoc {
    #[garde(skip)]
    pub analysis_type: AnalysisType,

    #[garde(skip)]
    pub tier: QaTier,

    #[garde(length(min = 1))]
    pub version: String,

    #[garde(dive)]
    pub model: ModelParams,

    /// Validator prompt; the structural tier is local-only and may omit it.
    #[garde(skip)]
    pub review_prompt: Option<PromptDoc>,

    #[garde(skip)]
    pub rewrite_prompt: PromptDoc,

    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[garde(range(min = 1, max = 600))]
    #[serde(default = "default_qa_deadline")]
    pub deadline_seconds: u64,
}

fn default_qa_deadline() -> u64 {
    DEFAULT_QA_DEADLINE_SECS
}

/// Validated corrective stage for one (analysis type, tier).
#[derive(Debug, Clone)]
pub struct CorrectiveStage {
    pub analysis_type: AnalysisType,
    pub tier: QaTier,
    pub version: String,
    pub model: ModelParams,
    pub review_prompt: Option<PromptTemplate>,
    pub rewrite_prompt: PromptTemplate,
    pub confidence_threshold: f64,
    pub deadline_seconds: u64,
}

impl CorrectiveStage {
    pub fn from_yaml(
        raw: &str,
        expected_type: AnalysisType,
        expected_tier: QaTier,
    ) -> Result<Self, SchemaError> {
        let doc: CorrectiveStageDoc = serde_yaml::from_str(raw)?;
        doc.validate()?;
        if doc.analysis_type != expected_type {
            return Err(SchemaError::TypeMismatch {
                declared: doc.analysis_type.to_string(),
                expected: expected_type.to_string(),
            });
        }
        if doc.tier != expected_tier {
            return Err(SchemaError::TypeMismatch {
                declared: doc.tier.to_string(),
                expected: expected_tier.to_string(),
            });
        }
        let review_prompt = match (&doc.review_prompt, doc.tier) {
            (Some(p), _) => Some(PromptTemplate::compile(p)?),
            (None, QaTier::Structural) => None,
            (None, tier) => return Err(SchemaError::MissingReviewPrompt(tier)),
        };
        let rewrite_prompt = PromptTemplate::compile_requiring(
            &doc.rewrite_prompt,
            &[PLACEHOLDER_IMAGE, PLACEHOLDER_PRIOR_OUTPUT],
        )?;
        Ok(Self {
            analysis_type: doc.analysis_type,
            tier: doc.tier,
            version: doc.version,
            model: doc.model,
            review_prompt,
            rewrite_prompt,
            confidence_threshold: doc.confidence_threshold,
            deadline_seconds: doc.deadline_seconds,
        })
    }
}
