//! Collaborator seams for the translation pipeline.
//!
//! The engine sequences three components: a text normalizer, a
//! tokenizer, and a generative model. Each is behind a trait so the
//! HTTP surface can be exercised with lightweight stand-ins. The
//! traits are synchronous: the pipeline is compute-bound and runs on
//! the blocking pool, never across an await point.

use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// The fixed source/target pair, e.g. `eng_Latn` → `pan_Guru`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePair {
    pub src: String,
    pub tgt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranslateRequest {
    /// Ordered, independent input sentences. `Option` so a missing
    /// field reports the same client error as an empty list.
    #[serde(default)]
    pub sentences: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranslateResponse {
    /// Positionally aligned with the request sentences.
    pub translations: Vec<String>,
}

/// A sentence after preprocessing: the tagged, normalized text plus
/// the placeholder substitutions to undo after generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSentence {
    pub text: String,
    pub placeholders: Vec<(String, String)>,
}

impl PreparedSentence {
    pub fn bare(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            placeholders: Vec::new(),
        }
    }
}

/// A tokenized batch, right-padded to its longest row. The mask is 1
/// for real tokens and 0 for padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
}

impl TokenBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Width of the padded batch (0 for an empty batch).
    pub fn width(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOptions {
    /// Hard cap on generated tokens per sentence.
    pub max_length: usize,
    /// Beam width; only 1 (greedy) is supported.
    pub num_beams: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_length: 256,
            num_beams: 1,
        }
    }
}

/// Language-specific text transforms applied around model inference.
pub trait Normalizer: Send + Sync {
    /// Normalize raw sentences for the fixed pair: punctuation
    /// cleanup, entity placeholding, language-tag prefixing.
    fn preprocess(
        &self,
        sentences: &[String],
        pair: &LanguagePair,
    ) -> Result<Vec<PreparedSentence>, ServiceError>;

    /// Reverse the inference-side transforms on decoded output,
    /// restoring the entities captured during `preprocess`.
    fn postprocess(
        &self,
        outputs: Vec<String>,
        prepared: &[PreparedSentence],
        tgt_lang: &str,
    ) -> Result<Vec<String>, ServiceError>;
}

/// Maps normalized text to padded token batches and back.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, texts: &[String]) -> Result<TokenBatch, ServiceError>;

    fn decode(&self, batch: &[Vec<u32>]) -> Result<Vec<String>, ServiceError>;
}

/// The pretrained encoder-decoder network, treated as a black box
/// with a generate contract.
pub trait GenerativeModel: Send + Sync {
    /// Produce one output token sequence per input row, in order.
    fn generate(
        &self,
        batch: &TokenBatch,
        options: &GenerationOptions,
    ) -> Result<Vec<Vec<u32>>, ServiceError>;
}
