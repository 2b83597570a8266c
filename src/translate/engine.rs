//! The one in-scope component: sequences the fixed pipeline
//! normalize → tokenize → generate → decode+denormalize over an
//! immutable, process-lifetime set of collaborators.

use std::path::Path;
use tracing::{debug, info};

use crate::config::TranslatorConfig;
use crate::errors::ServiceError;
use crate::translate::interface::{
    GenerationOptions, GenerativeModel, LanguagePair, Normalizer, Tokenizer,
};
use crate::translate::model::{ExecutionContext, IndicTransModel};
use crate::translate::processor::IndicProcessor;
use crate::translate::tokenizer::IndicTokenizer;

pub struct TranslationEngine {
    pair: LanguagePair,
    options: GenerationOptions,
    normalizer: Box<dyn Normalizer>,
    tokenizer: Box<dyn Tokenizer>,
    model: Box<dyn GenerativeModel>,
}

impl TranslationEngine {
    /// Load the real collaborators from the configured checkpoint.
    /// Any failure here is fatal; the service never reaches "ready".
    pub fn load(config: &TranslatorConfig) -> Result<Self, ServiceError> {
        let ctx = ExecutionContext::resolve(config.device)?;
        info!(device = ?ctx.device, dtype = ?ctx.dtype, "resolved execution context");

        let model_dir = Path::new(&config.model_dir);
        let model = IndicTransModel::load(model_dir, ctx)?;
        let tokenizer = IndicTokenizer::load(model_dir, config.max_length)?;
        info!(model_dir = %config.model_dir, "loaded translation model");

        Ok(Self::new(
            LanguagePair {
                src: config.src_lang.clone(),
                tgt: config.tgt_lang.clone(),
            },
            GenerationOptions {
                max_length: config.max_length,
                num_beams: config.num_beams,
            },
            Box::new(IndicProcessor::new()),
            Box::new(tokenizer),
            Box::new(model),
        ))
    }

    pub fn new(
        pair: LanguagePair,
        options: GenerationOptions,
        normalizer: Box<dyn Normalizer>,
        tokenizer: Box<dyn Tokenizer>,
        model: Box<dyn GenerativeModel>,
    ) -> Self {
        Self {
            pair,
            options,
            normalizer,
            tokenizer,
            model,
        }
    }

    /// Translate a batch. Output order matches input order and the
    /// lengths are equal; the batch succeeds or fails atomically.
    pub fn translate(&self, sentences: &[String]) -> Result<Vec<String>, ServiceError> {
        if sentences.is_empty() {
            return Err(ServiceError::InvalidInput);
        }

        let prepared = self.normalizer.preprocess(sentences, &self.pair)?;
        let texts: Vec<String> = prepared.iter().map(|p| p.text.clone()).collect();

        let batch = self.tokenizer.encode(&texts)?;
        debug!(
            sentences = sentences.len(),
            width = batch.width(),
            "encoded batch"
        );

        let generated = self.model.generate(&batch, &self.options)?;
        if generated.len() != sentences.len() {
            return Err(ServiceError::ModelExecution(format!(
                "model produced {} sequences for {} inputs",
                generated.len(),
                sentences.len()
            )));
        }

        let decoded = self.tokenizer.decode(&generated)?;
        let translations = self.normalizer.postprocess(decoded, &prepared, &self.pair.tgt)?;
        if translations.len() != sentences.len() {
            return Err(ServiceError::ModelExecution(format!(
                "pipeline produced {} translations for {} inputs",
                translations.len(),
                sentences.len()
            )));
        }
        Ok(translations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::interface::{PreparedSentence, TokenBatch};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct PassThroughNormalizer;

    impl Normalizer for PassThroughNormalizer {
        fn preprocess(
            &self,
            sentences: &[String],
            pair: &LanguagePair,
        ) -> Result<Vec<PreparedSentence>, ServiceError> {
            Ok(sentences
                .iter()
                .map(|s| PreparedSentence::bare(format!("{} {} {}", pair.src, pair.tgt, s)))
                .collect())
        }

        fn postprocess(
            &self,
            outputs: Vec<String>,
            _prepared: &[PreparedSentence],
            _tgt_lang: &str,
        ) -> Result<Vec<String>, ServiceError> {
            Ok(outputs)
        }
    }

    /// Encodes each sentence as its byte values; decoding reverses it.
    struct ByteTokenizer;

    impl Tokenizer for ByteTokenizer {
        fn encode(&self, texts: &[String]) -> Result<TokenBatch, ServiceError> {
            let rows = texts
                .iter()
                .map(|t| t.bytes().map(u32::from).collect())
                .collect();
            Ok(crate::translate::tokenizer::pad_longest(rows, 0))
        }

        fn decode(&self, batch: &[Vec<u32>]) -> Result<Vec<String>, ServiceError> {
            Ok(batch
                .iter()
                .map(|row| {
                    let bytes: Vec<u8> =
                        row.iter().filter(|&&id| id != 0).map(|&id| id as u8).collect();
                    String::from_utf8_lossy(&bytes).into_owned()
                })
                .collect())
        }
    }

    /// Echoes the unpadded input rows, counting invocations.
    struct EchoModel {
        calls: Arc<AtomicUsize>,
    }

    impl GenerativeModel for EchoModel {
        fn generate(
            &self,
            batch: &TokenBatch,
            _options: &GenerationOptions,
        ) -> Result<Vec<Vec<u32>>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(batch
                .input_ids
                .iter()
                .zip(&batch.attention_mask)
                .map(|(row, mask)| {
                    row.iter()
                        .zip(mask)
                        .filter(|(_, &m)| m == 1)
                        .map(|(&id, _)| id)
                        .collect()
                })
                .collect())
        }
    }

    struct TruncatingModel;

    impl GenerativeModel for TruncatingModel {
        fn generate(
            &self,
            _batch: &TokenBatch,
            _options: &GenerationOptions,
        ) -> Result<Vec<Vec<u32>>, ServiceError> {
            Ok(vec![vec![1]])
        }
    }

    fn engine_with_model(model: Box<dyn GenerativeModel>) -> TranslationEngine {
        TranslationEngine::new(
            LanguagePair {
                src: "eng_Latn".to_string(),
                tgt: "pan_Guru".to_string(),
            },
            GenerationOptions::default(),
            Box::new(PassThroughNormalizer),
            Box::new(ByteTokenizer),
            model,
        )
    }

    fn echo_engine() -> (TranslationEngine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine_with_model(Box::new(EchoModel {
            calls: calls.clone(),
        }));
        (engine, calls)
    }

    #[test]
    fn empty_batch_is_invalid_input_and_skips_the_model() {
        let (engine, calls) = echo_engine();
        let result = engine.translate(&[]);
        assert!(matches!(result, Err(ServiceError::InvalidInput)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn output_preserves_order_and_length() {
        let (engine, _) = echo_engine();
        let sentences: Vec<String> = ["alpha", "beta", "gamma"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let translations = engine.translate(&sentences).unwrap();
        assert_eq!(translations.len(), 3);
        for (input, output) in sentences.iter().zip(&translations) {
            assert!(output.ends_with(input.as_str()));
        }
    }

    #[test]
    fn translation_is_deterministic() {
        let (engine, _) = echo_engine();
        let sentences = vec!["Hello, how are you?".to_string()];
        let first = engine.translate(&sentences).unwrap();
        let second = engine.translate(&sentences).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn batch_padding_does_not_change_a_sentence_result() {
        let (engine, _) = echo_engine();
        let single = engine.translate(&["short".to_string()]).unwrap();
        let batched = engine
            .translate(&[
                "short".to_string(),
                "a considerably longer sentence that forces padding".to_string(),
            ])
            .unwrap();
        assert_eq!(single[0], batched[0]);
    }

    #[test]
    fn wrong_arity_from_the_model_is_a_model_error() {
        let engine = engine_with_model(Box::new(TruncatingModel));
        let result = engine.translate(&["one".to_string(), "two".to_string()]);
        assert!(matches!(result, Err(ServiceError::ModelExecution(_))));
    }

    #[test]
    fn single_empty_string_is_not_invalid_input() {
        let (engine, calls) = echo_engine();
        let translations = engine.translate(&["".to_string()]).unwrap();
        assert_eq!(translations.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
