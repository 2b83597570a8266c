//! Inference-side text normalization, modelled on the IndicTrans
//! processor: unicode punctuation cleanup and entity placeholding
//! before tokenization, placeholder restoration and detokenization
//! after decoding.
//!
//! Unlike the upstream processor this one is stateless: the
//! per-sentence placeholder maps travel with the request instead of
//! sitting in an internal queue, so the loaded context stays immutable
//! across concurrent requests.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ServiceError;
use crate::translate::interface::{LanguagePair, Normalizer, PreparedSentence};

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:https?://|www\.)[^\s<>\(\)]+").expect("url regex")
});

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
});

static MULTI_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("space regex"));

/// Space inserted by subword joining before closing punctuation.
static SPACE_BEFORE_PUNCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([।.,!?;:%\)\]\}])").expect("punct regex"));

static SPACE_AFTER_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\(\[\{])\s+").expect("open bracket regex"));

pub struct IndicProcessor;

impl IndicProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Map typographic punctuation to the ASCII forms the model was
    /// trained on.
    fn normalize_punctuation(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            match ch {
                '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => out.push('"'),
                '\u{2018}' | '\u{2019}' | '\u{201A}' => out.push('\''),
                '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2212}' => {
                    out.push('-')
                }
                '\u{2026}' => out.push_str("..."),
                '\u{00A0}' | '\u{2009}' | '\u{200A}' | '\u{3000}' => out.push(' '),
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => {}
                _ => out.push(ch),
            }
        }
        out
    }

    /// Replace entities the model should not attempt to translate
    /// (URLs, e-mail addresses) with numbered placeholders.
    fn wrap_entities(text: &str) -> (String, Vec<(String, String)>) {
        let mut placeholders = Vec::new();
        let mut wrapped = text.to_string();
        for re in [&*EMAIL_RE, &*URL_RE] {
            loop {
                let Some((range, original)) = re
                    .find(&wrapped)
                    .map(|m| (m.range(), m.as_str().to_string()))
                else {
                    break;
                };
                let placeholder = format!("ID{}", placeholders.len() + 1);
                wrapped.replace_range(range, &placeholder);
                placeholders.push((placeholder, original));
            }
        }
        (wrapped, placeholders)
    }
}

impl Default for IndicProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer for IndicProcessor {
    fn preprocess(
        &self,
        sentences: &[String],
        pair: &LanguagePair,
    ) -> Result<Vec<PreparedSentence>, ServiceError> {
        let prepared = sentences
            .iter()
            .map(|sentence| {
                let cleaned = Self::normalize_punctuation(sentence.trim());
                let cleaned = MULTI_SPACE_RE.replace_all(&cleaned, " ").into_owned();
                let (wrapped, placeholders) = Self::wrap_entities(&cleaned);
                PreparedSentence {
                    text: format!("{} {} {}", pair.src, pair.tgt, wrapped),
                    placeholders,
                }
            })
            .collect();
        Ok(prepared)
    }

    fn postprocess(
        &self,
        outputs: Vec<String>,
        prepared: &[PreparedSentence],
        _tgt_lang: &str,
    ) -> Result<Vec<String>, ServiceError> {
        if outputs.len() != prepared.len() {
            return Err(ServiceError::ModelExecution(format!(
                "postprocess arity mismatch: {} outputs for {} inputs",
                outputs.len(),
                prepared.len()
            )));
        }

        let restored = outputs
            .into_iter()
            .zip(prepared)
            .map(|(output, sentence)| {
                let mut text = output;
                // Reverse order: a nested entity (an e-mail inside a
                // URL) is wrapped inner-first, so its placeholder
                // only appears once the outer one is restored.
                for (placeholder, original) in sentence.placeholders.iter().rev() {
                    text = text.replace(placeholder.as_str(), original);
                }
                let text = SPACE_BEFORE_PUNCT_RE.replace_all(&text, "$1");
                let text = SPACE_AFTER_OPEN_RE.replace_all(&text, "$1");
                MULTI_SPACE_RE.replace_all(&text, " ").trim().to_string()
            })
            .collect();
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> LanguagePair {
        LanguagePair {
            src: "eng_Latn".to_string(),
            tgt: "pan_Guru".to_string(),
        }
    }

    fn preprocess_one(text: &str) -> PreparedSentence {
        IndicProcessor::new()
            .preprocess(&[text.to_string()], &pair())
            .unwrap()
            .remove(0)
    }

    #[test]
    fn prefixes_language_tags() {
        let prepared = preprocess_one("Hello, how are you?");
        assert_eq!(prepared.text, "eng_Latn pan_Guru Hello, how are you?");
        assert!(prepared.placeholders.is_empty());
    }

    #[test]
    fn normalizes_typographic_punctuation() {
        let prepared = preprocess_one("\u{201C}Hi\u{201D} \u{2014} it\u{2019}s me\u{2026}");
        assert_eq!(prepared.text, "eng_Latn pan_Guru \"Hi\" - it's me...");
    }

    #[test]
    fn wraps_urls_and_emails_in_placeholders() {
        let prepared = preprocess_one("Mail me@example.com or visit https://example.com/a");
        assert_eq!(
            prepared.text,
            "eng_Latn pan_Guru Mail ID1 or visit ID2"
        );
        assert_eq!(prepared.placeholders.len(), 2);
        assert_eq!(prepared.placeholders[0].1, "me@example.com");
        assert_eq!(prepared.placeholders[1].1, "https://example.com/a");
    }

    #[test]
    fn empty_and_whitespace_sentences_survive() {
        let processor = IndicProcessor::new();
        let prepared = processor
            .preprocess(&["".to_string(), "   \t ".to_string()], &pair())
            .unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].text, "eng_Latn pan_Guru ");
        assert_eq!(prepared[1].text, "eng_Latn pan_Guru ");
    }

    #[test]
    fn postprocess_restores_placeholders_and_spacing() {
        let processor = IndicProcessor::new();
        let prepared = vec![PreparedSentence {
            text: String::new(),
            placeholders: vec![("ID1".to_string(), "https://example.com".to_string())],
        }];
        let outputs = vec!["ਵੇਖੋ ID1 , ਧੰਨਵਾਦ ।".to_string()];
        let restored = processor
            .postprocess(outputs, &prepared, "pan_Guru")
            .unwrap();
        assert_eq!(restored, vec!["ਵੇਖੋ https://example.com, ਧੰਨਵਾਦ।"]);
    }

    #[test]
    fn nested_entities_restore_completely() {
        let processor = IndicProcessor::new();
        let prepared = processor
            .preprocess(
                &["See https://user@example.com/profile today".to_string()],
                &pair(),
            )
            .unwrap();
        // The e-mail is wrapped first, so the URL's recorded original
        // still contains the inner placeholder.
        assert_eq!(prepared[0].text, "eng_Latn pan_Guru See ID2 today");
        assert_eq!(prepared[0].placeholders[0].1, "user@example.com");
        assert_eq!(prepared[0].placeholders[1].1, "https://ID1/profile");

        let restored = processor
            .postprocess(vec!["ਵੇਖੋ ID2 ਅੱਜ".to_string()], &prepared, "pan_Guru")
            .unwrap();
        assert_eq!(restored, vec!["ਵੇਖੋ https://user@example.com/profile ਅੱਜ"]);
    }

    #[test]
    fn postprocess_rejects_arity_mismatch() {
        let processor = IndicProcessor::new();
        let result = processor.postprocess(vec!["x".to_string()], &[], "pan_Guru");
        assert!(matches!(result, Err(ServiceError::ModelExecution(_))));
    }

    #[test]
    fn preprocess_keeps_order_and_length() {
        let processor = IndicProcessor::new();
        let sentences = vec!["first".to_string(), "second".to_string(), "third".to_string()];
        let prepared = processor.preprocess(&sentences, &pair()).unwrap();
        assert_eq!(prepared.len(), 3);
        assert!(prepared[0].text.ends_with("first"));
        assert!(prepared[2].text.ends_with("third"));
    }
}
