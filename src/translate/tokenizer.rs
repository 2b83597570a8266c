//! SentencePiece tokenizer for the IndicTrans vocabulary layout:
//! separate source/target subword models (`model.SRC` / `model.TGT`)
//! with JSON id dictionaries. Language tags are ordinary vocabulary
//! entries looked up directly, not run through the subword model.

use sentencepiece::SentencePieceProcessor;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::errors::ServiceError;
use crate::translate::interface::{TokenBatch, Tokenizer};

const UNK_TOKEN: &str = "<unk>";
const PAD_TOKEN: &str = "<pad>";
const BOS_TOKEN: &str = "<s>";
const EOS_TOKEN: &str = "</s>";

pub struct IndicTokenizer {
    src_spm: SentencePieceProcessor,
    src_vocab: HashMap<String, u32>,
    tgt_vocab_rev: HashMap<u32, String>,
    unk_id: u32,
    pad_id: u32,
    bos_id: u32,
    eos_id: u32,
    /// Encoder position limit; encoded rows never exceed it.
    max_positions: usize,
}

impl IndicTokenizer {
    pub fn load(model_dir: &Path, max_positions: usize) -> Result<Self, ServiceError> {
        let src_spm = SentencePieceProcessor::open(model_dir.join("model.SRC"))
            .map_err(|e| ServiceError::startup(format!("source subword model: {e}")))?;

        let src_vocab = read_vocab(&model_dir.join("dict.SRC.json"))?;
        let tgt_vocab = read_vocab(&model_dir.join("dict.TGT.json"))?;
        let tgt_vocab_rev = tgt_vocab
            .into_iter()
            .map(|(token, id)| (id, token))
            .collect();

        let special = |token: &str| {
            src_vocab.get(token).copied().ok_or_else(|| {
                ServiceError::startup(format!("source vocabulary is missing {token}"))
            })
        };
        let unk_id = special(UNK_TOKEN)?;
        let pad_id = special(PAD_TOKEN)?;
        let bos_id = special(BOS_TOKEN)?;
        let eos_id = special(EOS_TOKEN)?;

        Ok(Self {
            src_spm,
            src_vocab,
            tgt_vocab_rev,
            unk_id,
            pad_id,
            bos_id,
            eos_id,
            max_positions,
        })
    }

    /// Encode one tagged sentence: the two leading language tags map
    /// straight through the vocabulary, the rest is subword-encoded,
    /// truncated to the position limit, and closed with EOS.
    fn encode_one(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        let mut parts = text.splitn(3, ' ');
        let src_tag = parts.next().unwrap_or("");
        let tgt_tag = parts.next().unwrap_or("");
        let body = parts.next().unwrap_or("");

        let pieces = self
            .src_spm
            .encode(body)
            .map_err(|e| ServiceError::model(format!("subword encoding: {e}")))?;
        Ok(assemble_row(
            self.lookup(src_tag),
            self.lookup(tgt_tag),
            pieces.iter().map(|piece| self.lookup(&piece.piece)),
            self.eos_id,
            self.max_positions,
        ))
    }

    fn lookup(&self, token: &str) -> u32 {
        self.src_vocab.get(token).copied().unwrap_or(self.unk_id)
    }
}

fn read_vocab(path: &Path) -> Result<HashMap<String, u32>, ServiceError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ServiceError::startup(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| ServiceError::startup(format!("{}: {e}", path.display())))
}

impl Tokenizer for IndicTokenizer {
    fn encode(&self, texts: &[String]) -> Result<TokenBatch, ServiceError> {
        let rows = texts
            .iter()
            .map(|text| self.encode_one(text))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pad_longest(rows, self.pad_id))
    }

    fn decode(&self, batch: &[Vec<u32>]) -> Result<Vec<String>, ServiceError> {
        let texts = batch
            .iter()
            .map(|row| {
                let pieces = row
                    .iter()
                    .filter(|&&id| id != self.pad_id && id != self.bos_id && id != self.eos_id)
                    .map(|id| {
                        self.tgt_vocab_rev
                            .get(id)
                            .map(String::as_str)
                            .unwrap_or(UNK_TOKEN)
                    });
                join_pieces(pieces)
            })
            .collect();
        Ok(texts)
    }
}

/// Assemble one encoder row: two language-tag ids, the subword ids
/// truncated so that tags + pieces + EOS never exceed the encoder
/// position limit, then EOS. Over-long input is silently cut, not
/// rejected.
pub(crate) fn assemble_row(
    src_tag: u32,
    tgt_tag: u32,
    piece_ids: impl IntoIterator<Item = u32>,
    eos_id: u32,
    max_positions: usize,
) -> Vec<u32> {
    let budget = max_positions.saturating_sub(3);
    let mut ids = vec![src_tag, tgt_tag];
    ids.extend(piece_ids.into_iter().take(budget));
    ids.push(eos_id);
    ids
}

/// Right-pad every row to the longest row in the batch. The width is
/// batch-local: it varies call to call with the longest sentence.
pub(crate) fn pad_longest(rows: Vec<Vec<u32>>, pad_id: u32) -> TokenBatch {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut input_ids = Vec::with_capacity(rows.len());
    let mut attention_mask = Vec::with_capacity(rows.len());
    for mut row in rows {
        let mut mask = vec![1u8; row.len()];
        row.resize(width, pad_id);
        mask.resize(width, 0);
        input_ids.push(row);
        attention_mask.push(mask);
    }
    TokenBatch {
        input_ids,
        attention_mask,
    }
}

/// Join subword pieces into text, mapping the SentencePiece word
/// boundary marker back to a space.
pub(crate) fn join_pieces<'a>(pieces: impl Iterator<Item = &'a str>) -> String {
    let joined: String = pieces.collect();
    joined.replace('\u{2581}', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_the_longest_row_with_mask() {
        let batch = pad_longest(vec![vec![5, 6], vec![7, 8, 9, 10], vec![11]], 1);
        assert_eq!(batch.width(), 4);
        assert_eq!(batch.input_ids[0], vec![5, 6, 1, 1]);
        assert_eq!(batch.input_ids[1], vec![7, 8, 9, 10]);
        assert_eq!(batch.input_ids[2], vec![11, 1, 1, 1]);
        assert_eq!(batch.attention_mask[0], vec![1, 1, 0, 0]);
        assert_eq!(batch.attention_mask[1], vec![1, 1, 1, 1]);
        assert_eq!(batch.attention_mask[2], vec![1, 0, 0, 0]);
    }

    #[test]
    fn padding_width_is_batch_local() {
        let short = pad_longest(vec![vec![5]], 1);
        let long = pad_longest(vec![vec![5], vec![6, 7, 8]], 1);
        assert_eq!(short.width(), 1);
        assert_eq!(long.width(), 3);
        // The shared row keeps its content regardless of batch width.
        assert_eq!(short.input_ids[0][0], long.input_ids[0][0]);
    }

    #[test]
    fn empty_batch_pads_to_nothing() {
        let batch = pad_longest(vec![], 1);
        assert!(batch.is_empty());
        assert_eq!(batch.width(), 0);
    }

    #[test]
    fn over_long_rows_truncate_to_the_position_limit() {
        let row = assemble_row(30, 31, (0..500).map(|i| 100 + i), 2, 256);
        assert_eq!(row.len(), 256);
        assert_eq!(row[0], 30);
        assert_eq!(row[1], 31);
        assert_eq!(row[2], 100);
        assert_eq!(row[254], 100 + 252);
        assert_eq!(*row.last().unwrap(), 2);
    }

    #[test]
    fn short_rows_keep_every_piece() {
        let row = assemble_row(30, 31, [7, 8, 9], 2, 256);
        assert_eq!(row, vec![30, 31, 7, 8, 9, 2]);
    }

    #[test]
    fn joins_pieces_on_the_word_boundary_marker() {
        let pieces = ["\u{2581}ਮੈਂ", "\u{2581}ਸਕੂਲ", "\u{2581}ਜਾ", "ਂਦਾ"];
        assert_eq!(join_pieces(pieces.iter().copied()), "ਮੈਂ ਸਕੂਲ ਜਾਂਦਾ");
    }

    #[test]
    fn joining_no_pieces_is_empty() {
        assert_eq!(join_pieces(std::iter::empty()), "");
    }
}
