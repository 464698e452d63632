//! CLIP BPE tokenizer
//!
//! Reads OpenAI's `bpe_simple_vocab_16e6.txt` merges file. Token ids follow
//! CLIP's vocabulary order: the 256 byte symbols, the same symbols with an
//! end-of-word marker, one entry per merge in rank order, then the two
//! special tokens.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid vocabulary file: expected {expected} merges, found {found}")]
    InvalidVocab { expected: usize, found: usize },

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Prompt is {tokens} tokens long, the context holds {max}")]
    TooLong { tokens: usize, max: usize },
}

/// Id of `<|startoftext|>`
pub const START_OF_TEXT: u32 = 49406;
/// Id of `<|endoftext|>`, the highest id in the vocabulary
pub const END_OF_TEXT: u32 = 49407;

/// Merges used by the released CLIP models
pub const NUM_MERGES: usize = 49152 - 256 - 2;

/// Byte-level BPE tokenizer for CLIP
///
/// Words are matched by the CLIP pattern on lowercased text, mapped through
/// the byte-to-unicode table, then merged by rank.
pub struct ClipTokenizer {
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
    encoder: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    cache: RefCell<HashMap<String, String>>,
    pat: Regex,
}

impl std::fmt::Debug for ClipTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipTokenizer")
            .field("vocab_size", &self.encoder.len())
            .field("merges", &self.bpe_ranks.len())
            .finish()
    }
}

impl ClipTokenizer {
    /// Loads the merges file at `path`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TokenizerError> {
        let content = fs::read_to_string(path)?;
        Self::from_merges(&content, NUM_MERGES)
    }

    /// Builds a tokenizer from the first `num_merges` merges in `content`
    ///
    /// A leading `#version` line is skipped.
    pub fn from_merges(content: &str, num_merges: usize) -> Result<Self, TokenizerError> {
        let byte_table = bytes_to_unicode();
        let byte_encoder: HashMap<u8, char> = byte_table.iter().copied().collect();
        let byte_decoder: HashMap<char, u8> = byte_table.iter().map(|&(b, c)| (c, b)).collect();

        let merges: Vec<(String, String)> = content
            .lines()
            .filter(|line| !line.starts_with("#version"))
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) => Some((a.to_string(), b.to_string())),
                    _ => None,
                }
            })
            .take(num_merges)
            .collect();

        if merges.len() < num_merges {
            return Err(TokenizerError::InvalidVocab {
                expected: num_merges,
                found: merges.len(),
            });
        }

        let mut vocab: Vec<String> = byte_table.iter().map(|(_, c)| c.to_string()).collect();
        vocab.extend(byte_table.iter().map(|(_, c)| format!("{c}</w>")));
        vocab.extend(merges.iter().map(|(a, b)| format!("{a}{b}")));

        let mut encoder: HashMap<String, u32> = vocab
            .into_iter()
            .enumerate()
            .map(|(i, token)| (token, i as u32))
            .collect();
        let specials = encoder.len() as u32;
        encoder.insert("<|startoftext|>".to_string(), specials);
        encoder.insert("<|endoftext|>".to_string(), specials + 1);

        let decoder = encoder.iter().map(|(k, &v)| (v, k.clone())).collect();
        let bpe_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();

        let pat = Regex::new(
            r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+",
        )?;

        Ok(Self {
            byte_encoder,
            byte_decoder,
            encoder,
            decoder,
            bpe_ranks,
            cache: RefCell::new(HashMap::new()),
            pat,
        })
    }

    /// Token id of the start marker
    pub fn start_of_text(&self) -> u32 {
        self.encoder["<|startoftext|>"]
    }

    /// Token id of the end marker
    pub fn end_of_text(&self) -> u32 {
        self.encoder["<|endoftext|>"]
    }

    /// Encodes text without start/end markers
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

        let mut tokens = Vec::new();
        for mat in self.pat.find_iter(&text) {
            let symbols: String = mat
                .as_str()
                .bytes()
                .map(|b| self.byte_encoder[&b])
                .collect();
            for piece in self.bpe(&symbols).split(' ') {
                if let Some(&id) = self.encoder.get(piece) {
                    tokens.push(id);
                }
            }
        }
        tokens
    }

    /// Encodes text with start/end markers, zero-padded to `context_length`
    pub fn encode_padded(&self, text: &str, context_length: usize) -> Result<Vec<u32>, TokenizerError> {
        let mut tokens = vec![self.start_of_text()];
        tokens.extend(self.encode(text));
        tokens.push(self.end_of_text());

        if tokens.len() > context_length {
            return Err(TokenizerError::TooLong {
                tokens: tokens.len(),
                max: context_length,
            });
        }
        tokens.resize(context_length, 0);
        Ok(tokens)
    }

    /// Turns ids back into text, skipping ids outside the vocabulary
    pub fn decode(&self, tokens: &[u32]) -> String {
        let text: String = tokens
            .iter()
            .filter_map(|id| self.decoder.get(id))
            .map(String::as_str)
            .collect();
        let bytes: Vec<u8> = text
            .replace("</w>", " ")
            .chars()
            .filter_map(|c| if c == ' ' { Some(b' ') } else { self.byte_decoder.get(&c).copied() })
            .collect();
        String::from_utf8_lossy(&bytes).trim().to_string()
    }

    /// Number of entries in the vocabulary
    pub fn vocab_size(&self) -> usize {
        self.encoder.len()
    }

    fn bpe(&self, token: &str) -> String {
        if let Some(cached) = self.cache.borrow().get(token) {
            return cached.clone();
        }

        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        if let Some(last) = word.last_mut() {
            last.push_str("</w>");
        }

        while word.len() > 1 {
            let best = word
                .windows(2)
                .filter_map(|w| {
                    self.bpe_ranks
                        .get(&(w[0].clone(), w[1].clone()))
                        .map(|&rank| (rank, (w[0].clone(), w[1].clone())))
                })
                .min_by_key(|(rank, _)| *rank);

            let Some((_, (first, second))) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        let result = word.join(" ");
        self.cache.borrow_mut().insert(token.to_string(), result.clone());
        result
    }
}

/// CLIP's reversible byte-to-symbol table, in vocabulary order
///
/// Printable bytes map to themselves; the rest map past U+0100.
fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut bytes: Vec<u8> = Vec::with_capacity(256);
    bytes.extend(b'!'..=b'~');
    bytes.extend(0xA1u8..=0xAC);
    bytes.extend(0xAEu8..=0xFF);

    let mut table: Vec<(u8, char)> = bytes.iter().map(|&b| (b, char::from(b))).collect();

    let mut n = 0u32;
    for b in 0u8..=255 {
        if !bytes.contains(&b) {
            let symbol = char::from_u32(256 + n).unwrap_or(char::REPLACEMENT_CHARACTER);
            table.push((b, symbol));
            n += 1;
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny merges file: enough to form "cat" and "dog" as whole words
    const MERGES: &str = "#version: 0.2\nc a\nca t</w>\nd o\ndo g</w>\n";

    fn tokenizer() -> ClipTokenizer {
        ClipTokenizer::from_merges(MERGES, 4).unwrap()
    }

    #[test]
    fn test_byte_table() {
        let table = bytes_to_unicode();
        assert_eq!(table.len(), 256);
        assert_eq!(table[0], (b'!', '!'));
        let map: HashMap<u8, char> = table.into_iter().collect();
        assert_eq!(map.len(), 256);
        assert_eq!(map[&b'a'], 'a');
        assert_eq!(map[&b' '], '\u{120}');
    }

    #[test]
    fn test_vocabulary_order() {
        let tok = tokenizer();
        // 512 byte symbols + 4 merges + 2 specials
        assert_eq!(tok.vocab_size(), 518);
        assert_eq!(tok.start_of_text(), 516);
        assert_eq!(tok.end_of_text(), 517);
        assert_eq!(tok.encoder["!"], 0);
        assert_eq!(tok.encoder["!</w>"], 256);
        assert_eq!(tok.encoder["ca"], 512);
        assert_eq!(tok.encoder["cat</w>"], 513);
        assert_eq!(tok.encoder["dog</w>"], 515);
    }

    #[test]
    fn test_encode_merges_words() {
        let tok = tokenizer();
        assert_eq!(tok.encode("Cat   DOG"), vec![513, 515]);
        // no merge applies to "cab"
        let ids = tok.encode("cab");
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], 512);
        assert_eq!(ids[1], tok.encoder["b</w>"]);
    }

    #[test]
    fn test_decode() {
        let tok = tokenizer();
        let ids = tok.encode("cat dog");
        assert_eq!(tok.decode(&ids), "cat dog");
    }

    #[test]
    fn test_encode_padded() {
        let tok = tokenizer();
        let ids = tok.encode_padded("cat", 5).unwrap();
        assert_eq!(ids, vec![516, 513, 517, 0, 0]);

        let err = tok.encode_padded("cat dog cat", 4).unwrap_err();
        assert!(matches!(err, TokenizerError::TooLong { tokens: 5, max: 4 }));
    }

    #[test]
    fn test_short_merges_file_rejected() {
        let err = ClipTokenizer::from_merges(MERGES, 10).unwrap_err();
        assert!(matches!(
            err,
            TokenizerError::InvalidVocab {
                expected: 10,
                found: 4
            }
        ));
    }

    #[test]
    fn test_released_special_token_ids() {
        assert_eq!(START_OF_TEXT, 49406);
        assert_eq!(END_OF_TEXT, 49407);
        assert_eq!(256 + 256 + NUM_MERGES, START_OF_TEXT as usize);
    }
}
