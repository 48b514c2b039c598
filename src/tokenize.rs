//! Phoneme tokeniser for the Kokoro v1.0 graph.
//!
//! Maps each IPA symbol to its id in the model's fixed vocabulary.  Symbols
//! outside the vocabulary are dropped.  Id 0 is the pad token the model
//! expects at both ends of every sequence.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Longest phoneme sequence (excluding pads) the graph accepts; also the
/// number of rows in each voice style matrix.
pub const MAX_PHONEME_LENGTH: usize = 510;

/// Pad token id.
pub const PAD_ID: i64 = 0;

/// Kokoro v1.0 vocabulary.  Gaps in the id range are unused.
const VOCAB_TABLE: &[(char, i64)] = &[
    (';', 1), (':', 2), (',', 3), ('.', 4), ('!', 5), ('?', 6), ('—', 9), ('…', 10),
    ('"', 11), ('(', 12), (')', 13), ('\u{201C}', 14), ('\u{201D}', 15), (' ', 16),
    ('\u{0303}', 17), ('ʣ', 18), ('ʥ', 19), ('ʦ', 20), ('ʨ', 21), ('ᵝ', 22), ('\u{AB67}', 23),
    ('A', 24), ('I', 25), ('O', 31), ('Q', 33), ('S', 35), ('T', 36), ('W', 39), ('Y', 41),
    ('ᵊ', 42), ('a', 43), ('b', 44), ('c', 45), ('d', 46), ('e', 47), ('f', 48), ('h', 50),
    ('i', 51), ('j', 52), ('k', 53), ('l', 54), ('m', 55), ('n', 56), ('o', 57), ('p', 58),
    ('q', 59), ('r', 60), ('s', 61), ('t', 62), ('u', 63), ('v', 64), ('w', 65), ('x', 66),
    ('y', 67), ('z', 68), ('ɑ', 69), ('ɐ', 70), ('ɒ', 71), ('æ', 72), ('β', 75), ('ɔ', 76),
    ('ɕ', 77), ('ç', 78), ('ɖ', 80), ('ð', 81), ('ʤ', 82), ('ə', 83), ('ɚ', 85), ('ɛ', 86),
    ('ɜ', 87), ('ɟ', 90), ('ɡ', 92), ('ɥ', 99), ('ɨ', 101), ('ɪ', 102), ('ʝ', 103),
    ('ɯ', 110), ('ɰ', 111), ('ŋ', 112), ('ɳ', 113), ('ɲ', 114), ('ɴ', 115), ('ø', 116),
    ('ɸ', 118), ('θ', 119), ('œ', 120), ('ɹ', 123), ('ɾ', 125), ('ɻ', 126), ('ʁ', 128),
    ('ɽ', 129), ('ʂ', 130), ('ʃ', 131), ('ʈ', 132), ('ʧ', 133), ('ʊ', 135), ('ʋ', 136),
    ('ʌ', 138), ('ɣ', 139), ('ɤ', 140), ('χ', 142), ('ʎ', 143), ('ʒ', 147), ('ʔ', 148),
    ('ˈ', 156), ('ˌ', 157), ('ː', 158), ('ʰ', 162), ('ʲ', 164), ('↓', 169), ('→', 171),
    ('↗', 172), ('↘', 173), ('ᵻ', 177),
];

static VOCAB: Lazy<HashMap<char, i64>> = Lazy::new(|| VOCAB_TABLE.iter().copied().collect());

/// Phoneme runs ending in clause punctuation (or at end of input).
static RE_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^.,!?;:]*[.,!?;:]*").unwrap());

pub fn char_to_id(c: char) -> Option<i64> {
    VOCAB.get(&c).copied()
}

/// Vocabulary ids for `phonemes`, unknown symbols dropped, no pads.
pub fn phonemes_to_ids(phonemes: &str) -> Vec<i64> {
    phonemes.chars().filter_map(char_to_id).collect()
}

/// Wrap `ids` with the pad token on both ends.
pub fn pad(ids: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(ids.len() + 2);
    out.push(PAD_ID);
    out.extend_from_slice(ids);
    out.push(PAD_ID);
    out
}

fn token_len(s: &str) -> usize {
    s.chars().filter(|c| VOCAB.contains_key(c)).count()
}

/// Split a phoneme string into batches of at most `max_len` tokens.
///
/// Batches break after clause punctuation where possible; a single clause
/// longer than `max_len` is cut at a word boundary, and a single word longer
/// than `max_len` is hard-cut.
pub fn split_phonemes(phonemes: &str, max_len: usize) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, batches: &mut Vec<String>| {
        let trimmed = current.trim();
        if token_len(trimmed) > 0 {
            batches.push(trimmed.to_string());
        }
        current.clear();
    };

    for clause in RE_CLAUSE.find_iter(phonemes).map(|m| m.as_str()) {
        if clause.is_empty() {
            continue;
        }
        if token_len(&current) + token_len(clause) <= max_len {
            current.push_str(clause);
            continue;
        }
        flush(&mut current, &mut batches);

        if token_len(clause) <= max_len {
            current.push_str(clause);
            continue;
        }

        // Oversized clause: fall back to words.
        for word in clause.split_inclusive(' ') {
            if token_len(&current) + token_len(word) > max_len {
                flush(&mut current, &mut batches);
            }
            if token_len(word) > max_len {
                for c in word.chars() {
                    if token_len(&current) + 1 > max_len {
                        flush(&mut current, &mut batches);
                    }
                    current.push(c);
                }
            } else {
                current.push_str(word);
            }
        }
    }
    flush(&mut current, &mut batches);
    batches
}
