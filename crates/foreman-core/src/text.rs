use std::collections::HashSet;

/// Words too common to carry matching signal.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "of", "on", "or", "the", "to", "with", "this", "that", "then",
];

/// Split text into lowercase alphanumeric words longer than one character.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() > 1)
        .collect()
}

/// Distinct significant words of `text`, stopwords removed.
pub fn word_set(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Fraction of the query's significant words that also appear in `text`.
///
/// Returns a value in `[0.0, 1.0]`; an empty query scores `0.0`.
pub fn overlap_score(query: &str, text: &str) -> f32 {
    let q = word_set(query);
    if q.is_empty() {
        return 0.0;
    }
    let t = word_set(text);
    let shared = q.intersection(&t).count();
    shared as f32 / q.len() as f32
}

/// Jaccard similarity of the significant word sets of two texts.
pub fn jaccard(a: &str, b: &str) -> f32 {
    let a = word_set(a);
    let b = word_set(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(&b).count();
    let union = a.union(&b).count();
    inter as f32 / union as f32
}

/// Lowercase `snake_case` slug built from at most `max_words` words.
///
/// Falls back to `"general"` when the text has no usable characters.
pub fn slugify(text: &str, max_words: usize) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .take(max_words)
        .collect();
    if words.is_empty() {
        "general".to_string()
    } else {
        words.join("_")
    }
}

/// Truncate to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}
