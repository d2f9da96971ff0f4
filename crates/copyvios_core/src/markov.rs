use std::collections::HashMap;

pub const DEFAULT_DEGREE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Token {
    Start,
    End,
    Word(String),
}

/// A window of `degree` consecutive tokens.
pub type NGram = Box<[Token]>;

/// N-gram frequency table used as a statistical fingerprint of a text.
///
/// Immutable after construction. `size` is always the sum of the counts in
/// `chain`, for chains built from text as well as for derived chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkovChain {
    text: String,
    degree: usize,
    chain: HashMap<NGram, usize>,
    size: usize,
}

impl MarkovChain {
    pub fn new(text: &str, degree: usize) -> Self {
        let degree = degree.max(1);
        let padding = degree - 1;

        let normalized = normalize_text(text);
        let mut tokens = Vec::with_capacity(padding * 2);
        tokens.extend(std::iter::repeat_n(Token::Start, padding));
        tokens.extend(
            normalized
                .split_whitespace()
                .map(|word| Token::Word(word.to_string())),
        );
        tokens.extend(std::iter::repeat_n(Token::End, padding));

        let mut chain: HashMap<NGram, usize> = HashMap::new();
        if tokens.len() >= degree {
            for window in tokens.windows(degree) {
                *chain.entry(window.to_vec().into_boxed_slice()).or_insert(0) += 1;
            }
        }

        Self::from_parts(text.to_string(), degree, chain)
    }

    pub fn with_default_degree(text: &str) -> Self {
        Self::new(text, DEFAULT_DEGREE)
    }

    /// A chain with no n-grams at all, used as a placeholder for unscored sources.
    pub fn empty(degree: usize) -> Self {
        Self::from_parts(String::new(), degree.max(1), HashMap::new())
    }

    fn from_parts(text: String, degree: usize, chain: HashMap<NGram, usize>) -> Self {
        let size = chain.values().sum();
        Self {
            text,
            degree,
            chain,
            size,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn chain(&self) -> &HashMap<NGram, usize> {
        &self.chain
    }

    /// Number of distinct n-grams.
    pub fn distinct(&self) -> usize {
        self.chain.len()
    }

    pub fn count(&self, ngram: &[Token]) -> usize {
        self.chain.get(ngram).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

/// Shared phrasing between two chains: every n-gram present in both, counted
/// `min(a, b)` times.
pub fn intersection(a: &MarkovChain, b: &MarkovChain) -> MarkovChain {
    let (small, large) = if a.chain.len() <= b.chain.len() {
        (a, b)
    } else {
        (b, a)
    };
    let mut chain = HashMap::new();
    for (ngram, count) in &small.chain {
        if let Some(other) = large.chain.get(ngram) {
            chain.insert(ngram.clone(), (*count).min(*other));
        }
    }
    MarkovChain::from_parts(String::new(), a.degree, chain)
}

/// Combined profile of several chains. Counts are summed, not deduplicated,
/// so phrasing repeated across partial mirrors accumulates.
pub fn union<'a, I>(chains: I) -> MarkovChain
where
    I: IntoIterator<Item = &'a MarkovChain>,
{
    let mut chain: HashMap<NGram, usize> = HashMap::new();
    let mut degree = None;
    for source in chains {
        degree.get_or_insert(source.degree);
        for (ngram, count) in &source.chain {
            *chain.entry(ngram.clone()).or_insert(0) += count;
        }
    }
    MarkovChain::from_parts(String::new(), degree.unwrap_or(DEFAULT_DEGREE), chain)
}

/// Lowercase and drop everything except word characters, whitespace and hyphens.
fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '-' || ch.is_whitespace())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(value: &str) -> Token {
        Token::Word(value.to_string())
    }

    #[test]
    fn size_matches_token_count_plus_padding() {
        let chain = MarkovChain::new("The quick brown fox jumps over the lazy dog", 5);
        assert_eq!(chain.size(), 9 + 5 - 1);
        assert_eq!(chain.size(), chain.chain().values().sum::<usize>());
    }

    #[test]
    fn windows_are_padded_with_sentinels() {
        let chain = MarkovChain::new("alpha beta", 3);
        assert_eq!(chain.count(&[Token::Start, Token::Start, word("alpha")]), 1);
        assert_eq!(chain.count(&[Token::Start, word("alpha"), word("beta")]), 1);
        assert_eq!(chain.count(&[word("alpha"), word("beta"), Token::End]), 1);
        assert_eq!(chain.count(&[word("beta"), Token::End, Token::End]), 1);
        assert_eq!(chain.size(), 4);
    }

    #[test]
    fn punctuation_and_case_are_normalized() {
        let a = MarkovChain::new("Hello, World! It's well-known.", 2);
        let b = MarkovChain::new("hello world its well-known", 2);
        assert_eq!(a.chain(), b.chain());
    }

    #[test]
    fn empty_text_does_not_panic() {
        let chain = MarkovChain::new("", 5);
        assert_eq!(chain.size(), 4);
        assert_eq!(chain.size(), chain.chain().values().sum::<usize>());

        let unigram = MarkovChain::new("   ", 1);
        assert_eq!(unigram.size(), 0);
        assert!(unigram.is_empty());
    }

    #[test]
    fn repeated_phrases_are_counted() {
        let chain = MarkovChain::new("la la la la", 1);
        assert_eq!(chain.count(&[word("la")]), 4);
        assert_eq!(chain.distinct(), 1);
    }

    #[test]
    fn self_intersection_preserves_size() {
        let chain = MarkovChain::new("one two three one two three one two", 3);
        let delta = intersection(&chain, &chain);
        assert_eq!(delta.size(), chain.size());
    }

    #[test]
    fn intersection_is_bounded_by_smaller_input() {
        let a = MarkovChain::new("a b c d e f g h i j k l m n o p", 3);
        let b = MarkovChain::new("x y c d e f z", 3);
        let delta = intersection(&a, &b);
        assert!(delta.size() <= a.size().min(b.size()));
        assert_eq!(delta.size(), 2);
        assert_eq!(delta.size(), delta.chain().values().sum::<usize>());
    }

    #[test]
    fn disjoint_texts_share_nothing() {
        let a = MarkovChain::new("completely different words here", 5);
        let b = MarkovChain::new("nothing in common at all", 5);
        assert_eq!(intersection(&a, &b).size(), 0);
    }

    #[test]
    fn union_sums_counts_across_chains() {
        let a = MarkovChain::new("red green", 1);
        let b = MarkovChain::new("green blue", 1);
        let combined = union([&a, &b]);
        assert_eq!(combined.count(&[word("green")]), 2);
        assert_eq!(combined.count(&[word("red")]), 1);
        assert_eq!(combined.size(), a.size() + b.size());
    }

    #[test]
    fn union_of_nothing_is_empty() {
        let combined = union(std::iter::empty::<&MarkovChain>());
        assert_eq!(combined.size(), 0);
        assert_eq!(combined.degree(), DEFAULT_DEGREE);
    }
}
