use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::markov::{MarkovChain, intersection, union};
use crate::workspace::calculate_confidence;

/// Immutable snapshot of one candidate source at the end of a check.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub url: String,
    pub domain: String,
    pub confidence: f64,
    pub skipped: bool,
    pub excluded: bool,
    pub source_size: usize,
    pub delta_size: usize,
    /// `(source, delta)` chains, present only for sources that were compared.
    #[serde(skip)]
    pub chains: Option<(Arc<MarkovChain>, Arc<MarkovChain>)>,
}

impl SourceSummary {
    pub fn source_chain(&self) -> Option<&MarkovChain> {
        self.chains.as_ref().map(|(source, _)| source.as_ref())
    }

    pub fn delta_chain(&self) -> Option<&MarkovChain> {
        self.chains.as_ref().map(|(_, delta)| delta.as_ref())
    }
}

/// Best first: confidence descending, excluded last, skipped last, larger sources first.
pub fn compare_sources(a: &SourceSummary, b: &SourceSummary) -> Ordering {
    // Adding 0.0 folds -0.0 into 0.0 before the total order sees it.
    (b.confidence + 0.0)
        .total_cmp(&(a.confidence + 0.0))
        .then(a.excluded.cmp(&b.excluded))
        .then(a.skipped.cmp(&b.skipped))
        .then(b.source_size.cmp(&a.source_size))
}

#[derive(Debug, Clone, Serialize)]
pub struct CopyvioCheckResult {
    pub violation: bool,
    pub sources: Vec<SourceSummary>,
    pub queries: usize,
    /// Wall-clock duration of the check in seconds.
    pub check_time: f64,
    #[serde(skip)]
    pub article_chain: Arc<MarkovChain>,
    pub article_size: usize,
    pub possible_miss: bool,
    pub included_sources: Vec<String>,
    pub unified_confidence: Option<f64>,
}

/// Thresholds applied when a result is assembled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultThresholds {
    pub min_confidence: f64,
    pub include_min_confidence: f64,
}

impl CopyvioCheckResult {
    pub fn new(
        mut sources: Vec<SourceSummary>,
        queries: usize,
        elapsed: Duration,
        article_chain: Arc<MarkovChain>,
        possible_miss: bool,
        thresholds: ResultThresholds,
    ) -> Self {
        sources.sort_by(compare_sources);

        let included = sources
            .iter()
            .filter(|source| {
                !source.excluded
                    && source.chains.is_some()
                    && source.confidence >= thresholds.include_min_confidence
            })
            .collect::<Vec<_>>();
        let unified_confidence = (included.len() >= 2).then(|| {
            let combined = union(included.iter().filter_map(|source| source.source_chain()));
            let delta = intersection(&article_chain, &combined);
            calculate_confidence(article_chain.size(), delta.size())
        });
        let included_sources = included
            .iter()
            .map(|source| source.url.clone())
            .collect::<Vec<_>>();

        let best = sources.first().map_or(0.0, |source| source.confidence);
        let confidence = best.max(unified_confidence.unwrap_or(0.0));
        Self {
            violation: confidence >= thresholds.min_confidence,
            article_size: article_chain.size(),
            sources,
            queries,
            check_time: elapsed.as_secs_f64(),
            article_chain,
            possible_miss,
            included_sources,
            unified_confidence,
        }
    }

    /// Result for a check that did no work at all.
    pub fn empty(article_chain: Arc<MarkovChain>, queries: usize, elapsed: Duration) -> Self {
        Self {
            violation: false,
            sources: Vec::new(),
            queries,
            check_time: elapsed.as_secs_f64(),
            article_size: article_chain.size(),
            article_chain,
            possible_miss: false,
            included_sources: Vec::new(),
            unified_confidence: None,
        }
    }

    pub fn best(&self) -> Option<&SourceSummary> {
        self.sources.first()
    }

    /// Highest of the best single-source confidence and the unified confidence.
    pub fn confidence(&self) -> f64 {
        let best = self.best().map_or(0.0, |source| source.confidence);
        best.max(self.unified_confidence.unwrap_or(0.0))
    }

    pub fn url(&self) -> Option<&str> {
        self.best().map(|source| source.url.as_str())
    }

    /// Sources that were actually fetched and compared.
    pub fn sources_processed(&self) -> usize {
        self.sources.iter().filter(|source| !source.skipped).count()
    }

    pub fn log_message(&self, title: &str) -> String {
        format!(
            "{title} -> {} ({:.2}, {}, {} queries, {:.3}s)",
            if self.violation { "True" } else { "False" },
            self.confidence(),
            self.url().unwrap_or("None"),
            self.queries,
            self.check_time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: ResultThresholds = ResultThresholds {
        min_confidence: 0.75,
        include_min_confidence: 0.15,
    };

    fn summary(url: &str, confidence: f64, skipped: bool, excluded: bool, size: usize) -> SourceSummary {
        SourceSummary {
            url: url.to_string(),
            domain: "example.com".to_string(),
            confidence,
            skipped,
            excluded,
            source_size: size,
            delta_size: 0,
            chains: None,
        }
    }

    fn compared(url: &str, article: &MarkovChain, text: &str) -> SourceSummary {
        let source = MarkovChain::new(text, article.degree());
        let delta = intersection(article, &source);
        SourceSummary {
            url: url.to_string(),
            domain: "example.com".to_string(),
            confidence: calculate_confidence(article.size(), delta.size()),
            skipped: false,
            excluded: false,
            source_size: source.size(),
            delta_size: delta.size(),
            chains: Some((Arc::new(source), Arc::new(delta))),
        }
    }

    #[test]
    fn sources_sort_into_a_total_order() {
        let mut sources = vec![
            summary("d", 0.0, true, false, 50),
            summary("b", 0.5, false, false, 10),
            summary("e", 0.0, true, true, 90),
            summary("a", 0.9, false, false, 10),
            summary("c", 0.0, false, false, 20),
            summary("f", 0.0, false, false, 80),
        ];
        sources.sort_by(compare_sources);
        let order = sources
            .iter()
            .map(|source| source.url.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["a", "b", "f", "c", "d", "e"]);
    }

    #[test]
    fn negative_zero_does_not_outrank_skipped_sources() {
        let mut sources = vec![
            summary("skipped", 0.0, true, false, 10),
            summary("compared", -0.0, false, false, 10),
        ];
        sources.sort_by(compare_sources);
        assert_eq!(sources[0].url, "compared");
    }

    #[test]
    fn empty_result_reports_no_violation() {
        let article = Arc::new(MarkovChain::with_default_degree("short"));
        let result = CopyvioCheckResult::empty(article, 0, Duration::from_millis(1500));
        assert!(!result.violation);
        assert_eq!(result.confidence(), 0.0);
        assert!(result.best().is_none());
        assert_eq!(result.sources_processed(), 0);
        assert_eq!(result.log_message("Foo"), "Foo -> False (0.00, None, 0 queries, 1.500s)");
    }

    #[test]
    fn verbatim_source_is_a_violation() {
        let text = "the quick brown fox jumps over the lazy dog near the quiet river bank today";
        let article = Arc::new(MarkovChain::with_default_degree(text));
        let sources = vec![
            compared("https://b.example/unrelated", &article, "completely different words here"),
            compared("https://a.example/copy", &article, text),
        ];
        let result = CopyvioCheckResult::new(
            sources,
            3,
            Duration::from_secs(2),
            article,
            false,
            THRESHOLDS,
        );
        assert!(result.violation);
        assert_eq!(result.url(), Some("https://a.example/copy"));
        assert!(result.confidence() >= 0.75);
        assert_eq!(result.sources[1].confidence, 0.0);
        assert!(result.unified_confidence.is_none());
        assert!(result.log_message("Foo").starts_with("Foo -> True ("));
    }

    #[test]
    fn fragments_combine_into_unified_confidence() {
        let first = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let second = "nu xi omicron pi rho sigma tau upsilon phi chi psi omega";
        let article = Arc::new(MarkovChain::with_default_degree(&format!("{first} {second}")));
        let sources = vec![
            compared("https://one.example/", &article, first),
            compared("https://two.example/", &article, second),
        ];
        let single_best = sources
            .iter()
            .map(|source| source.confidence)
            .fold(0.0, f64::max);
        let result = CopyvioCheckResult::new(
            sources,
            0,
            Duration::ZERO,
            article,
            false,
            THRESHOLDS,
        );
        assert_eq!(result.included_sources.len(), 2);
        let unified = result.unified_confidence.expect("unified confidence");
        assert!(unified > single_best);
        assert_eq!(result.confidence(), unified);
    }
}
