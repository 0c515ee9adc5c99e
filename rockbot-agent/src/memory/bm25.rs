//! BM25 ranking for long-term recall.
//!
//! Documents are indexed over `content + tags + category tokens`. Scoring
//! uses the standard Okapi parameters (k1 = 1.2, b = 0.75). The index is
//! small and fully in memory; stores guard it with their own lock.

use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

#[derive(Default)]
struct DocEntry {
    term_freqs: HashMap<String, usize>,
    length: usize,
}

/// An incremental BM25 index keyed by document id.
#[derive(Default)]
pub struct Bm25Index {
    docs: HashMap<String, DocEntry>,
    doc_freqs: HashMap<String, usize>,
    total_length: usize,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index (or re-index) a document.
    pub fn insert(&mut self, id: &str, text: &str) {
        self.remove(id);

        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        let mut length = 0;
        for term in tokenize(text) {
            *term_freqs.entry(term).or_insert(0) += 1;
            length += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += length;
        self.docs.insert(id.to_string(), DocEntry { term_freqs, length });
    }

    pub fn remove(&mut self, id: &str) {
        if let Some(entry) = self.docs.remove(id) {
            self.total_length -= entry.length;
            for term in entry.term_freqs.keys() {
                if let Some(df) = self.doc_freqs.get_mut(term) {
                    *df -= 1;
                    if *df == 0 {
                        self.doc_freqs.remove(term);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Ranked search: positive-scoring documents, best first.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<(String, f64)> {
        if self.docs.is_empty() {
            return Vec::new();
        }
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let doc_count = self.docs.len() as f64;
        let avg_length = self.total_length as f64 / doc_count;

        let mut scored: Vec<(String, f64)> = self
            .docs
            .iter()
            .filter_map(|(id, doc)| {
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = *doc.term_freqs.get(term).unwrap_or(&0) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = *self.doc_freqs.get(term).unwrap_or(&0) as f64;
                    let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let norm = K1 * (1.0 - B + B * doc.length as f64 / avg_length.max(1.0));
                    score += idf * (tf * (K1 + 1.0)) / (tf + norm);
                }
                (score > 0.0).then(|| (id.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored
    }
}

/// Lowercased alphanumeric terms; everything else is a separator.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Bm25Index {
        let mut index = Bm25Index::new();
        index.insert("a", "the quarterly meeting is on tuesday at noon");
        index.insert("b", "grocery list: eggs milk bread");
        index.insert("c", "meeting notes from the architecture review meeting");
        index
    }

    #[test]
    fn test_search_ranks_by_relevance() {
        let index = sample_index();
        let results = index.search("meeting", 10);
        assert_eq!(results.len(), 2);
        // "c" mentions meeting twice and is shorter per-term, it wins.
        assert_eq!(results[0].0, "c");
        assert_eq!(results[1].0, "a");
    }

    #[test]
    fn test_no_hit_returns_empty() {
        let index = sample_index();
        assert!(index.search("sailboat", 10).is_empty());
        assert!(index.search("", 10).is_empty());
        assert!(index.search("!!!", 10).is_empty());
    }

    #[test]
    fn test_max_results_truncates() {
        let index = sample_index();
        let results = index.search("meeting the", 1);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_remove_unindexes() {
        let mut index = sample_index();
        index.remove("c");
        let results = index.search("meeting", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn test_reinsert_replaces() {
        let mut index = sample_index();
        index.insert("a", "completely different topic now");
        let results = index.search("tuesday", 10);
        assert!(results.is_empty());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_tokenize_splits_on_non_alphanumeric() {
        assert_eq!(
            tokenize("Hello, world! x2"),
            vec!["hello", "world", "x2"]
        );
    }
}
