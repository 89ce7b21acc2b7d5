// Candidate-term extraction for the keyword branch of Stage A (spec.md §4.6):
// tokenise, lowercase, drop stopwords, keep length >= 2.

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "of", "in", "on", "at", "to", "for", "with",
    "is", "are", "was", "were", "be", "been", "being", "this", "that", "these", "those", "it",
    "its", "as", "by", "from", "how", "what", "when", "where", "which", "who", "why", "do",
    "does", "did", "can", "could", "should", "would", "will", "shall", "i", "you", "he", "she",
    "we", "they", "them", "his", "her", "their", "my", "your", "our",
];

pub fn candidate_terms(query_text: &str) -> BTreeSet<String> {
    query_text
        .split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_stopwords_and_short_tokens() {
        let terms = candidate_terms("What is a B-tree and how does it work?");
        assert!(terms.contains("btree") == false); // hyphen splits the token
        assert!(terms.contains("tree"));
        assert!(terms.contains("work"));
        assert!(!terms.contains("is"));
        assert!(!terms.contains("a"));
    }
}
