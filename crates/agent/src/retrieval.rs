use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

const CHUNK_TARGET_CHARS: usize = 800;
const STEM_PREFIX: usize = 5;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "your", "can", "with", "this", "that",
    "have", "has", "was", "were", "will", "what", "when", "how", "who", "which", "there", "from",
    "about", "into", "does", "did", "our", "all", "any", "may", "its", "they", "them", "then",
    "than", "would", "could", "should", "please", "want", "like", "just",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Passage {
    pub text: String,
    pub relevance_score: f32,
    pub source: String,
}

/// Looks up policy text relevant to a query. Passages come back most relevant first.
#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>>;
}

/// Keyword-overlap retrieval over a single policy document held in memory.
pub struct PolicyDocumentRetriever {
    source: String,
    chunks: Vec<Chunk>,
    max_passages: usize,
}

struct Chunk {
    text: String,
    terms: BTreeSet<String>,
}

impl PolicyDocumentRetriever {
    pub fn load(path: &Path, max_passages: usize) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read policy document `{}`", path.display()))?;
        Self::from_text(path.display().to_string(), &raw, max_passages)
    }

    pub fn from_text(source: impl Into<String>, raw: &str, max_passages: usize) -> Result<Self> {
        let chunks: Vec<Chunk> = chunk_document(raw)
            .into_iter()
            .map(|text| {
                let terms = terms_of(&text);
                Chunk { text, terms }
            })
            .collect();

        if chunks.is_empty() {
            bail!("policy document has no text");
        }

        Ok(Self { source: source.into(), chunks, max_passages: max_passages.max(1) })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn passage_count(&self) -> usize {
        self.chunks.len()
    }

    fn passage(&self, chunk: &Chunk, relevance_score: f32) -> Passage {
        Passage { text: chunk.text.clone(), relevance_score, source: self.source.clone() }
    }
}

#[async_trait]
impl DocumentRetriever for PolicyDocumentRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>> {
        let query_terms = terms_of(query);

        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(index, chunk)| {
                let matched = query_terms.iter().filter(|term| chunk.terms.contains(*term)).count();
                (matched > 0).then(|| (index, matched as f32 / query_terms.len() as f32))
            })
            .collect();

        if scored.is_empty() {
            // no overlap: hand back the opening of the document, unscored
            return Ok(self
                .chunks
                .iter()
                .take(self.max_passages)
                .map(|chunk| self.passage(chunk, 0.0))
                .collect());
        }

        scored.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
        Ok(scored
            .into_iter()
            .take(self.max_passages)
            .map(|(index, score)| self.passage(&self.chunks[index], score))
            .collect())
    }
}

/// Splits on blank lines, then packs consecutive paragraphs up to the target size.
/// A heading always opens a new chunk.
fn chunk_document(raw: &str) -> Vec<String> {
    let paragraphs = raw
        .replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in paragraphs {
        let heading = paragraph.starts_with('#');
        if !current.is_empty()
            && (heading || current.len() + paragraph.len() + 2 > CHUNK_TARGET_CHARS)
        {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn terms_of(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|word| word.chars().count() >= 3 && !STOPWORDS.contains(&word.as_str()))
        .map(|word| word.chars().take(STEM_PREFIX).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{DocumentRetriever, PolicyDocumentRetriever};

    const POLICY: &str = "# Returns\n\nYou may return any item within 30 days of delivery.\n\n\
        # Refunds\n\nRefunds are issued to the original payment method within 10 business days.\n\n\
        # Shipping\n\nStandard shipping takes 5 to 8 business days.";

    #[tokio::test]
    async fn most_relevant_passage_comes_first() {
        let retriever = PolicyDocumentRetriever::from_text("policy", POLICY, 2).expect("load");
        let passages = retriever.retrieve("how do refunds work?").await.expect("retrieve");

        assert!(!passages.is_empty());
        assert!(passages[0].text.contains("Refunds are issued"));
        assert!(passages.len() <= 2);
        assert!(passages.windows(2).all(|pair| pair[0].relevance_score >= pair[1].relevance_score));
    }

    #[tokio::test]
    async fn inflections_share_a_stem() {
        let retriever = PolicyDocumentRetriever::from_text("policy", POLICY, 1).expect("load");
        let passages = retriever.retrieve("returning a product").await.expect("retrieve");
        assert!(passages[0].text.contains("return any item"));
    }

    #[tokio::test]
    async fn unmatched_query_falls_back_to_document_opening() {
        let retriever = PolicyDocumentRetriever::from_text("policy", POLICY, 1).expect("load");
        let passages = retriever.retrieve("zzz qqq").await.expect("retrieve");

        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].relevance_score, 0.0);
        assert!(passages[0].text.starts_with("# Returns"));
    }

    #[test]
    fn headings_start_new_chunks() {
        let retriever = PolicyDocumentRetriever::from_text("policy", POLICY, 3).expect("load");
        assert_eq!(retriever.passage_count(), 3);
    }

    #[test]
    fn empty_or_missing_document_is_an_error() {
        assert!(PolicyDocumentRetriever::from_text("policy", "  \n\n ", 3).is_err());

        let dir = TempDir::new().expect("temp dir");
        assert!(PolicyDocumentRetriever::load(&dir.path().join("missing.md"), 3).is_err());

        let path = dir.path().join("policy.md");
        fs::write(&path, POLICY).expect("write");
        let retriever = PolicyDocumentRetriever::load(&path, 3).expect("load");
        assert!(retriever.source().ends_with("policy.md"));
    }
}
