/// Which external entry point a request targets (supplemented from the
/// original's `model_task`-to-backend-call mapping; spec.md names the three
/// operations but never ties them to one enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `generate` — text/chat completion.
    Generate,
    /// `generate_embeddings` — embedding vectors.
    Embeddings,
    /// `rerank` — relevance scoring of documents against a query.
    Rerank,
}

impl RequestKind {
    /// A short label for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Embeddings => "embeddings",
            Self::Rerank => "rerank",
        }
    }
}
