use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::RetrievalBackend;
use crate::config::RuntimeConfig;
use crate::error::WorkflowError;
use crate::state::{Citation, Operation, TraceEntry, WorkflowState};

pub const RETRIEVAL_TOP_K: usize = 3;
pub const RETRIEVE_ACTION: &str = "RAG.retrieve";
pub const CONTEXT_SEARCH_CAPABILITY: &str = "context-search";

/// Page separator used by `pdftotext` output.
const PAGE_BREAK: char = '\x0c';

#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub text: String,
    pub source: String,
    pub page: u32,
}

pub trait ContextSearch: Send + Sync {
    fn backend_name(&self) -> &'static str;
    fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>>;
}

pub fn load_corpus_passages(path: &str) -> Result<Vec<Passage>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus document at '{path}'"))?;
    let source = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let passages = content
        .split(PAGE_BREAK)
        .enumerate()
        .flat_map(|(page_index, page)| {
            let source = source.clone();
            page.split("\n\n")
                .map(str::trim)
                .filter(|paragraph| !paragraph.is_empty())
                .map(move |paragraph| Passage {
                    text: paragraph.to_string(),
                    source: source.clone(),
                    page: page_index as u32 + 1,
                })
                .collect::<Vec<Passage>>()
        })
        .collect::<Vec<Passage>>();
    Ok(passages)
}

fn load_corpus(paths: &[String]) -> Result<Vec<Passage>> {
    let mut passages = Vec::new();
    for path in paths {
        passages.extend(load_corpus_passages(path)?);
    }
    Ok(passages)
}

pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .filter(|token| token.len() > 2)
        .collect::<Vec<String>>()
}

fn lexical_hits(terms: &[String], body: &str) -> usize {
    terms
        .iter()
        .map(|term| body.matches(term.as_str()).count())
        .sum::<usize>()
}

/// Keeps the highest scores first; ties stay in corpus order.
fn rank(mut scored: Vec<(usize, &Passage)>, k: usize) -> Vec<Passage> {
    scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));
    scored
        .into_iter()
        .take(k)
        .map(|(_, passage)| passage.clone())
        .collect()
}

pub struct LocalFileContextSearch {
    pub passages: Vec<Passage>,
}

impl LocalFileContextSearch {
    pub fn load(paths: &[String]) -> Result<Self> {
        Ok(Self {
            passages: load_corpus(paths)?,
        })
    }
}

impl ContextSearch for LocalFileContextSearch {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>> {
        let terms = query_terms(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let scored = self
            .passages
            .iter()
            .filter_map(|passage| {
                let score = lexical_hits(&terms, &passage.text.to_ascii_lowercase());
                (score > 0).then_some((score, passage))
            })
            .collect::<Vec<_>>();
        Ok(rank(scored, k))
    }
}

#[cfg(feature = "semantic-search")]
pub struct SemanticContextSearch {
    pub passages: Vec<Passage>,
}

#[cfg(feature = "semantic-search")]
impl SemanticContextSearch {
    pub fn load(paths: &[String]) -> Result<Self> {
        Ok(Self {
            passages: load_corpus(paths)?,
        })
    }
}

#[cfg(feature = "semantic-search")]
impl ContextSearch for SemanticContextSearch {
    fn backend_name(&self) -> &'static str {
        "semantic"
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>> {
        let query_lower = query.to_ascii_lowercase();
        if query_lower.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let terms = query_terms(query);

        let scored = self
            .passages
            .iter()
            .filter_map(|passage| {
                let body = passage.text.to_ascii_lowercase();
                let similarity = strsim::jaro_winkler(&query_lower, &body);
                let score = ((similarity * 1000.0) as usize) + (lexical_hits(&terms, &body) * 25);
                (score > 0).then_some((score, passage))
            })
            .collect::<Vec<_>>();
        Ok(rank(scored, k))
    }
}

/// Builds the configured backend. `disabled` yields no capability at all.
pub fn build_context_search(cfg: &RuntimeConfig) -> Result<Option<Arc<dyn ContextSearch>>> {
    let require_corpus = |backend: &str| -> Result<()> {
        if cfg.corpus_paths.is_empty() {
            return Err(anyhow::anyhow!(
                "retrieval backend '{backend}' requires --corpus-path <path> or profile.corpus_paths"
            ));
        }
        Ok(())
    };

    match cfg.retrieval_backend {
        RetrievalBackend::Disabled => Ok(None),
        RetrievalBackend::Local => {
            require_corpus("local")?;
            let search = LocalFileContextSearch::load(&cfg.corpus_paths)?;
            tracing::info!(passages = search.passages.len(), "loaded local corpus");
            let search: Arc<dyn ContextSearch> = Arc::new(search);
            Ok(Some(search))
        }
        RetrievalBackend::Semantic => {
            require_corpus("semantic")?;

            #[cfg(feature = "semantic-search")]
            {
                let search = SemanticContextSearch::load(&cfg.corpus_paths)?;
                tracing::info!(passages = search.passages.len(), "loaded semantic corpus");
                let search: Arc<dyn ContextSearch> = Arc::new(search);
                Ok(Some(search))
            }

            #[cfg(not(feature = "semantic-search"))]
            {
                Err(anyhow::anyhow!(
                    "retrieval backend 'semantic' requires feature 'semantic-search'. Rebuild with: cargo run --features semantic-search -- ..."
                ))
            }
        }
    }
}

pub fn format_context(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|passage| {
            format!(
                "(source={}, page={})\n{}",
                passage.source, passage.page, passage.text
            )
        })
        .collect::<Vec<String>>()
        .join("\n\n")
}

/// Fetches the top passages for `query` and renders them as a context block plus citations.
pub fn retrieve(
    query: &str,
    context_search: Option<&dyn ContextSearch>,
) -> Result<(String, Vec<Citation>), WorkflowError> {
    let search = context_search
        .ok_or(WorkflowError::CapabilityNotInitialized(CONTEXT_SEARCH_CAPABILITY))?;
    let passages = search
        .search(query, RETRIEVAL_TOP_K)
        .map_err(|err| WorkflowError::capability(CONTEXT_SEARCH_CAPABILITY, err))?;

    let citations = passages
        .iter()
        .map(|passage| Citation::new(passage.source.clone(), passage.page))
        .collect();
    Ok((format_context(&passages), citations))
}

pub fn run_retrieval_stage(
    state: &mut WorkflowState,
    context_search: Option<&dyn ContextSearch>,
) -> Result<(), WorkflowError> {
    state.require_operation("retrieval", Operation::Rag)?;

    let query = state.user_query().to_string();
    state.record(TraceEntry::act(RETRIEVE_ACTION, query.clone().into()));
    let (context, citations) = retrieve(&query, context_search)?;

    tracing::info!(chunks = citations.len(), "retrieval finished");
    state.record(TraceEntry::observe(format!(
        "Retrieved {} chunks",
        citations.len()
    )));
    state.retrieved_context = context;
    state.citations = citations;
    Ok(())
}
