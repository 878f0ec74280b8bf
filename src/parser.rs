//! Parser registry (C7) — external collaborator contract only.
//!
//! Per-retailer HTML selector tables and JSON-LD parsers are out of scope
//! (spec.md §1); the core only specifies the trait a parser must satisfy
//! and a registry to look parsers up by store tag. A JSON-LD fallback
//! extractor is provided for parsers that want it, since spec.md §9 notes
//! conversion of JSON-LD into `DiscoveredProduct` is an open question left
//! to each parser, not the core.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::DiscoveredProduct;

/// A pluggable per-store parser. The only contract the core enforces is
/// that `extract` never yields a product with an empty sku or URL
/// (spec.md §4.7) — enforced by [`ParserRegistry::extract`], not by the
/// trait itself, since parsers are treated as pure, untrusted functions.
pub trait Parser: Send + Sync {
    /// Extract product listings from one page's HTML.
    fn extract(&self, html: &str, page_url: &str) -> Vec<DiscoveredProduct>;

    /// The next page URL, if the current page indicates there is one.
    fn next_page_url(&self, html: &str, page_url: &str) -> Option<String>;
}

/// Looks up a [`Parser`] by store tag.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn Parser>>,
}

impl ParserRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { parsers: HashMap::new() }
    }

    /// Register a parser for a store tag.
    pub fn register(&mut self, store: &str, parser: Arc<dyn Parser>) {
        self.parsers.insert(store.to_string(), parser);
    }

    /// Look up the parser for a store.
    #[must_use]
    pub fn get(&self, store: &str) -> Option<Arc<dyn Parser>> {
        self.parsers.get(store).cloned()
    }

    /// Extract products for a store, dropping any the parser returned with
    /// an empty sku or URL — the one contract the core enforces against an
    /// otherwise-untrusted parser.
    #[must_use]
    pub fn extract(&self, store: &str, html: &str, page_url: &str) -> Vec<DiscoveredProduct> {
        let Some(parser) = self.get(store) else {
            return Vec::new();
        };
        parser
            .extract(html, page_url)
            .into_iter()
            .filter(|p| !p.sku.is_empty() && !p.url.is_empty())
            .collect()
    }
}

/// A minimal JSON-LD `Product`/`ItemList` extractor, offered to parsers
/// that want it. Conversion semantics for any one store remain that
/// store's parser's responsibility (spec.md §9 open question).
#[must_use]
pub fn extract_json_ld_blocks(html: &str) -> Vec<String> {
    const OPEN: &str = "<script type=\"application/ld+json\">";
    const CLOSE: &str = "</script>";

    let mut blocks = Vec::new();
    let mut rest = html;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        if let Some(end) = after_open.find(CLOSE) {
            blocks.push(after_open[..end].trim().to_string());
            rest = &after_open[end + CLOSE.len()..];
        } else {
            break;
        }
    }
    blocks
}
