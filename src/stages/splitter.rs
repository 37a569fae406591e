//! Headline detection and article segmentation.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::Article;

/// Bodies shorter than this (in characters) are dropped as fragments.
pub const DEFAULT_MIN_ARTICLE_LENGTH: usize = 100;

/// Headline used when no headline is detected in an issue.
pub const UNTITLED_HEADLINE: &str = "Untitled Article";

const MIN_HEADLINE_LENGTH: usize = 5;

/// Ad markers needed before a block is treated as an advertisement.
const AD_MARKER_THRESHOLD: usize = 2;

#[allow(clippy::expect_used)]
static ALL_CAPS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][A-Z\s\d.,!?:;()'\-]+)$").expect("caps headline regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static UNDERLINED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)\s*[=\-]{3,}$").expect("underlined headline regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static NOT_A_HEADLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:BY\s+|By\s+|[A-Z][a-z]+\s+\d{1,2},\s+\d{4})").expect("byline regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static BYLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"By\s+([A-Z][a-z]+\s+[A-Z][a-z]+)").expect("byline capture regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static AD_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)CLASSIFIED",
        r"(?i)ADVERTISEMENT",
        r"(?i)\bFOR SALE\b",
        r"(?i)\bWANTED\b",
        r"(?i)\bFOR RENT\b",
        r"(?i)\bSPECIAL OFFER\b",
        r"(?i)\bCALL\s+\d{3}-\d{4}\b",
        r"\$\d+\.\d{2}\b",
        r"(?i)\d{1,2}% OFF\b",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("ad marker regex is valid")) // Static pattern, safe to panic
    .collect()
});

/// Splits cleaned issue text into articles at detected headlines.
#[derive(Debug, Clone)]
pub struct ArticleSplitter {
    pub min_article_length: usize,
    pub drop_advertisements: bool,
}

impl Default for ArticleSplitter {
    fn default() -> Self {
        Self {
            min_article_length: DEFAULT_MIN_ARTICLE_LENGTH,
            drop_advertisements: true,
        }
    }
}

impl ArticleSplitter {
    /// Returns the headline text if `line` looks like one.
    fn headline(line: &str) -> Option<&str> {
        let line = line.trim();
        let candidate = ALL_CAPS_LINE
            .captures(line)
            .or_else(|| UNDERLINED_LINE.captures(line))
            .and_then(|caps| caps.get(1))?
            .as_str()
            .trim();

        if candidate.chars().count() < MIN_HEADLINE_LENGTH || NOT_A_HEADLINE.is_match(candidate) {
            return None;
        }
        Some(candidate)
    }

    fn is_advertisement(text: &str) -> bool {
        AD_MARKERS.iter().filter(|re| re.is_match(text)).count() >= AD_MARKER_THRESHOLD
    }

    fn keep(&self, body: &str) -> bool {
        body.chars().count() >= self.min_article_length
            && !(self.drop_advertisements && Self::is_advertisement(body))
    }

    /// Splits `text` into articles, indexed from 1.
    ///
    /// Text before the first headline is discarded. When no headline is found
    /// the whole text becomes one [`UNTITLED_HEADLINE`] article regardless of
    /// length.
    #[must_use]
    pub fn split(&self, text: &str) -> Vec<Article> {
        let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
        for line in text.lines() {
            if let Some(headline) = Self::headline(line) {
                sections.push((headline.to_string(), Vec::new()));
            } else if let Some((_, body)) = sections.last_mut() {
                body.push(line);
            }
        }

        if sections.is_empty() {
            let body = text.trim();
            if body.is_empty() {
                return Vec::new();
            }
            debug!("no headlines detected, keeping whole text as one article");
            return vec![Article {
                index: 1,
                headline: UNTITLED_HEADLINE.to_string(),
                body: body.to_string(),
                byline: extract_byline(body),
            }];
        }

        let detected = sections.len();
        let articles: Vec<Article> = sections
            .into_iter()
            .map(|(headline, lines)| (headline, lines.join("\n").trim().to_string()))
            .filter(|(_, body)| self.keep(body))
            .enumerate()
            .map(|(i, (headline, body))| Article {
                index: i + 1,
                byline: extract_byline(&body),
                headline,
                body,
            })
            .collect();

        debug!(detected, kept = articles.len(), "split issue into articles");
        articles
    }
}

fn extract_byline(body: &str) -> Option<String> {
    BYLINE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
