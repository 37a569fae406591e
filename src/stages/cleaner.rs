//! OCR noise removal.

use std::sync::LazyLock;

use regex::Regex;

/// Lines that carry no article content: bare page numbers and separator rules.
#[allow(clippy::expect_used)]
static NOISE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+|-+|=+|\*+|_{3,})$").expect("noise regex is valid") // Static pattern, safe to panic
});

/// Frequent whole-word misreads of the scanner.
#[allow(clippy::expect_used)]
static OCR_FIXES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [(r"\bUie\b", "the"), (r"\bUiat\b", "that"), (r"\bwiUi\b", "with")]
        .into_iter()
        .map(|(pattern, fix)| (Regex::new(pattern).expect("OCR fix regex is valid"), fix)) // Static pattern, safe to panic
        .collect()
});

#[allow(clippy::expect_used)]
static SPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("space regex is valid")); // Static pattern, safe to panic

/// Stateless OCR text cleaner.
#[derive(Debug, Clone, Copy, Default)]
pub struct OcrCleaner;

impl OcrCleaner {
    /// Cleans raw OCR text.
    ///
    /// Normalizes line endings, drops noise lines, repairs common misreads,
    /// collapses runs of spaces, trims every line and keeps at most one blank
    /// line between paragraphs.
    ///
    /// ```
    /// use storydredge_core::stages::OcrCleaner;
    ///
    /// let cleaned = OcrCleaner.clean("Uie  mayor\r\n12\r\n\r\n\r\n\r\nspoke");
    /// assert_eq!(cleaned, "the mayor\n\nspoke");
    /// ```
    #[must_use]
    pub fn clean(&self, raw: &str) -> String {
        let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");

        let mut out: Vec<String> = Vec::new();
        let mut blank_run = 0usize;
        for line in normalized.lines() {
            let line = line.trim();
            if NOISE_LINE.is_match(line) {
                continue;
            }
            if line.is_empty() {
                blank_run += 1;
                if blank_run == 1 && !out.is_empty() {
                    out.push(String::new());
                }
                continue;
            }
            blank_run = 0;

            let mut fixed = SPACE_RUN.replace_all(line, " ").into_owned();
            for (pattern, replacement) in OCR_FIXES.iter() {
                fixed = pattern.replace_all(&fixed, *replacement).into_owned();
            }
            out.push(fixed);
        }

        while out.last().is_some_and(String::is_empty) {
            out.pop();
        }
        out.join("\n")
    }
}
