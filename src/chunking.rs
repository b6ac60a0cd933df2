use crate::error::{AdvisorError, AdvisorResult};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::env;
use std::sync::LazyLock;

pub const DEFAULT_CHUNK_SIZE: usize = 900;
pub const DEFAULT_CHUNK_OVERLAP: usize = 150;

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment pattern"));
static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid script pattern")
});
static STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid style pattern")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[A-Za-z/!?][^>]*>").expect("valid tag pattern"));

const ENTITIES: [(&str, &str); 7] = [
    ("&nbsp;", " "),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    // Last, so "&amp;lt;" decodes to "&lt;" and not "<"
    ("&amp;", "&"),
];

/// A bounded, overlapping slice of a source document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// `{source}#{offset}`, unique within a source
    pub id: String,
    /// Origin document identifier (usually the URL)
    pub source: String,
    /// Character offset of this window in the normalized document
    pub offset: usize,
    /// Normalized text of the window
    pub text: String,
    /// Filled in by the embedding step; empty until then
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
}

/// Window size and overlap, both measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkingConfig {
    /// Create a validated configuration (`0 <= overlap < chunk_size`)
    pub fn new(chunk_size: usize, overlap: usize) -> AdvisorResult<Self> {
        if chunk_size == 0 {
            return Err(AdvisorError::validation("chunk size must be positive"));
        }
        if overlap >= chunk_size {
            return Err(AdvisorError::validation(format!(
                "chunk overlap {} must be smaller than chunk size {}",
                overlap, chunk_size
            )));
        }
        Ok(ChunkingConfig {
            chunk_size,
            overlap,
        })
    }

    /// Read `ADVISOR_CHUNK_SIZE` / `ADVISOR_CHUNK_OVERLAP`, falling back to 900/150
    pub fn from_env() -> Result<Self> {
        let chunk_size = match env::var("ADVISOR_CHUNK_SIZE") {
            Ok(value) => value
                .trim()
                .parse()
                .context("ADVISOR_CHUNK_SIZE must be a positive integer")?,
            Err(_) => DEFAULT_CHUNK_SIZE,
        };
        let overlap = match env::var("ADVISOR_CHUNK_OVERLAP") {
            Ok(value) => value
                .trim()
                .parse()
                .context("ADVISOR_CHUNK_OVERLAP must be a non-negative integer")?,
            Err(_) => DEFAULT_CHUNK_OVERLAP,
        };
        Ok(ChunkingConfig::new(chunk_size, overlap)?)
    }

    /// Distance between the starts of consecutive windows
    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// Strip markup and collapse whitespace.
///
/// Comments, `<script>` and `<style>` blocks are removed with their content,
/// every other tag is replaced by a space, common entities are decoded and
/// whitespace runs become a single space.
pub fn normalize_text(raw: &str) -> String {
    let text = COMMENT_RE.replace_all(raw, " ");
    let text = SCRIPT_RE.replace_all(&text, " ");
    let text = STYLE_RE.replace_all(&text, " ");
    let mut text = TAG_RE.replace_all(&text, " ").into_owned();

    if text.contains('&') {
        for (entity, replacement) in ENTITIES {
            text = text.replace(entity, replacement);
        }
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a raw document and split it into overlapping chunks
pub fn chunk_document(raw: &str, source: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    split_into_chunks(&normalize_text(raw), source, config)
}

/// Split already-normalized text into fixed-size character windows.
///
/// Consecutive windows overlap by exactly the configured overlap and only
/// the final window may be shorter than the configured size.
pub fn split_into_chunks(text: &str, source: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    // Byte offset of every char boundary, including the end of the string
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = bounds.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < char_count {
        let end = (start + config.chunk_size).min(char_count);
        chunks.push(Chunk {
            id: format!("{}#{}", source, start),
            source: source.to_string(),
            offset: start,
            text: text[bounds[start]..bounds[end]].to_string(),
            embedding: Vec::new(),
        });

        if end == char_count {
            break;
        }
        start += config.stride();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(chunks: &[Chunk], overlap: usize) -> String {
        let mut text = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                text.push_str(&chunk.text);
            } else {
                text.extend(chunk.text.chars().skip(overlap));
            }
        }
        text
    }

    #[test]
    fn test_normalize_strips_markup() {
        let raw = "<html><head><style>body { color: red; }</style>\
                   <script type=\"text/javascript\">var x = 1 < 2;</script></head>\
                   <body><!-- nav --><h1>Degree   Plan</h1>\n\n<p>Math &amp; Physics</p></body></html>";
        assert_eq!(normalize_text(raw), "Degree Plan Math & Physics");
    }

    #[test]
    fn test_normalize_keeps_plain_comparisons() {
        assert_eq!(normalize_text("  3 < 4 and 5 > 2\t\n"), "3 < 4 and 5 > 2");
    }

    #[test]
    fn test_empty_input_produces_no_chunks() {
        let config = ChunkingConfig::default();
        assert!(chunk_document("", "empty", &config).is_empty());
        assert!(chunk_document("  <p>\n\t</p>  ", "blank", &config).is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let config = ChunkingConfig::new(50, 10).unwrap();
        let chunks = split_into_chunks("Course X requires 3 credits of math.", "a", &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "a#0");
        assert_eq!(chunks[0].text, "Course X requires 3 credits of math.");
    }

    #[test]
    fn test_windows_overlap_exactly() {
        let config = ChunkingConfig::new(10, 3).unwrap();
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = split_into_chunks(text, "alpha", &config);

        let offsets: Vec<usize> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 7, 14, 21]);
        assert_eq!(chunks[0].text, "abcdefghij");
        assert_eq!(chunks[1].text, "hijklmnopq");
        assert_eq!(chunks[3].text, "vwxyz");

        for pair in chunks.windows(2) {
            let tail: String = pair[0].text.chars().skip(7).collect();
            let head: String = pair[1].text.chars().take(3).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn test_chunks_cover_text() {
        let text = normalize_text(
            "Students must complete 120 credits. At least 30 credits must be upper division. \
             Electives can be chosen from any department, but no more than 12 credits may be \
             pass/fail. Consult the registrar for transfer credit evaluation.",
        );
        for (size, overlap) in [(10, 0), (17, 5), (40, 39), (900, 150), (1, 0)] {
            let config = ChunkingConfig::new(size, overlap).unwrap();
            let chunks = split_into_chunks(&text, "catalog", &config);
            assert_eq!(reconstruct(&chunks, overlap), text, "size {size} overlap {overlap}");
            assert!(chunks.iter().all(|c| c.text.chars().count() <= size));
        }
    }

    #[test]
    fn test_multibyte_text_is_split_on_char_boundaries() {
        let config = ChunkingConfig::new(4, 1).unwrap();
        let text = "Ünïvérsité café";
        let chunks = split_into_chunks(text, "fr", &config);
        assert_eq!(chunks[0].text, "Ünïv");
        assert_eq!(chunks[1].text, "vérs");
        assert_eq!(reconstruct(&chunks, 1), text);
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let config = ChunkingConfig::new(32, 8).unwrap();
        let raw = "<p>Course Y requires 3 credits of physics and a lab section.</p>";
        let first = chunk_document(raw, "https://example.edu/y", &config);
        let second = chunk_document(raw, "https://example.edu/y", &config);
        assert_eq!(first, second);
        assert_eq!(first[1].id, "https://example.edu/y#24");
    }

    #[test]
    fn test_config_rejects_invalid_overlap() {
        assert!(ChunkingConfig::new(0, 0).is_err());
        assert!(ChunkingConfig::new(100, 100).is_err());
        assert!(ChunkingConfig::new(100, 150).is_err());
        let config = ChunkingConfig::new(100, 99).unwrap();
        assert_eq!(config.stride(), 1);
    }
}
