//! Overlapping word-window chunker.
//!
//! Splits a post's normalized plain text into [`Chunk`]s of
//! `target_words` words, each sharing `overlap` words with its
//! predecessor so that no sentence is lost at a window edge.
//!
//! # Algorithm
//!
//! 1. Split the text on whitespace into a word sequence.
//! 2. If it fits in one window, emit a single chunk covering everything.
//! 3. Otherwise slide a `target_words` window with step
//!    `target_words - overlap`.
//! 4. When the words left after a window number at most `tail_threshold`,
//!    fold them into that window and stop, so no near-duplicate trailing
//!    chunk is produced and no word is dropped.
//! 5. Only once every [`Window`] is known are the windows turned into
//!    chunks carrying the final `chunk_count`.
//!
//! Chunk ids are `<slug>-<index>`, so re-ingesting a post overwrites its
//! previous vectors instead of duplicating them.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ExtractedLink, ExtractedPost};

/// Word range of a chunk before the total chunk count is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// Plan the word windows for a text of `word_count` words.
///
/// Always returns at least one window. Windows are contiguous in index,
/// each starts `step` words after the previous one, and the last window
/// always ends at `word_count`.
pub fn plan_windows(word_count: usize, config: &ChunkingConfig) -> Vec<Window> {
    let size = config.target_words;
    if word_count <= size {
        return vec![Window {
            index: 0,
            start: 0,
            end: word_count,
        }];
    }

    let step = config.step();
    let tail = config.tail_threshold();
    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let mut end = (start + size).min(word_count);
        let remaining = word_count - end;
        let last = remaining == 0 || remaining <= tail;
        if last {
            end = word_count;
        }
        windows.push(Window {
            index: windows.len(),
            start,
            end,
        });
        if last {
            break;
        }
        start += step;
    }

    windows
}

/// Chunk an extracted post into overlapping windows.
///
/// `source` is the namespace tag stamped on every chunk.
pub fn chunk_post(post: &ExtractedPost, source: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let words: Vec<&str> = post.plain_text.split_whitespace().collect();
    let windows = plan_windows(words.len(), config);
    let chunk_count = windows.len();

    windows
        .into_iter()
        .map(|window| {
            let text = words[window.start..window.end].join(" ");
            let links = links_in_text(&post.links, &text, config.link_context_probe_chars);
            Chunk {
                id: chunk_id(&post.slug, window.index),
                hash: hash_text(&text),
                text,
                chunk_index: window.index,
                chunk_count,
                start_word: window.start,
                end_word: window.end,
                links,
                title: post.title.clone(),
                author: post.author.clone(),
                published_at: post.published_at,
                canonical_url: post.canonical_url.clone(),
                source: source.to_string(),
            }
        })
        .collect()
}

/// Deterministic vector id for a chunk.
pub fn chunk_id(slug: &str, index: usize) -> String {
    format!("{}-{}", slug, index)
}

/// Links whose anchor text, or the leading `probe_chars` of whose context,
/// occurs in `text` (case-insensitive).
pub fn links_in_text(
    links: &[ExtractedLink],
    text: &str,
    probe_chars: usize,
) -> Vec<ExtractedLink> {
    let haystack = text.to_lowercase();
    links
        .iter()
        .filter(|link| {
            let anchor = link.anchor_text.trim().to_lowercase();
            if !anchor.is_empty() && haystack.contains(&anchor) {
                return true;
            }
            let probe: String = link
                .surrounding_context
                .trim()
                .chars()
                .take(probe_chars)
                .collect::<String>()
                .to_lowercase();
            !probe.is_empty() && haystack.contains(&probe)
        })
        .cloned()
        .collect()
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn cfg() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    fn post(text: String, links: Vec<ExtractedLink>) -> ExtractedPost {
        ExtractedPost {
            title: "Title".into(),
            subtitle: String::new(),
            author: "Nate".into(),
            published_at: Utc.with_ymd_and_hms(2025, 1, 7, 0, 0, 0).unwrap(),
            canonical_url: "https://example.com/p/post".into(),
            slug: "post".into(),
            plain_text: text,
            raw_article_html: String::new(),
            links,
        }
    }

    /// Rebuild the word sequence from each chunk's non-overlapping part.
    fn reconstruct(windows: &[Window], all: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for w in windows {
            let from = out.len().max(w.start);
            out.extend_from_slice(&all[from..w.end]);
        }
        out
    }

    #[test]
    fn test_exactly_target_is_one_chunk() {
        let chunks = chunk_post(&post(words(800), vec![]), "nate", &cfg());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].chunk_count, 1);
        assert_eq!(chunks[0].id, "post-0");
    }

    #[test]
    fn test_tail_fold_threshold() {
        for n in [801, 880, 960] {
            let windows = plan_windows(n, &cfg());
            assert_eq!(windows.len(), 1, "{} words", n);
            assert_eq!(windows[0].end, n);
        }
        let windows = plan_windows(961, &cfg());
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].start, 720);
        assert_eq!(windows[1].end, 961);
    }

    #[test]
    fn test_tail_threshold_is_tunable() {
        let config = ChunkingConfig {
            tail_min_words: Some(0),
            ..cfg()
        };
        let windows = plan_windows(801, &config);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].start, 720);
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let chunks = chunk_post(&post(words(3000), vec![]), "nate", &cfg());
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_word - pair[0].start_word, 720);
            assert_eq!(pair[0].end_word - pair[1].start_word, 80);
        }
    }

    #[test]
    fn test_counts_and_indices_consistent() {
        let chunks = chunk_post(&post(words(4100), vec![]), "nate", &cfg());
        let n = chunks.len();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert_eq!(c.chunk_count, n);
            assert_eq!(c.id, format!("post-{}", i));
            assert_eq!(c.source, "nate");
        }
    }

    #[test]
    fn test_rechunking_is_idempotent() {
        let p = post(words(2500), vec![]);
        let a = chunk_post(&p, "nate", &cfg());
        let b = chunk_post(&p, "nate", &cfg());
        let key = |c: &Chunk| (c.id.clone(), c.chunk_index, c.text.clone(), c.hash.clone());
        assert_eq!(a.iter().map(key).collect::<Vec<_>>(), b.iter().map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_text_single_empty_chunk() {
        let chunks = chunk_post(&post(String::new(), vec![]), "nate", &cfg());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
    }

    #[test]
    fn test_links_attach_locally() {
        let mut text: Vec<String> = (0..3000).map(|i| format!("w{}", i)).collect();
        text[10] = "Alpha".into();
        text[11] = "Report".into();
        text[2900] = "Beta".into();
        text[2901] = "Dataset".into();
        let links = vec![
            ExtractedLink {
                anchor_text: "alpha report".into(),
                target_url: "https://a.example".into(),
                surrounding_context: "w8 w9 Alpha Report w12".into(),
            },
            ExtractedLink {
                anchor_text: "beta dataset".into(),
                target_url: "https://b.example".into(),
                surrounding_context: "w2899 Beta Dataset w2902".into(),
            },
        ];
        let chunks = chunk_post(&post(text.join(" "), links), "nate", &cfg());
        assert!(chunks.len() > 2);

        let first = &chunks[0];
        let last = chunks.last().unwrap();
        assert_eq!(first.links.len(), 1);
        assert_eq!(first.links[0].target_url, "https://a.example");
        assert_eq!(last.links.len(), 1);
        assert_eq!(last.links[0].target_url, "https://b.example");
        for middle in &chunks[1..chunks.len() - 1] {
            assert!(middle.links.is_empty());
        }
    }

    #[test]
    fn test_empty_anchor_does_not_match_everything() {
        let links = vec![ExtractedLink {
            anchor_text: String::new(),
            target_url: "https://img.example".into(),
            surrounding_context: String::new(),
        }];
        assert!(links_in_text(&links, "any text at all", 50).is_empty());
    }

    proptest! {
        #[test]
        fn prop_windows_cover_every_word(n in 0usize..5000) {
            let all: Vec<String> = (0..n).map(|i| format!("w{}", i)).collect();
            let windows = plan_windows(n, &cfg());
            prop_assert_eq!(reconstruct(&windows, &all), all);
            for (i, w) in windows.iter().enumerate() {
                prop_assert_eq!(w.index, i);
            }
        }
    }
}
