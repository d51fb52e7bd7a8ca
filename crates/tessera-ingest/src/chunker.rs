use tessera_core::config::ChunkerConfig;
use tessera_core::constants::CHUNK_MIN_CHARS;

/// One chunk of markdown, ready to become a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub title: Option<String>,
    pub content: String,
}

/// Minimum cursor progress per size-split step, in characters.
const MIN_SPLIT_PROGRESS: usize = 50;

/// Title length cap when synthesizing from the first sentence.
const SYNTH_TITLE_CHARS: usize = 100;

/// Split markdown into titled, size-bounded chunks.
///
/// Headings at the permitted levels open chunks; a leading level-1 heading
/// is the document title and its trailing content becomes an intro prepended
/// to the first real chunk. Oversized bodies are further split by size with
/// sentence-boundary cuts and overlap. The chunker is pure; it never touches
/// storage or embeddings.
pub fn chunk_markdown(text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    let target = config.target_chars.max(CHUNK_MIN_CHARS);
    let overlap = config.overlap_chars.min(target / 2);

    let lines: Vec<&str> = text.lines().collect();

    // Document title: a level-1 heading on the very first non-empty line.
    let first_content_line = lines.iter().position(|line| !line.trim().is_empty());
    let mut doc_title = None;
    let mut body_start = 0;
    if let Some(first) = first_content_line
        && let Some((1, title)) = parse_heading(lines[first])
    {
        doc_title = Some(title);
        body_start = first + 1;
    }

    // Split the remaining lines at permitted headings.
    let mut intro_lines: Vec<&str> = Vec::new();
    let mut segments: Vec<(String, Vec<&str>)> = Vec::new();
    for line in lines[body_start..].iter().copied() {
        match parse_heading(line) {
            Some((level, title)) if config.heading_levels.contains(&level) => {
                segments.push((title, Vec::new()));
            }
            _ => match segments.last_mut() {
                Some((_, body)) => body.push(line),
                None => intro_lines.push(line),
            },
        }
    }

    let intro = intro_lines.join("\n").trim().to_string();

    if segments.is_empty() {
        // No headings at permitted levels: size-split the whole content.
        let full = if let (Some(title), true) = (&doc_title, !intro.is_empty()) {
            // The document reduces to its title plus intro.
            return split_oversized(&intro, Some(title.clone()), target, overlap);
        } else {
            text.trim().to_string()
        };
        return split_oversized(&full, None, target, overlap);
    }

    let mut chunks = Vec::new();
    for (index, (title, body_lines)) in segments.iter().enumerate() {
        let mut content = body_lines.join("\n").trim().to_string();
        if index == 0 && !intro.is_empty() {
            content = if content.is_empty() {
                intro.clone()
            } else {
                format!("{intro}\n\n{content}")
            };
        }
        if content.is_empty() {
            continue;
        }
        if content.chars().count() > target + target / 2 {
            chunks.extend(split_oversized(&content, Some(title.clone()), target, overlap));
        } else {
            chunks.push(Chunk {
                title: Some(title.clone()),
                content,
            });
        }
    }
    chunks
}

fn parse_heading(line: &str) -> Option<(u8, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim();
    if title.is_empty() {
        return None;
    }
    Some((hashes as u8, title.to_string()))
}

/// Size-based splitting: fixed windows with sentence-boundary rewind and
/// overlap between consecutive parts.
fn split_oversized(
    text: &str,
    parent_title: Option<String>,
    target: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut parts: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    while cursor < total {
        let end = (cursor + target).min(total);
        let mut cut = end;
        if end < total {
            // Prefer a sentence end inside the last 20% of the window.
            let window_start = cursor + target.saturating_sub(target / 5);
            for i in (window_start..end).rev() {
                if is_sentence_end(&chars, i) {
                    cut = i + 1;
                    break;
                }
            }
        }

        let piece: String = chars[cursor..cut].iter().collect();
        let trimmed = piece.trim();
        if trimmed.chars().count() >= CHUNK_MIN_CHARS {
            parts.push(trimmed.to_string());
        }

        if cut >= total {
            break;
        }
        cursor = cut.saturating_sub(overlap).max(cursor + MIN_SPLIT_PROGRESS);
    }

    let multipart = parts.len() > 1;
    parts
        .into_iter()
        .enumerate()
        .map(|(index, content)| {
            let title = match &parent_title {
                Some(parent) if multipart && index > 0 => {
                    Some(format!("{parent} (Part {})", index + 1))
                }
                Some(parent) => Some(parent.clone()),
                None => Some(synthesize_title(&content, index + 1)),
            };
            Chunk { title, content }
        })
        .collect()
}

fn is_sentence_end(chars: &[char], index: usize) -> bool {
    if !matches!(chars[index], '.' | '!' | '?') {
        return false;
    }
    match chars.get(index + 1) {
        Some(next) => next.is_whitespace(),
        None => true,
    }
}

/// Title for a chunk that has no heading of its own: the first internal
/// heading, else the first sentence, else a positional name.
fn synthesize_title(content: &str, ordinal: usize) -> String {
    for line in content.lines() {
        if let Some((_, title)) = parse_heading(line) {
            return title;
        }
    }

    let chars: Vec<char> = content.chars().collect();
    let sentence_end = (0..chars.len()).find(|i| is_sentence_end(&chars, *i));
    let sentence: String = match sentence_end {
        Some(end) => chars[..=end].iter().collect(),
        None => content.to_string(),
    };
    let sentence = sentence.trim();
    if sentence.is_empty() {
        return format!("Section {ordinal}");
    }
    if sentence.chars().count() > SYNTH_TITLE_CHARS {
        let truncated: String = sentence.chars().take(SYNTH_TITLE_CHARS).collect();
        format!("{}...", truncated.trim_end())
    } else {
        sentence.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkerConfig {
        ChunkerConfig {
            target_chars: 2000,
            overlap_chars: 200,
            heading_levels: vec![1, 2, 3],
        }
    }

    fn titles(chunks: &[Chunk]) -> Vec<&str> {
        chunks
            .iter()
            .map(|c| c.title.as_deref().unwrap_or(""))
            .collect()
    }

    #[test]
    fn document_title_intro_prepends_first_chunk() {
        let chunks = chunk_markdown(
            "# Title\n\nintro\n\n## A\n\nbody A\n\n## B\n\nbody B",
            &config(),
        );
        assert_eq!(
            chunks,
            vec![
                Chunk {
                    title: Some("A".into()),
                    content: "intro\n\nbody A".into(),
                },
                Chunk {
                    title: Some("B".into()),
                    content: "body B".into(),
                },
            ]
        );
    }

    #[test]
    fn heading_levels_outside_the_set_stay_in_the_body() {
        let chunks = chunk_markdown("## A\n\nbody\n\n#### deep\n\nmore", &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "body\n\n#### deep\n\nmore");
    }

    #[test]
    fn doc_title_with_no_later_headings_becomes_its_own_chunk() {
        let body = "This is the introduction paragraph that stands alone and is long enough to keep.";
        let chunks = chunk_markdown(&format!("# Only Title\n\n{body}"), &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].title.as_deref(), Some("Only Title"));
        assert_eq!(chunks[0].content, body);
    }

    #[test]
    fn later_h1_is_a_normal_boundary() {
        let chunks = chunk_markdown(
            "intro paragraph\n\n# First\n\nbody one\n\n# Second\n\nbody two",
            &config(),
        );
        assert_eq!(titles(&chunks), vec!["First", "Second"]);
        // Leading content attaches to the first chunk rather than vanishing.
        assert!(chunks[0].content.starts_with("intro paragraph"));
    }

    #[test]
    fn headingless_text_is_size_split_with_synthesized_titles() {
        let sentence = "The quick brown fox jumps over the lazy dog near the river bank today. ";
        let text = sentence.repeat(40); // ~2880 chars
        let chunks = chunk_markdown(&text, &config());
        assert!(chunks.len() >= 2);
        // Synthesized from the first sentence.
        assert!(
            chunks[0]
                .title
                .as_deref()
                .unwrap()
                .starts_with("The quick brown fox")
        );
        for chunk in &chunks {
            assert!(chunk.content.chars().count() >= CHUNK_MIN_CHARS);
            assert!(chunk.content.chars().count() <= 2000);
        }
    }

    #[test]
    fn oversized_section_gets_part_suffixes() {
        let sentence = "Long enough sentences accumulate until the body crosses the split bound. ";
        let body = sentence.repeat(60); // ~4440 chars > 1.5 * 2000
        let chunks = chunk_markdown(&format!("## Big\n\n{body}"), &config());
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].title.as_deref(), Some("Big"));
        assert_eq!(chunks[1].title.as_deref(), Some("Big (Part 2)"));
    }

    #[test]
    fn splits_cut_at_sentence_boundaries_when_possible() {
        let sentence = "Every sentence in this block ends cleanly with a period and a space. ";
        let text = sentence.repeat(45);
        let chunks = chunk_markdown(&text, &config());
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(
                chunk.content.ends_with('.'),
                "chunk does not end at a sentence: ...{:?}",
                &chunk.content[chunk.content.len().saturating_sub(20)..]
            );
        }
    }

    #[test]
    fn consecutive_parts_overlap() {
        let sentence = "Overlap verification text keeps repeating to cross the window size. ";
        let text = sentence.repeat(60);
        let chunks = chunk_markdown(&text, &config());
        assert!(chunks.len() >= 2);
        let first_tail: String = chunks[0]
            .content
            .chars()
            .rev()
            .take(40)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        assert!(
            chunks[1].content.contains(first_tail.trim()),
            "second chunk does not repeat the tail of the first"
        );
    }

    #[test]
    fn tiny_headingless_leftovers_are_discarded() {
        let chunks = chunk_markdown("too short", &config());
        assert!(chunks.is_empty());
    }

    #[test]
    fn heading_chunks_are_kept_even_when_short() {
        let chunks = chunk_markdown("## A\n\ntiny", &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "tiny");
    }

    #[test]
    fn empty_sections_between_headings_are_skipped() {
        let chunks = chunk_markdown("## A\n\n## B\n\nbody", &config());
        assert_eq!(titles(&chunks), vec!["B"]);
    }

    #[test]
    fn chunking_is_idempotent_over_rejoined_heading_text() {
        let input = "# Doc\n\nintro here\n\n## One\n\nfirst body text\n\n## Two\n\nsecond body text";
        let first_pass = chunk_markdown(input, &config());
        let rejoined: String = first_pass
            .iter()
            .map(|chunk| format!("## {}\n\n{}", chunk.title.as_deref().unwrap(), chunk.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let second_pass = chunk_markdown(&rejoined, &config());
        assert_eq!(first_pass, second_pass);
    }
}
