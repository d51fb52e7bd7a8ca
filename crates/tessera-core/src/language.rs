use crate::constants::DEFAULT_LANGUAGE;

/// Detect the dominant language of a text sample.
///
/// Counts codepoints per script range and picks the highest; ties resolve
/// in the order Chinese > Japanese > Korean > Latin. Blank input maps to
/// English.
pub fn detect_language(text: &str) -> &'static str {
    let sample = text.trim();
    if sample.is_empty() {
        return DEFAULT_LANGUAGE;
    }

    let mut chinese = 0usize;
    let mut japanese = 0usize;
    let mut korean = 0usize;
    let mut latin = 0usize;

    for ch in sample.chars() {
        let cp = ch as u32;
        match cp {
            // CJK Unified Ideographs
            0x4E00..=0x9FFF => chinese += 1,
            // Hiragana and Katakana are unambiguously Japanese
            0x3040..=0x309F | 0x30A0..=0x30FF => japanese += 1,
            // Hangul syllables
            0xAC00..=0xD7AF => korean += 1,
            _ => {
                if is_latin_letter(ch) {
                    latin += 1;
                }
            }
        }
    }

    // Candidate order encodes the tie-break priority: a later candidate must
    // be strictly greater to win.
    let candidates = [
        ("zh", chinese),
        ("ja", japanese),
        ("ko", korean),
        ("en", latin),
    ];
    let mut best = (DEFAULT_LANGUAGE, 0usize);
    for (code, count) in candidates {
        if count > best.1 {
            best = (code, count);
        }
    }
    best.0
}

fn is_latin_letter(ch: char) -> bool {
    ch.is_ascii_alphabetic()
        || matches!(ch as u32, 0xC0..=0xFF | 0x100..=0x17F | 0x180..=0x24F) && ch.is_alphabetic()
}

/// Normalize a language code to lowercase ISO-639-1 form (`en`, `zh_cn` → `zh_cn`).
pub fn normalize_language_code(code: &str) -> String {
    code.trim().to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_chinese() {
        assert_eq!(detect_language("这是一个中文文本"), "zh");
    }

    #[test]
    fn detects_english() {
        assert_eq!(detect_language("This is an English text"), "en");
    }

    #[test]
    fn blank_defaults_to_english() {
        assert_eq!(detect_language(""), "en");
        assert_eq!(detect_language("   \t\n"), "en");
    }

    #[test]
    fn detects_japanese() {
        assert_eq!(detect_language("これは日本語のテキストです"), "ja");
    }

    #[test]
    fn detects_korean() {
        assert_eq!(detect_language("한국어 텍스트입니다"), "ko");
    }

    #[test]
    fn kana_outweighs_embedded_kanji() {
        // Kanji count toward Chinese but the kana majority decides.
        assert_eq!(detect_language("日本語です"), "ja");
    }

    #[test]
    fn tie_prefers_chinese_over_latin() {
        // Two hanzi, two Latin letters: tie resolves toward Chinese.
        assert_eq!(detect_language("中文ab"), "zh");
    }

    #[test]
    fn punctuation_and_digits_are_ignored()  {
        assert_eq!(detect_language("12345 !!! ???"), "en");
    }

    #[test]
    fn normalizes_codes() {
        assert_eq!(normalize_language_code(" ZH-CN "), "zh_cn");
        assert_eq!(normalize_language_code("En"), "en");
    }
}
