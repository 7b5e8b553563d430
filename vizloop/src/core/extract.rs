//! Snippet extraction from free-form reasoner text.
//!
//! Order of preference:
//! 1. the first fenced block tagged `python`/`py`/`python3`,
//! 2. the middle segment of the first fenced region, minus its info-string
//!    line when it is tagged with another language (`html`, `py3`, ...),
//! 3. the whole trimmed response.

use std::sync::LazyLock;

use regex::Regex;

const FENCE: &str = "```";

static PYTHON_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*(?:python3?|py)[ \t]*\r?\n(.*?)```").unwrap()
});

static INFO_STRING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w+#.-]+[ \t]*\r?\n").unwrap());

/// Where an extracted snippet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    TaggedFence,
    GenericFence,
    WholeText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub code: String,
    pub source: ExtractionSource,
}

/// Extract the executable snippet from `text`.
///
/// Returns `None` only when nothing non-blank is left to run.
pub fn extract_code(text: &str) -> Option<Extracted> {
    if let Some(caps) = PYTHON_FENCE_RE.captures(text) {
        let code = caps.get(1).map_or("", |m| m.as_str()).trim();
        if !code.is_empty() {
            return Some(Extracted {
                code: code.to_string(),
                source: ExtractionSource::TaggedFence,
            });
        }
    }

    let segments: Vec<&str> = text.split(FENCE).collect();
    if segments.len() >= 3 {
        let middle = INFO_STRING_RE.replace(segments[1], "");
        let middle = middle.trim();
        if !middle.is_empty() {
            return Some(Extracted {
                code: middle.to_string(),
                source: ExtractionSource::GenericFence,
            });
        }
    }

    let whole = text.trim();
    if whole.is_empty() {
        return None;
    }
    Some(Extracted {
        code: whole.to_string(),
        source: ExtractionSource::WholeText,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_block_yields_trimmed_interior() {
        let text = "Plan first.\n```python\n\n  import os\nprint('hi')  \n\n```\nDone.";
        let got = extract_code(text).expect("code");
        assert_eq!(got.code, "import os\nprint('hi')");
        assert_eq!(got.source, ExtractionSource::TaggedFence);
    }

    #[test]
    fn tagged_block_wins_over_earlier_generic_block() {
        let text = "```\nnot this\n```\nthen\n```py\nprint(1)\n```";
        let got = extract_code(text).expect("code");
        assert_eq!(got.code, "print(1)");
        assert_eq!(got.source, ExtractionSource::TaggedFence);
    }

    #[test]
    fn tag_match_is_case_insensitive() {
        let got = extract_code("```Python\nx = 1\n```").expect("code");
        assert_eq!(got.code, "x = 1");
    }

    #[test]
    fn generic_block_uses_middle_segment() {
        let text = "Here:\n```\nprint('generic')\n```\ntrailing words";
        let got = extract_code(text).expect("code");
        assert_eq!(got.code, "print('generic')");
        assert_eq!(got.source, ExtractionSource::GenericFence);
    }

    #[test]
    fn other_language_tag_is_not_part_of_the_code() {
        let got = extract_code("```html\n<html></html>\n```").expect("code");
        assert_eq!(got.code, "<html></html>");
        assert_eq!(got.source, ExtractionSource::GenericFence);

        let got = extract_code("Run this:\n```py3 \r\nprint(1)\n```").expect("code");
        assert_eq!(got.code, "print(1)");
        assert_eq!(got.source, ExtractionSource::GenericFence);
    }

    #[test]
    fn untagged_block_keeps_its_first_line() {
        let got = extract_code("```\nrun\nprint(2)\n```").expect("code");
        assert_eq!(got.code, "run\nprint(2)");

        let got = extract_code("```x = 1\nprint(x)\n```").expect("code");
        assert_eq!(got.code, "x = 1\nprint(x)");
    }

    #[test]
    fn single_delimiter_falls_back_to_whole_text() {
        let text = "  ```\nprint('unterminated')  ";
        let got = extract_code(text).expect("code");
        assert_eq!(got.code, "```\nprint('unterminated')");
        assert_eq!(got.source, ExtractionSource::WholeText);
    }

    #[test]
    fn empty_generic_block_falls_back_to_whole_text() {
        let got = extract_code("before ``` ``` after").expect("code");
        assert_eq!(got.source, ExtractionSource::WholeText);
    }

    #[test]
    fn plain_text_is_last_resort() {
        let got = extract_code("  print(42)\n").expect("code");
        assert_eq!(got.code, "print(42)");
        assert_eq!(got.source, ExtractionSource::WholeText);
    }

    #[test]
    fn blank_text_yields_nothing() {
        assert_eq!(extract_code(" \n\t "), None);
        assert_eq!(extract_code(""), None);
    }
}
