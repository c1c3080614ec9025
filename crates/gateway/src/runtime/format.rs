//! Validation and repair of stage outputs.
//!
//! Backends occasionally close a section with the wrong end marker
//! (`<eot>` after Commands, `<eoc>` after the answer, ...). Such outputs are
//! rewritten to the canonical markers; anything else that does not match
//! the section grammar fails the turn with [`Error::Unknown`].

use std::sync::LazyLock;

use regex::Regex;

use mc_domain::error::{Error, Result};
use mc_domain::trace::TraceEvent;

use super::prompt::{TAG_COMMANDS, TAG_INNER_THOUGHTS, TAG_MOSS};

static STAGE1_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<\|Inner Thoughts\|>:([\s\S]+?)(<eo\w>)\n<\|Commands\|>:([\s\S]+?)(<eo\w>)$").unwrap()
});

static STAGE2_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<\|MOSS\|>:([\s\S]+?)(<eo\w>)").unwrap());

/// Repaired first-stage output.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage1 {
    pub inner_thoughts: String,
    pub commands: String,
}

impl Stage1 {
    pub fn render(&self) -> String {
        format!(
            "{TAG_INNER_THOUGHTS} {}<eot>\n{TAG_COMMANDS} {}<eoc>",
            self.inner_thoughts, self.commands
        )
    }
}

/// Repaired second-stage output.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage2 {
    pub answer: String,
}

impl Stage2 {
    pub fn render(&self) -> String {
        format!("{TAG_MOSS} {}<eom>", self.answer)
    }
}

/// Parse `<|Inner Thoughts|>:…<eot>\n<|Commands|>:…<eoc>`.
pub fn parse_stage1(text: &str) -> Result<Stage1> {
    let caps = STAGE1_RE
        .captures(text.trim_end())
        .ok_or_else(|| Error::Unknown("stage 1 output is malformed".into()))?;
    check_marker("Inner Thoughts", &caps[2], "<eot>");
    check_marker("Commands", &caps[4], "<eoc>");
    Ok(Stage1 {
        inner_thoughts: caps[1].trim().to_string(),
        commands: caps[3].trim().to_string(),
    })
}

/// Parse `<|MOSS|>:…<eom>`.
pub fn parse_stage2(text: &str) -> Result<Stage2> {
    let caps = STAGE2_RE
        .captures(text.trim_end())
        .ok_or_else(|| Error::Unknown("stage 2 output is malformed".into()))?;
    check_marker("MOSS", &caps[2], "<eom>");
    Ok(Stage2 {
        answer: caps[1].trim().to_string(),
    })
}

fn check_marker(section: &str, found: &str, expected: &str) {
    if found != expected {
        TraceEvent::FormatRepaired {
            section: section.into(),
            found: found.into(),
            expected: expected.into(),
        }
        .emit();
        tracing::warn!(section, found, expected, "repaired section end marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_stage1_is_normalized() {
        let s = parse_stage1("<|Inner Thoughts|>: None<eot>\n<|Commands|>: None<eoc>").unwrap();
        assert_eq!(s.inner_thoughts, "None");
        assert_eq!(s.commands, "None");
        assert_eq!(s.render(), "<|Inner Thoughts|>: None<eot>\n<|Commands|>: None<eoc>");
    }

    #[test]
    fn wrong_commands_marker_is_rewritten() {
        let s = parse_stage1(
            "<|Inner Thoughts|>:  I should search<eot>\n<|Commands|>: Search(\"rust\")<eot>\n",
        )
        .unwrap();
        assert_eq!(
            s.render(),
            "<|Inner Thoughts|>: I should search<eot>\n<|Commands|>: Search(\"rust\")<eoc>"
        );
    }

    #[test]
    fn wrong_inner_thoughts_marker_is_rewritten() {
        let s = parse_stage1("<|Inner Thoughts|>: hmm<eoc>\n<|Commands|>: None<eoc>").unwrap();
        assert_eq!(s.inner_thoughts, "hmm");
        assert!(s.render().starts_with("<|Inner Thoughts|>: hmm<eot>"));
    }

    #[test]
    fn repair_is_idempotent() {
        let once = parse_stage1("<|Inner Thoughts|>:x<eom>\n<|Commands|>:None<eot>")
            .unwrap()
            .render();
        let twice = parse_stage1(&once).unwrap().render();
        assert_eq!(once, twice);

        let a = parse_stage2("<|MOSS|>: Hi there!<eoc>").unwrap().render();
        assert_eq!(a, "<|MOSS|>: Hi there!<eom>");
        assert_eq!(parse_stage2(&a).unwrap().render(), a);
    }

    #[test]
    fn missing_commands_section_fails() {
        let err = parse_stage1("<|Inner Thoughts|>: None<eot>").unwrap_err();
        assert!(matches!(err, Error::Unknown(_)));
    }

    #[test]
    fn stage2_requires_an_end_marker() {
        assert!(parse_stage2("<|MOSS|>: cut off mid").is_err());
        let s = parse_stage2("<|MOSS|>: Hi there!<eom>").unwrap();
        assert_eq!(s.answer, "Hi there!");
    }
}
