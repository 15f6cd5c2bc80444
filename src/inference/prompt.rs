//! Prompt template and output cleanup

use once_cell::sync::Lazy;
use regex::Regex;

use crate::inference::registry::DEFAULT_SYSTEM_INSTRUCTIONS;
use crate::types::model::ModelConfig;

/// Markers that end generation when they show up in the output
pub const STOP_MARKERS: [&str; 4] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|assistant|>"];

static LEADING_ROLE_MARKER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^</?\|(?:system|user|assistant)\|>").ok());

/// Pick the system instructions for a request.
///
/// Request override first, then the server-wide setting, then the model's own
/// instructions, then the built-in default.
pub fn system_instructions<'a>(
    requested: Option<&'a str>,
    configured: Option<&'a str>,
    model: &'a ModelConfig,
) -> &'a str {
    [requested, configured, model.system_instructions.as_deref()]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_SYSTEM_INSTRUCTIONS)
}

pub fn format_prompt(instructions: &str, prompt: &str) -> String {
    format!(
        "<|system|>{}</|system|>\n<|user|>{}</|user|>\n<|assistant|>",
        instructions, prompt
    )
}

/// Cut `text` before the first stop marker. Returns the marker that matched.
pub fn truncate_at_stop(text: &mut String) -> Option<&'static str> {
    let (pos, marker) = STOP_MARKERS
        .iter()
        .filter_map(|m| text.find(m).map(|pos| (pos, *m)))
        .min_by_key(|(pos, _)| *pos)?;
    text.truncate(pos);
    Some(marker)
}

/// Length of the longest suffix of `text` that could still grow into a stop
/// marker
pub fn partial_stop_suffix(text: &str) -> usize {
    let longest = STOP_MARKERS.iter().map(|m| m.len()).max().unwrap_or(0);
    (1..longest.min(text.len() + 1))
        .rev()
        .find(|&len| {
            let start = text.len() - len;
            text.is_char_boundary(start)
                && STOP_MARKERS.iter().any(|m| m.starts_with(&text[start..]))
        })
        .unwrap_or(0)
}

/// Strip echoed instructions, echoed prompt and role markers from the start
/// of the response. Text after the first real content is left alone.
pub fn clean_response(text: &str, instructions: &str, prompt: &str) -> String {
    let echoes = [instructions.trim(), prompt.trim()];
    let mut rest = text.trim_start();

    loop {
        let before = rest.len();
        if let Some(m) = LEADING_ROLE_MARKER.as_ref().and_then(|re| re.find(rest)) {
            rest = rest[m.end()..].trim_start();
        }
        for echoed in echoes.iter().filter(|e| !e.is_empty()) {
            if let Some(stripped) = rest.strip_prefix(echoed) {
                rest = stripped.trim_start();
            }
        }
        if rest.len() == before {
            break;
        }
    }
    rest.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::registry::model_config;

    #[test]
    fn test_format_prompt() {
        assert_eq!(
            format_prompt("Be brief.", "Hi"),
            "<|system|>Be brief.</|system|>\n<|user|>Hi</|user|>\n<|assistant|>"
        );
    }

    #[test]
    fn test_instruction_priority() {
        let phi = model_config("phi-2", "qwen-0.5b");
        let qwen = model_config("qwen-0.5b", "qwen-0.5b");

        assert_eq!(system_instructions(Some("req"), Some("cfg"), &phi), "req");
        assert_eq!(system_instructions(None, Some("cfg"), &phi), "cfg");
        assert!(system_instructions(None, None, &phi).starts_with("You are a precise"));
        assert_eq!(system_instructions(None, None, &qwen), DEFAULT_SYSTEM_INSTRUCTIONS);
        assert_eq!(system_instructions(Some("  "), None, &qwen), DEFAULT_SYSTEM_INSTRUCTIONS);
    }

    #[test]
    fn test_truncate_at_earliest_stop_marker() {
        let mut text = "Answer<|im_end|>junk</s>more".to_string();
        assert_eq!(truncate_at_stop(&mut text), Some("<|im_end|>"));
        assert_eq!(text, "Answer");

        let mut clean = "nothing to cut".to_string();
        assert_eq!(truncate_at_stop(&mut clean), None);
        assert_eq!(clean, "nothing to cut");
    }

    #[test]
    fn test_partial_stop_suffix() {
        assert_eq!(partial_stop_suffix("Hello <|im"), 4);
        assert_eq!(partial_stop_suffix("Hello </"), 2);
        assert_eq!(partial_stop_suffix("Hello"), 0);
        assert_eq!(partial_stop_suffix(""), 0);
        assert_eq!(partial_stop_suffix("é<"), 1);
    }

    #[test]
    fn test_clean_response_strips_echoes() {
        let out = clean_response(
            "<|system|>Be brief.</|system|> What is Rust? Rust is a language.",
            "Be brief.",
            "What is Rust?",
        );
        assert_eq!(out, "Rust is a language.");
    }

    #[test]
    fn test_clean_response_keeps_prompt_inside_answer() {
        assert_eq!(clean_response("banana bread", "Be brief.", "a"), "banana bread");
        assert_eq!(
            clean_response("a: banana bread is an a-grade loaf", "", "a"),
            ": banana bread is an a-grade loaf"
        );
        assert_eq!(
            clean_response("Say hi. Sure, I will say hi.", "", "Say hi."),
            "Sure, I will say hi."
        );
    }

    #[test]
    fn test_clean_response_with_empty_prompt() {
        assert_eq!(clean_response("  hello  ", "", ""), "hello");
    }
}
