use halo_common::{Message, Role};
use halo_config::TemplateConfig;

/// Separator some front-ends append before a stats footer on assistant turns
const FOOTER_SEPARATOR: &str = "\n\n---\n";

/// Template engine for formatting prompts and scrubbing leaked markers
pub struct TemplateEngine;

impl TemplateEngine {
    /// Format messages into a prompt using the model template
    pub fn format_prompt(messages: &[Message], template: &TemplateConfig) -> String {
        let mut prompt = String::with_capacity(1024);
        let mut has_system = false;

        for message in messages {
            match message.role {
                Role::System => {
                    has_system = true;
                    Self::write_message(
                        &mut prompt,
                        &template.system_prefix,
                        &message.content,
                        &template.system_suffix,
                    );
                }
                Role::User => {
                    // Default system prompt, only when the template defines one
                    if !has_system && !template.default_system_prompt.is_empty() {
                        Self::write_message(
                            &mut prompt,
                            &template.system_prefix,
                            &template.default_system_prompt,
                            &template.system_suffix,
                        );
                    }
                    has_system = true;

                    Self::write_message(
                        &mut prompt,
                        &template.user_prefix,
                        &message.content,
                        &template.user_suffix,
                    );
                }
                Role::Assistant => {
                    Self::write_message(
                        &mut prompt,
                        &template.assistant_prefix,
                        &message.content,
                        &template.assistant_suffix,
                    );
                }
            }
        }

        // Add assistant prefix to signal model to respond
        prompt.push_str(&template.assistant_prefix);

        prompt
    }

    fn write_message(prompt: &mut String, prefix: &str, content: &str, suffix: &str) {
        prompt.reserve(prefix.len() + content.len() + suffix.len());
        prompt.push_str(prefix);
        prompt.push_str(content);
        prompt.push_str(suffix);
    }

    /// Plain Q/A transcript for runtimes that keep no conversation state:
    /// system prompt, the given history, then the new question.
    pub fn format_transcript(system_prompt: &str, history: &[Message], prompt: &str) -> String {
        let mut out = String::with_capacity(256 + prompt.len());

        if !system_prompt.trim().is_empty() {
            out.push_str(system_prompt);
            out.push_str("\n\n");
        }

        for message in history {
            match message.role {
                Role::User => {
                    out.push_str("Q: ");
                    out.push_str(&message.content);
                    out.push('\n');
                }
                Role::Assistant => {
                    out.push_str("A: ");
                    out.push_str(Self::strip_footer(&message.content));
                    out.push_str("\n\n");
                }
                Role::System => {}
            }
        }

        out.push_str("Q: ");
        out.push_str(prompt);
        out.push_str("\nA:");
        out
    }

    fn strip_footer(content: &str) -> &str {
        content
            .split_once(FOOTER_SEPARATOR)
            .map_or(content, |(body, _)| body)
    }

    /// Remove the template's role delimiters if the model echoed them
    pub fn remove_template_markers(text: &str, template: &TemplateConfig) -> String {
        let mut cleaned = text.to_string();
        let delimiters = [
            &template.system_prefix,
            &template.system_suffix,
            &template.user_prefix,
            &template.user_suffix,
            &template.assistant_prefix,
            &template.assistant_suffix,
        ];

        for delimiter in delimiters {
            let marker = delimiter.trim();
            // Angle-bracket special tokens only
            let is_special = marker.len() > 2 && marker.starts_with('<') && marker.ends_with('>');
            if is_special && cleaned.contains(marker) {
                cleaned = cleaned.replace(marker, "");
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_template() -> TemplateConfig {
        TemplateConfig {
            id: "test".to_string(),
            name: "Test".to_string(),
            markers: vec!["<|user|>".to_string()],
            system_prefix: "<|system|>".to_string(),
            system_suffix: "<|end|>".to_string(),
            user_prefix: "<|user|>\n".to_string(),
            user_suffix: "<|end|>\n".to_string(),
            assistant_prefix: "<|assistant|>".to_string(),
            assistant_suffix: "<|end|>\n".to_string(),
            default_system_prompt: String::new(),
        }
    }

    #[test]
    fn test_format_prompt() {
        let template = test_template();
        let messages = vec![
            Message::new(Role::System, "Be concise."),
            Message::new(Role::User, "Hello"),
        ];

        let prompt = TemplateEngine::format_prompt(&messages, &template);

        assert!(prompt.contains("<|system|>Be concise.<|end|>"));
        assert!(prompt.contains("<|user|>\nHello<|end|>\n"));
        assert!(prompt.ends_with("<|assistant|>"));
    }

    #[test]
    fn test_single_user_turn_has_no_system_block() {
        let prompt = TemplateEngine::format_prompt(&[Message::new(Role::User, "Hi")], &test_template());
        assert_eq!(prompt, "<|user|>\nHi<|end|>\n<|assistant|>");
    }

    #[test]
    fn test_default_system_prompt_is_inserted() {
        let mut template = test_template();
        template.default_system_prompt = "You are helpful.".into();

        let prompt = TemplateEngine::format_prompt(&[Message::new(Role::User, "Hi")], &template);
        assert!(prompt.starts_with("<|system|>You are helpful.<|end|>"));
    }

    #[test]
    fn test_transcript_format() {
        let history = vec![
            Message::new(Role::User, "What is 2+2?"),
            Message::new(Role::Assistant, "4\n\n---\n*eos • 1 tokens*"),
        ];

        let prompt = TemplateEngine::format_transcript("Be brief.", &history, "And 3+3?");
        assert_eq!(prompt, "Be brief.\n\nQ: What is 2+2?\nA: 4\n\nQ: And 3+3?\nA:");

        let bare = TemplateEngine::format_transcript("  ", &[], "Hi");
        assert_eq!(bare, "Q: Hi\nA:");
    }

    #[test]
    fn test_remove_template_markers() {
        let template = test_template();
        let cleaned = TemplateEngine::remove_template_markers("<|assistant|>Hello<|end|> there", &template);
        assert_eq!(cleaned, "Hello there");

        let untouched = TemplateEngine::remove_template_markers("a < b > c", &template);
        assert_eq!(untouched, "a < b > c");
    }
}
