use std::collections::VecDeque;

use thiserror::Error;
use tidepool_core::chat_len;

pub const CHAT_HISTORY: usize = 50;
pub const SELF_LABEL: &str = "You";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatLine {
    Message { from: String, text: String },
    Notice(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatInputError {
    #[error("message is empty")]
    Empty,
    #[error("Message exceeds maximum length of {max} characters")]
    TooLong { max: usize },
}

/// Trims the input and checks it against the length limit.
pub fn prepare_outgoing(input: &str, max_len: usize) -> Result<String, ChatInputError> {
    let text = input.trim();
    if text.is_empty() {
        return Err(ChatInputError::Empty);
    }
    if chat_len(text) > max_len {
        return Err(ChatInputError::TooLong { max: max_len });
    }
    Ok(text.to_string())
}

/// Most recent chat lines, oldest first.
#[derive(Debug, Default)]
pub struct ChatLog {
    lines: VecDeque<ChatLine>,
}

impl ChatLog {
    pub fn push(&mut self, line: ChatLine) {
        if self.lines.len() == CHAT_HISTORY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn push_message(&mut self, from: impl Into<String>, text: impl Into<String>) {
        self.push(ChatLine::Message {
            from: from.into(),
            text: text.into(),
        });
    }

    pub fn push_notice(&mut self, text: impl Into<String>) {
        self.push(ChatLine::Notice(text.into()));
    }

    pub fn lines(&self) -> impl DoubleEndedIterator<Item = &ChatLine> + ExactSizeIterator {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn outgoing_text_is_trimmed_and_bounded() {
        assert_eq!(prepare_outgoing("  hi  ", 100), Ok("hi".to_string()));
        assert_eq!(prepare_outgoing("   ", 100), Err(ChatInputError::Empty));
        assert_eq!(prepare_outgoing(&"ü".repeat(100), 100).map(|t| t.chars().count()), Ok(100));
        assert_eq!(
            prepare_outgoing(&"a".repeat(101), 100),
            Err(ChatInputError::TooLong { max: 100 })
        );
    }

    #[test_timeout::timeout]
    fn log_keeps_the_latest_lines() {
        let mut log = ChatLog::default();
        for n in 0..(CHAT_HISTORY + 5) {
            log.push_message("AB12", n.to_string());
        }
        assert_eq!(log.len(), CHAT_HISTORY);
        assert_eq!(
            log.lines().next(),
            Some(&ChatLine::Message {
                from: "AB12".into(),
                text: "5".into()
            })
        );
    }
}
