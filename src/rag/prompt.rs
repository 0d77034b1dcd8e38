//! Prompt assembly.
//!
//! The prompt consists of a grounding instruction, the retrieved context, prior
//! turns (oldest first) and the current query. When a budget is set, oldest turns
//! are evicted first, then the lowest-ranked passages; the query is never cut.

use super::types::{join_passages, ConversationTurn, RetrievedPassage};
use crate::llm::ChatMessage;

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a research assistant. Answer the question using only the information in the context below. If the context does not contain the answer, say explicitly that the provided documents do not contain it instead of guessing.";

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    pub context_window_tokens: usize,
    pub reserved_output_tokens: usize,
}

impl PromptBudget {
    pub fn input_tokens(&self) -> usize {
        self.context_window_tokens
            .saturating_sub(self.reserved_output_tokens)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub text: String,
    /// Same content shaped for chat-completion endpoints.
    pub messages: Vec<ChatMessage>,
    pub passages_used: usize,
    pub turns_used: usize,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_instruction: String,
    budget: Option<PromptBudget>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_INSTRUCTION)
    }
}

impl PromptBuilder {
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: PromptBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn build(
        &self,
        context: &[RetrievedPassage],
        history: &[ConversationTurn],
        query: &str,
    ) -> Prompt {
        let mut passages = context.len();
        let mut first_turn = 0;
        let mut text = build_prompt(&self.system_instruction, &context[..passages], history, query);

        if let Some(budget) = self.budget {
            let limit = budget.input_tokens();
            while estimate_tokens(&text) > limit && first_turn < history.len() {
                first_turn += 1;
                text = build_prompt(
                    &self.system_instruction,
                    &context[..passages],
                    &history[first_turn..],
                    query,
                );
            }
            // At least one passage stays so the answer remains grounded.
            while estimate_tokens(&text) > limit && passages > 1 {
                passages -= 1;
                text = build_prompt(
                    &self.system_instruction,
                    &context[..passages],
                    &history[first_turn..],
                    query,
                );
            }
            if first_turn > 0 || passages < context.len() {
                tracing::debug!(
                    "Prompt trimmed to fit {} tokens: dropped {} turns and {} passages",
                    limit,
                    first_turn,
                    context.len() - passages
                );
            }
        }

        let messages = chat_messages(
            &self.system_instruction,
            &context[..passages],
            &history[first_turn..],
            query,
        );
        Prompt {
            estimated_tokens: estimate_tokens(&text),
            text,
            messages,
            passages_used: passages,
            turns_used: history.len() - first_turn,
        }
    }
}

fn system_block(system_instruction: &str, context: &[RetrievedPassage]) -> String {
    format!(
        "{}\n\nContext:\n{}",
        system_instruction.trim(),
        join_passages(context)
    )
}

/// Renders the full prompt as one string, without any length cap.
pub fn build_prompt(
    system_instruction: &str,
    context: &[RetrievedPassage],
    history: &[ConversationTurn],
    query: &str,
) -> String {
    let mut prompt = system_block(system_instruction, context);

    if !history.is_empty() {
        prompt.push_str("\n\nConversation so far:\n");
        for turn in history {
            prompt.push_str(&format!("User: {}\nAssistant: {}\n", turn.query, turn.response));
        }
    }

    prompt.push_str(&format!("\nUser: {}\nAssistant:", query));
    prompt
}

fn chat_messages(
    system_instruction: &str,
    context: &[RetrievedPassage],
    history: &[ConversationTurn],
    query: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 2);
    messages.push(ChatMessage::system(system_block(system_instruction, context)));
    for turn in history {
        messages.push(ChatMessage::user(turn.query.clone()));
        messages.push(ChatMessage::assistant(turn.response.clone()));
    }
    messages.push(ChatMessage::user(query));
    messages
}
