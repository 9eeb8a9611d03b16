//! Prompt assembly
//!
//! Composes the ordered message list handed to the inference backend:
//! [system prompt] + [prior session messages] + [retrieved-context
//! preamble] + [current user message]. Prior-message pruning is
//! deterministic: drop oldest first until the estimate fits the
//! context budget.

use orbit_core::{estimate_tokens, ChatMessage, Document, StoredMessage};

/// Builder for one request's prompt.
pub struct PromptBuilder {
    system: Option<String>,
    prior: Vec<StoredMessage>,
    documents: Vec<Document>,
    user: String,
}

impl PromptBuilder {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            system: None,
            prior: Vec::new(),
            documents: Vec::new(),
            user: user_message.into(),
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system.filter(|s| !s.is_empty());
        self
    }

    pub fn with_prior(mut self, prior: Vec<StoredMessage>) -> Self {
        self.prior = prior;
        self
    }

    pub fn with_documents(mut self, documents: &[Document]) -> Self {
        self.documents = documents.to_vec();
        self
    }

    /// Assemble the message list within `num_ctx - reserved_output`
    /// estimated tokens.
    pub fn build(self, num_ctx: usize, reserved_output: usize) -> Vec<ChatMessage> {
        let budget = num_ctx.saturating_sub(reserved_output);

        let context = if self.documents.is_empty() {
            None
        } else {
            Some(format_context(&self.documents))
        };

        let mut fixed = estimate_tokens(&self.user);
        if let Some(system) = &self.system {
            fixed += estimate_tokens(system);
        }
        if let Some(context) = &context {
            fixed += estimate_tokens(context);
        }

        // Oldest-first drop over prior messages
        let mut prior = self.prior;
        let mut prior_tokens: usize = prior
            .iter()
            .map(|m| m.token_estimate.map(|t| t as usize).unwrap_or_else(|| estimate_tokens(&m.content)))
            .sum();
        while !prior.is_empty() && fixed + prior_tokens > budget {
            let dropped = prior.remove(0);
            prior_tokens -= dropped
                .token_estimate
                .map(|t| t as usize)
                .unwrap_or_else(|| estimate_tokens(&dropped.content));
        }

        let mut messages = Vec::with_capacity(prior.len() + 3);
        if let Some(system) = self.system {
            messages.push(ChatMessage::system(system));
        }
        for stored in &prior {
            messages.push(stored.as_chat_message());
        }
        if let Some(context) = context {
            messages.push(ChatMessage::system(context));
        }
        messages.push(ChatMessage::user(self.user));
        messages
    }
}

/// Stable labelled context block. One entry per document with its
/// source, answer or content, and score.
pub fn format_context(documents: &[Document]) -> String {
    let mut block = String::from("Use the retrieved context below to ground your answer.\n");
    for (index, doc) in documents.iter().enumerate() {
        block.push_str(&format!(
            "\n[{}] source: {} | score: {:.2}\n",
            index + 1,
            doc.metadata.source,
            doc.score
        ));
        if let Some(question) = &doc.metadata.question {
            block.push_str(&format!("Q: {question}\n"));
        }
        match &doc.metadata.answer {
            Some(answer) => block.push_str(&format!("A: {answer}\n")),
            None => {
                block.push_str(&doc.content);
                block.push('\n');
            }
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orbit_core::Role;

    fn stored(role: Role, content: &str, ordinal: u64) -> StoredMessage {
        StoredMessage {
            session_id: "s1".into(),
            ordinal,
            role,
            content: content.into(),
            created_at: Utc::now(),
            token_estimate: None,
            blocked: false,
        }
    }

    #[test]
    fn test_message_order() {
        let docs = vec![Document::new("parks are green", 0.8).with_source("kb")];
        let messages = PromptBuilder::new("tell me more")
            .with_system(Some("You are helpful.".into()))
            .with_prior(vec![stored(Role::User, "hi", 1), stored(Role::Assistant, "hello", 2)])
            .with_documents(&docs)
            .build(8192, 1024);

        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[2].content, "hello");
        assert!(messages[3].content.contains("source: kb"));
        assert_eq!(messages[4].content, "tell me more");
    }

    #[test]
    fn test_pruning_drops_oldest_first() {
        let long = "word ".repeat(400); // ~500 tokens
        let prior = vec![
            stored(Role::User, &long, 1),
            stored(Role::Assistant, "short answer", 2),
            stored(Role::User, "recent question", 3),
        ];

        // Budget too small for the long oldest message
        let messages = PromptBuilder::new("now")
            .with_prior(prior)
            .build(300, 100);

        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert!(!contents.iter().any(|c| c.starts_with("word ")));
        assert!(contents.contains(&"short answer"));
        assert!(contents.contains(&"recent question"));
    }

    #[test]
    fn test_pruning_deterministic() {
        let prior = vec![
            stored(Role::User, &"a ".repeat(200), 1),
            stored(Role::Assistant, &"b ".repeat(200), 2),
        ];
        let a = PromptBuilder::new("q").with_prior(prior.clone()).build(150, 50);
        let b = PromptBuilder::new("q").with_prior(prior).build(150, 50);
        let sa: Vec<&String> = a.iter().map(|m| &m.content).collect();
        let sb: Vec<&String> = b.iter().map(|m| &m.content).collect();
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_context_block_format() {
        let docs = vec![
            Document::new("", 0.9)
                .with_source("city_faq")
                .with_question("Population?")
                .with_answer("1,234,567"),
            Document::new("Parks are open daily.", 0.7).with_source("parks_kb"),
        ];
        let block = format_context(&docs);
        assert!(block.contains("[1] source: city_faq | score: 0.90"));
        assert!(block.contains("Q: Population?"));
        assert!(block.contains("A: 1,234,567"));
        assert!(block.contains("[2] source: parks_kb | score: 0.70"));
        assert!(block.contains("Parks are open daily."));
    }

    #[test]
    fn test_no_context_block_without_documents() {
        let messages = PromptBuilder::new("hi").build(4096, 512);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");
    }
}
