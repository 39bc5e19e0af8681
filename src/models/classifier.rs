//! Message classifier driving search- vs orchestrator-model routing
//!
//! Classification is an ordered rule table: each rule is a set of fixed
//! strings compiled into one case-insensitive Aho-Corasick automaton, so a
//! classification pass is O(|content|) regardless of keyword count.

use aho_corasick::AhoCorasick;

use crate::agent::types::{Message, Role};

/// Which model a message routes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelChoice {
    /// General search/code-generation model
    Search,
    /// Planning and final-answer model
    Orchestrator,
}

/// One classification rule: keyword set → choice
#[derive(Debug)]
pub struct ClassifierRule {
    matcher: AhoCorasick,
    choice: ModelChoice,
}

impl ClassifierRule {
    /// Compile a rule from fixed-string keywords (matched case-insensitively)
    pub fn new(keywords: &[&str], choice: ModelChoice) -> Self {
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(keywords)
            .expect("keyword automaton");
        ClassifierRule { matcher, choice }
    }

    /// The choice this rule yields when it matches
    pub fn choice(&self) -> ModelChoice {
        self.choice
    }

    fn matches(&self, content: &str) -> bool {
        self.matcher.is_match(content)
    }
}

/// Routes a message list to a model by scanning the latest user or
/// assistant content for planning / final-answer markers
#[derive(Debug)]
pub struct MessageClassifier {
    rules: Vec<ClassifierRule>,
    fallback: ModelChoice,
}

impl MessageClassifier {
    /// Classifier with the standard deep-search rule table: planning and
    /// final-answer phrasing routes to the orchestrator, everything else to
    /// the search model.
    pub fn deep_search() -> Self {
        MessageClassifier {
            rules: vec![ClassifierRule::new(
                &[
                    "facts survey",
                    "updated facts survey",
                    "plan",
                    "final answer",
                    "final answer to the original question",
                ],
                ModelChoice::Orchestrator,
            )],
            fallback: ModelChoice::Search,
        }
    }

    /// Classifier with a custom rule table evaluated in order
    pub fn with_rules(rules: Vec<ClassifierRule>, fallback: ModelChoice) -> Self {
        MessageClassifier { rules, fallback }
    }

    /// Classify a message list
    ///
    /// Only the latest `user`/`assistant` message is inspected; its text is
    /// the plain content or the concatenated text parts.
    pub fn classify(&self, messages: &[Message]) -> ModelChoice {
        let latest = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User | Role::Assistant));
        match latest {
            Some(message) => self.classify_text(&message.text()),
            None => self.fallback,
        }
    }

    /// Classify raw text
    pub fn classify_text(&self, content: &str) -> ModelChoice {
        for rule in &self.rules {
            if rule.matches(content) {
                return rule.choice;
            }
        }
        self.fallback
    }
}
