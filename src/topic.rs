//! MQTT topic matching with wildcards
//!
//! Patterns follow the MQTT 3.1.1 / 5.0 filter rules: `+` matches exactly one
//! topic level, `#` matches zero or more levels and must be the final level.
//! Patterns are compiled once into a level-keyed trie; matching a concrete
//! topic is linear in its depth. When several patterns match, the
//! earliest-listed one wins, so overlapping bindings resolve deterministically.

use crate::config::ValidationConfig;
use crate::error::ConfigError;
use std::collections::HashMap;

/// Maximum topic length in bytes, per the MQTT specification.
const MAX_TOPIC_LEN: usize = 65_535;

/// One compiled pattern level.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    Plus,
    Hash,
}

/// A compiled MQTT topic filter.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    levels: Vec<Level>,
    source: String,
}

impl TopicPattern {
    /// Compile and validate a filter.
    ///
    /// Rejected forms: empty filters, empty levels (including a trailing
    /// `/`), `#` anywhere but the last level, and wildcards combined with
    /// literal characters within a level.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if pattern.len() > MAX_TOPIC_LEN {
            return Err(invalid("pattern exceeds 65535 bytes"));
        }

        let raw_levels: Vec<&str> = pattern.split('/').collect();
        let mut levels = Vec::with_capacity(raw_levels.len());

        for (i, level) in raw_levels.iter().enumerate() {
            if level.is_empty() {
                return Err(invalid("empty topic level"));
            }
            match *level {
                "#" => {
                    if i != raw_levels.len() - 1 {
                        return Err(invalid("'#' must be the last level"));
                    }
                    levels.push(Level::Hash);
                }
                "+" => levels.push(Level::Plus),
                other => {
                    if other.contains('#') {
                        return Err(invalid("'#' must occupy an entire level"));
                    }
                    if other.contains('+') {
                        return Err(invalid("'+' must occupy an entire level"));
                    }
                    levels.push(Level::Literal(other.to_string()));
                }
            }
        }

        Ok(Self {
            levels,
            source: pattern.to_string(),
        })
    }

    /// The original filter text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a concrete topic against this single pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let topic_levels: Vec<&str> = topic.split('/').collect();
        self.match_levels(&topic_levels)
    }

    fn match_levels(&self, topic: &[&str]) -> bool {
        let mut t_idx = 0;

        for (f_idx, level) in self.levels.iter().enumerate() {
            match level {
                Level::Hash => {
                    // Matches everything remaining, including zero levels
                    return f_idx == self.levels.len() - 1;
                }
                Level::Plus => {
                    if t_idx >= topic.len() {
                        return false;
                    }
                    t_idx += 1;
                }
                Level::Literal(lit) => {
                    if t_idx >= topic.len() || topic[t_idx] != lit.as_str() {
                        return false;
                    }
                    t_idx += 1;
                }
            }
        }

        t_idx == topic.len()
    }
}

/// Trie over a set of patterns, keyed by topic level.
#[derive(Debug, Default)]
struct PatternTrie {
    root: TrieNode,
}

#[derive(Debug, Default)]
struct TrieNode {
    literals: HashMap<String, TrieNode>,
    plus: Option<Box<TrieNode>>,
    /// Insertion index of the earliest pattern terminating exactly here
    terminal: Option<usize>,
    /// Insertion index of the earliest pattern ending in `#` at this node
    hash_terminal: Option<usize>,
}

impl PatternTrie {
    fn insert(&mut self, pattern: &TopicPattern, index: usize) {
        let mut node = &mut self.root;
        for level in &pattern.levels {
            match level {
                Level::Hash => {
                    node.hash_terminal.get_or_insert(index);
                    return;
                }
                Level::Plus => {
                    node = node.plus.get_or_insert_with(Default::default);
                }
                Level::Literal(lit) => {
                    node = node.literals.entry(lit.clone()).or_default();
                }
            }
        }
        node.terminal.get_or_insert(index);
    }

    /// Lowest insertion index among all patterns matching `topic`, if any.
    fn best_match(&self, topic: &str) -> Option<usize> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut best = None;
        Self::walk(&self.root, &levels, &mut best);
        best
    }

    fn walk(node: &TrieNode, remaining: &[&str], best: &mut Option<usize>) {
        // `#` matches zero or more remaining levels
        if let Some(idx) = node.hash_terminal {
            Self::record(best, idx);
        }

        match remaining.split_first() {
            None => {
                if let Some(idx) = node.terminal {
                    Self::record(best, idx);
                }
            }
            Some((head, tail)) => {
                // Literal edges before `+` before `#`
                if let Some(child) = node.literals.get(*head) {
                    Self::walk(child, tail, best);
                }
                if let Some(child) = &node.plus {
                    Self::walk(child, tail, best);
                }
            }
        }
    }

    fn record(best: &mut Option<usize>, idx: usize) {
        match best {
            Some(current) if *current <= idx => {}
            _ => *best = Some(idx),
        }
    }
}

/// Result of a topic lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDecision {
    /// Topic is covered by the allow-list
    pub matched: bool,
    /// Schema bound to the winning mapping pattern, if any
    pub schema_id: Option<String>,
}

/// Prebuilt topic index: allow-list trie, binding trie, and per-client rules.
///
/// Read-only after construction; workers share it behind an `Arc`.
pub struct TopicMatcher {
    allow: PatternTrie,
    bindings: PatternTrie,
    binding_schemas: Vec<String>,
    client_rules: HashMap<String, Vec<TopicPattern>>,
    subscription_filters: Vec<String>,
}

impl TopicMatcher {
    /// Compile the allow-list, schema bindings, and client rules.
    /// Malformed patterns fail startup.
    pub fn build(validation: &ValidationConfig) -> Result<Self, ConfigError> {
        let mut allow = PatternTrie::default();
        for (i, pattern) in validation.topic_patterns.iter().enumerate() {
            let compiled = TopicPattern::parse(pattern)?;
            allow.insert(&compiled, i);
        }

        let mut bindings = PatternTrie::default();
        let mut binding_schemas = Vec::with_capacity(validation.schema_mappings.len());
        for (i, mapping) in validation.schema_mappings.iter().enumerate() {
            let compiled = TopicPattern::parse(&mapping.pattern)?;
            bindings.insert(&compiled, i);
            binding_schemas.push(mapping.schema_id.clone());
        }

        let mut client_rules = HashMap::new();
        for (client_id, rules) in &validation.client_rules {
            let compiled: Result<Vec<_>, _> = rules
                .allowed_topics
                .iter()
                .map(|p| TopicPattern::parse(p))
                .collect();
            client_rules.insert(client_id.clone(), compiled?);
        }

        Ok(Self {
            allow,
            bindings,
            binding_schemas,
            client_rules,
            subscription_filters: validation.topic_patterns.clone(),
        })
    }

    /// Match a concrete topic: allow-list membership plus the schema bound
    /// to the earliest-listed matching mapping.
    pub fn match_topic(&self, topic: &str) -> TopicDecision {
        let matched = self.allow.best_match(topic).is_some();
        let schema_id = if matched {
            self.bindings
                .best_match(topic)
                .map(|i| self.binding_schemas[i].clone())
        } else {
            None
        };
        TopicDecision { matched, schema_id }
    }

    /// Per-client restriction check. Clients without rules pass; clients
    /// with rules must match at least one of their allowed topics.
    pub fn client_allows(&self, client_id: &str, topic: &str) -> bool {
        match self.client_rules.get(client_id) {
            None => true,
            Some(patterns) => patterns.iter().any(|p| p.matches(topic)),
        }
    }

    /// Topic filters the subscriber should subscribe to.
    pub fn subscription_filters(&self) -> &[String] {
        &self.subscription_filters
    }

    /// Validate a concrete (wildcard-free) topic name at ingress.
    pub fn validate_topic_name(topic: &str) -> Result<(), String> {
        if topic.is_empty() {
            return Err("topic is empty".to_string());
        }
        if topic.len() > MAX_TOPIC_LEN {
            return Err("topic exceeds 65535 bytes".to_string());
        }
        if topic.contains('\0') {
            return Err("topic contains a null byte".to_string());
        }
        if topic.contains('+') || topic.contains('#') {
            return Err("wildcards are not allowed in topic names".to_string());
        }
        if topic.split('/').any(str::is_empty) {
            return Err("topic contains an empty level".to_string());
        }
        Ok(())
    }
}
