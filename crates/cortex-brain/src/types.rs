//! Record types stored in the brain.
//!
//! String-typed columns (priority, record kind, atom field) are closed enums
//! here; parsing an unknown string is a [`ValidationError`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrainError, Result};
use crate::validation::ValidationError;

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers and Timestamps
// ─────────────────────────────────────────────────────────────────────────────

/// Generate a random id with the given prefix (`syn`, `thr`, `stm`, `atom`).
pub(crate) fn new_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..16])
}

/// Canonical timestamp encoding. Fixed width, so text order is time order.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BrainError::InvalidData(format!("bad timestamp '{}': {}", s, e)))
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────────────────────────

/// Message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Info,
    Action,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Info => "info",
            Priority::Action => "action",
            Priority::Urgent => "urgent",
        }
    }

    /// Importance of the priority normalized to (0, 1].
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Info => 1.0 / 3.0,
            Priority::Action => 2.0 / 3.0,
            Priority::Urgent => 1.0,
        }
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(Priority::Info),
            "action" => Ok(Priority::Action),
            "urgent" => Ok(Priority::Urgent),
            other => Err(ValidationError::InvalidPriority(other.to_string())),
        }
    }
}

/// The three kinds of searchable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Message,
    Stm,
    Atom,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Message, SourceKind::Stm, SourceKind::Atom];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Message => "message",
            SourceKind::Stm => "stm",
            SourceKind::Atom => "atom",
        }
    }

    /// Table holding records of this kind.
    pub(crate) fn table(&self) -> &'static str {
        match self {
            SourceKind::Message => "messages",
            SourceKind::Stm => "stm",
            SourceKind::Atom => "atoms",
        }
    }
}

impl FromStr for SourceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "message" => Ok(SourceKind::Message),
            "stm" => Ok(SourceKind::Stm),
            "atom" => Ok(SourceKind::Atom),
            other => Err(ValidationError::InvalidKind(other.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four text fields of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomField {
    Subject,
    Action,
    Outcome,
    Consequences,
}

impl AtomField {
    pub const ALL: [AtomField; 4] = [
        AtomField::Subject,
        AtomField::Action,
        AtomField::Outcome,
        AtomField::Consequences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AtomField::Subject => "subject",
            AtomField::Action => "action",
            AtomField::Outcome => "outcome",
            AtomField::Consequences => "consequences",
        }
    }
}

impl FromStr for AtomField {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "subject" => Ok(AtomField::Subject),
            "action" => Ok(AtomField::Action),
            "outcome" => Ok(AtomField::Outcome),
            "consequences" => Ok(AtomField::Consequences),
            other => Err(ValidationError::InvalidField(other.to_string())),
        }
    }
}

/// Kind of item held in working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
    Stm,
    Atom,
}

impl PinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinKind::Stm => "stm",
            PinKind::Atom => "atom",
        }
    }
}

impl FromStr for PinKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stm" => Ok(PinKind::Stm),
            "atom" => Ok(PinKind::Atom),
            other => Err(ValidationError::InvalidKind(other.to_string())),
        }
    }
}

/// Which signal dominated a search result's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Lexical,
    Semantic,
    Recency,
}

// ─────────────────────────────────────────────────────────────────────────────
// Categories
// ─────────────────────────────────────────────────────────────────────────────

/// Category assigned when none is given.
pub const DEFAULT_CATEGORY: &str = "general";

/// Ordered, de-duplicated, non-empty list of STM categories.
///
/// Stored as a JSON array in a TEXT column; [`Categories::to_json`] and
/// [`Categories::from_json`] are the only way in and out of that column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Categories(Vec<String>);

impl Categories {
    /// Build from caller input: trims, drops blanks and duplicates, keeps first-seen order.
    pub fn new<I, S>(items: I) -> std::result::Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for item in items {
            let item: String = item.into();
            let trimmed = item.trim();
            if trimmed.is_empty() || out.iter().any(|c| c == trimmed) {
                continue;
            }
            out.push(trimmed.to_string());
        }
        if out.is_empty() {
            return Err(ValidationError::EmptyCategories);
        }
        Ok(Self(out))
    }

    pub fn contains(&self, category: &str) -> bool {
        self.0.iter().any(|c| c == category)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn to_json(&self) -> String {
        // Serializing a Vec<String> cannot fail.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let raw: Vec<String> = serde_json::from_str(s)?;
        Ok(Self::new(raw)?)
    }
}

impl Default for Categories {
    fn default() -> Self {
        Self(vec![DEFAULT_CATEGORY.to_string()])
    }
}

impl TryFrom<Vec<String>> for Categories {
    type Error = ValidationError;

    fn try_from(v: Vec<String>) -> std::result::Result<Self, Self::Error> {
        Categories::new(v)
    }
}

impl From<Categories> for Vec<String> {
    fn from(c: Categories) -> Self {
        c.0
    }
}

/// A category known to the store: registered, in use by STM entries, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryInfo {
    pub name: String,
    /// Keywords that route uncategorized memories here (empty when unregistered).
    pub keywords: Vec<String>,
    /// Whether the category is in the registry.
    pub registered: bool,
    /// STM entries carrying the category.
    pub entry_count: usize,
    pub created_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Messaging
// ─────────────────────────────────────────────────────────────────────────────

/// A message between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub from_agent: String,
    /// `None` means broadcast.
    pub to_agent: Option<String>,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// In an inbox listing: read by that agent. Elsewhere: read by anyone.
    pub read: bool,
    /// Same scoping as `read`, for acknowledgements.
    pub acknowledged: bool,
    pub task_status: Option<String>,
}

/// A conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub subject: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: u64,
    pub status: String,
}

/// Input for [`crate::Brain::send`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from: String,
    pub to: Option<String>,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub thread_id: Option<String>,
}

impl NewMessage {
    /// A broadcast message at `info` priority in a new thread.
    pub fn new(from: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: None,
            subject: subject.into(),
            body: body.into(),
            priority: Priority::Info,
            thread_id: None,
        }
    }

    pub fn to(mut self, agent: impl Into<String>) -> Self {
        self.to = Some(agent.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Filter for [`crate::Brain::history`]. Unrestricted when neither field is set.
#[derive(Debug, Clone)]
pub struct HistoryFilter {
    /// Matches sender or recipient.
    pub agent: Option<String>,
    pub thread: Option<String>,
    pub limit: usize,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            agent: None,
            thread: None,
            limit: 50,
        }
    }
}

impl HistoryFilter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Short-Term Memory
// ─────────────────────────────────────────────────────────────────────────────

/// A short-term memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StmEntry {
    pub id: String,
    pub content: String,
    pub categories: Categories,
    /// In [0, 3].
    pub importance: f64,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub source_message_id: Option<String>,
}

/// Input for [`crate::Brain::remember`].
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub categories: Option<Vec<String>>,
    pub importance: Option<f64>,
    pub source: Option<String>,
    pub source_message_id: Option<String>,
    /// Caller-chosen id; remembering an existing id is a no-op.
    pub id: Option<String>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            categories: None,
            importance: None,
            source: None,
            source_message_id: None,
            id: None,
        }
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = Some(categories.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_source_message(mut self, message_id: impl Into<String>) -> Self {
        self.source_message_id = Some(message_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Knowledge Graph
// ─────────────────────────────────────────────────────────────────────────────

/// A unit of causal knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: String,
    pub subject: String,
    pub action: String,
    pub outcome: String,
    pub consequences: String,
    /// In [0, 1].
    pub confidence: f64,
    pub source: String,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub source_message_id: Option<String>,
}

impl Atom {
    pub fn field(&self, field: AtomField) -> &str {
        match field {
            AtomField::Subject => &self.subject,
            AtomField::Action => &self.action,
            AtomField::Outcome => &self.outcome,
            AtomField::Consequences => &self.consequences,
        }
    }

    /// Text embedded into the unified index: all four fields, one per line.
    pub fn embedding_text(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}",
            self.subject, self.action, self.outcome, self.consequences
        )
    }

    /// One-line rendering used in previews.
    pub fn summary(&self) -> String {
        format!(
            "{} {} -> {} ({})",
            self.subject, self.action, self.outcome, self.consequences
        )
    }
}

/// Input for [`crate::Brain::create_atom`].
#[derive(Debug, Clone)]
pub struct NewAtom {
    pub subject: String,
    pub action: String,
    pub outcome: String,
    pub consequences: String,
    pub confidence: f64,
    pub source: Option<String>,
    pub source_message_id: Option<String>,
}

impl NewAtom {
    pub fn new(
        subject: impl Into<String>,
        action: impl Into<String>,
        outcome: impl Into<String>,
        consequences: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            action: action.into(),
            outcome: outcome.into(),
            consequences: consequences.into(),
            confidence: 1.0,
            source: None,
            source_message_id: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_source_message(mut self, message_id: impl Into<String>) -> Self {
        self.source_message_id = Some(message_id.into());
        self
    }
}

/// A directed, weighted edge between two atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    pub from_atom_id: String,
    pub to_atom_id: String,
    pub relation: String,
    /// In [0, 1]. Running mean over observations.
    pub strength: f64,
    pub observation_count: u64,
    pub last_observed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One step of a provenance chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub kind: SourceKind,
    pub id: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    /// How this node was reached from the previous one; `None` for the first node.
    pub relation: Option<String>,
}

/// An atom with no further causes, found walking back from another atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub atom: Atom,
    /// Number of causal hops from the starting atom.
    pub depth: usize,
}

/// A root cause shared by the causal chains behind an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRootCause {
    pub atom: Atom,
    /// How many matching outcome atoms trace back to this root.
    pub occurrences: usize,
    /// Shortest distance from any matching outcome atom.
    pub depth: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Working Memory
// ─────────────────────────────────────────────────────────────────────────────

/// A pinned STM entry or atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemoryPin {
    pub item_id: String,
    pub item_kind: PinKind,
    pub label: Option<String>,
    pub pinned_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Search
// ─────────────────────────────────────────────────────────────────────────────

/// A ranked result from unified search or `recent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub kind: SourceKind,
    pub id: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    /// Weighted composite score.
    pub score: f64,
    pub match_type: MatchType,
    /// Normalized lexical score in [0, 1] (0 when no full-text hit).
    pub lexical: f64,
    /// Cosine similarity (0 when no vector hit).
    pub semantic: f64,
}

/// An event and the records that preceded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lookback {
    /// Best match for the event query.
    pub event: SearchResult,
    /// Earliest time covered; `None` when the window reaches the beginning of the store.
    pub window_start: Option<DateTime<Utc>>,
    /// Records created in the window before the event, newest first.
    pub preceding: Vec<SearchResult>,
}
