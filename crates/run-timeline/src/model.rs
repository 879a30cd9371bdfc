//! Timeline tree for a single run.
//!
//! Trees arrive from an untrusted source after JSON decoding, so every
//! nested payload is decoded leniently: a malformed block, thought, action or
//! child is dropped (and logged) instead of failing the whole tree.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::status::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineItemKind {
    Block,
    Thought,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One node of the run timeline.
///
/// The populated payload must match `kind`; a node where it does not is
/// malformed and matches no predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineItem {
    #[serde(rename = "type", default)]
    pub kind: TimelineItemKind,
    #[serde(default, deserialize_with = "lenient_option")]
    pub block: Option<Block>,
    #[serde(default, deserialize_with = "lenient_option")]
    pub thought: Option<Thought>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub children: Vec<TimelineItem>,
    #[serde(default, deserialize_with = "lenient_option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_option")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Borrowed, classified view of a well-formed [`TimelineItem`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimelineNode<'a> {
    Block(&'a Block),
    Thought(&'a Thought),
}

impl TimelineItem {
    #[must_use]
    pub fn block(block: Block, children: Vec<TimelineItem>) -> Self {
        Self {
            kind: TimelineItemKind::Block,
            block: Some(block),
            thought: None,
            children,
            created_at: None,
            modified_at: None,
        }
    }

    #[must_use]
    pub fn thought(thought: Thought, children: Vec<TimelineItem>) -> Self {
        Self {
            kind: TimelineItemKind::Thought,
            block: None,
            thought: Some(thought),
            children,
            created_at: None,
            modified_at: None,
        }
    }

    #[must_use]
    pub fn as_block(&self) -> Option<&Block> {
        match (self.kind, &self.block, &self.thought) {
            (TimelineItemKind::Block, Some(block), None) => Some(block),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_thought(&self) -> Option<&Thought> {
        match (self.kind, &self.block, &self.thought) {
            (TimelineItemKind::Thought, None, Some(thought)) => Some(thought),
            _ => None,
        }
    }

    #[must_use]
    pub fn node(&self) -> Option<TimelineNode<'_>> {
        self.as_block()
            .map(TimelineNode::Block)
            .or_else(|| self.as_thought().map(TimelineNode::Thought))
    }
}

#[must_use]
pub fn is_block_item(item: &TimelineItem) -> bool {
    item.as_block().is_some()
}

#[must_use]
pub fn is_thought_item(item: &TimelineItem) -> bool {
    item.as_thought().is_some()
}

/// Blocks that run a browser task and therefore carry actions.
#[must_use]
pub fn is_task_variant_block(block: &Block) -> bool {
    block.kind.is_task_variant()
}

/// Total number of actions across the whole forest, nested children included.
#[must_use]
pub fn count_actions(tree: &[TimelineItem]) -> usize {
    let mut total = 0;
    let mut stack: Vec<&TimelineItem> = tree.iter().collect();
    while let Some(item) = stack.pop() {
        if let Some(block) = item.as_block() {
            total += block.actions.len();
        }
        stack.extend(item.children.iter());
    }
    total
}

/// Decode a timeline forest, skipping root items that fail to decode.
///
/// Anything other than a JSON array decodes as an empty forest.
#[must_use]
pub fn decode_timeline(value: Value) -> Vec<TimelineItem> {
    match value {
        Value::Array(values) => decode_each(values),
        Value::Null => Vec::new(),
        other => {
            warn!("timeline payload is not an array: {}", value_kind(&other));
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Task,
    TaskV2,
    Navigation,
    Extraction,
    Validation,
    Action,
    Login,
    FileDownload,
    ForLoop,
    Code,
    TextPrompt,
    SendEmail,
    GotoUrl,
    Wait,
    HumanInteraction,
    FileUrlParser,
    PdfParser,
    DownloadToS3,
    UploadToS3,
    FileUpload,
    HttpRequest,
    #[serde(other)]
    Unknown,
}

impl BlockKind {
    #[must_use]
    pub fn is_task_variant(self) -> bool {
        matches!(
            self,
            Self::Task
                | Self::Navigation
                | Self::Extraction
                | Self::Validation
                | Self::Action
                | Self::Login
                | Self::FileDownload
        )
    }
}

/// One executed unit of the automation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "workflow_run_block_id")]
    pub id: String,
    #[serde(
        rename = "parent_workflow_run_block_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_id: Option<String>,
    #[serde(rename = "block_type")]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Unset until the block starts.
    #[serde(default, deserialize_with = "lenient_option")]
    pub status: Option<RunStatus>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Block {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            kind,
            label: None,
            status: None,
            actions: Vec::new(),
            navigation_goal: None,
            output: None,
            failure_reason: None,
            loop_values: None,
            url: None,
            extra: Map::new(),
        }
    }

    /// Most recent action in this block (highest ordinal).
    #[must_use]
    pub fn latest_action(&self) -> Option<&Action> {
        self.actions.iter().max_by_key(|action| action.ordinal)
    }

    #[must_use]
    pub fn find_action(&self, action_id: &str) -> Option<&Action> {
        self.actions.iter().find(|action| action.id == action_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionOrigin {
    Agent,
    Script,
}

/// One atomic operation inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "action_id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_option")]
    pub status: Option<ActionStatus>,
    /// Display numbering only; the highest ordinal is the most recent.
    #[serde(rename = "action_order", default)]
    pub ordinal: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Action {
    #[must_use]
    pub fn new(id: impl Into<String>, ordinal: u32) -> Self {
        Self {
            id: id.into(),
            status: None,
            ordinal,
            action_type: None,
            created_by: None,
        }
    }

    #[must_use]
    pub fn origin(&self) -> ActionOrigin {
        match self.created_by.as_deref() {
            Some("script") => ActionOrigin::Script,
            _ => ActionOrigin::Agent,
        }
    }
}

/// Reasoning emitted by the orchestrating agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thought {
    #[serde(rename = "thought_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
}

impl Thought {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            observation: None,
            thought: None,
            answer: None,
            user_input: None,
        }
    }
}

fn lenient_option<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(error) => {
            warn!("dropping malformed timeline field: {}", error);
            Ok(None)
        }
    }
}

fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Array(values) => Ok(decode_each(values)),
        Value::Null => Ok(Vec::new()),
        other => {
            warn!("expected timeline array, got {}", value_kind(&other));
            Ok(Vec::new())
        }
    }
}

fn decode_each<T: DeserializeOwned>(values: Vec<Value>) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(error) => {
                warn!("dropping malformed timeline entry: {}", error);
                None
            }
        })
        .collect()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
