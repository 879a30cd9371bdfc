//! Structural model of an automation run as seen by an operator.
//!
//! This crate is pure and synchronous:
//! - the timeline tree (blocks, thoughts, actions) and its predicates
//! - resolution of the single "active" item from a persisted target id
//! - the run status policy that drives polling and streaming

pub mod model;
pub mod resolver;
pub mod selection;
pub mod status;

pub use model::{
    Action, ActionOrigin, ActionStatus, Block, BlockKind, Thought, TimelineItem, TimelineItemKind,
    TimelineNode, count_actions, decode_timeline, is_block_item, is_task_variant_block,
    is_thought_item,
};
pub use resolver::{ActiveSelection, LatestEnd, STREAM_TARGET, find_by_id, resolve, resolve_with};
pub use selection::{ACTIVE_PARAM, active_target, with_active_target};
pub use status::{
    BlockStatusTracker, DEFAULT_POLL_INTERVAL, RunStatus, StatusClass, StatusRegression,
    is_finalized, is_running_or_queued, poll_interval,
};
