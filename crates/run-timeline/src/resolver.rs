//! Active-item resolution.
//!
//! The active item is never stored; it is recomputed from the latest tree,
//! the persisted target id and the run's finalization flag, so it can never
//! point at a node that a newer poll removed.

use crate::model::{Action, Block, Thought, TimelineItem, TimelineNode};

/// Target id that always selects the live frame stream.
pub const STREAM_TARGET: &str = "stream";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveSelection<'a> {
    Stream,
    Block(&'a Block),
    Action(&'a Action),
    Thought(&'a Thought),
}

impl ActiveSelection<'_> {
    /// The id to persist for this selection.
    #[must_use]
    pub fn target_id(&self) -> &str {
        match self {
            Self::Stream => STREAM_TARGET,
            Self::Block(block) => &block.id,
            Self::Action(action) => &action.id,
            Self::Thought(thought) => &thought.id,
        }
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream)
    }
}

/// Which end of the root sequence holds the most recent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatestEnd {
    First,
    #[default]
    Last,
}

/// Resolve the active item for a tree ordered oldest-to-newest.
#[must_use]
pub fn resolve<'a>(
    tree: &'a [TimelineItem],
    target: Option<&str>,
    finalized: bool,
) -> Option<ActiveSelection<'a>> {
    resolve_with(tree, target, finalized, LatestEnd::Last)
}

#[must_use]
pub fn resolve_with<'a>(
    tree: &'a [TimelineItem],
    target: Option<&str>,
    finalized: bool,
    latest: LatestEnd,
) -> Option<ActiveSelection<'a>> {
    match target {
        Some(STREAM_TARGET) => Some(ActiveSelection::Stream),
        Some(id) => find_by_id(tree, id),
        None if !finalized => Some(ActiveSelection::Stream),
        None => latest_selection(tree, latest),
    }
}

/// Depth-first search over the whole forest for a block, thought or action id.
///
/// Uses an explicit stack so deeply nested loop bodies cannot exhaust the call
/// stack. Roots are pushed in order, so the last root is visited first.
#[must_use]
pub fn find_by_id<'a>(tree: &'a [TimelineItem], id: &str) -> Option<ActiveSelection<'a>> {
    let mut stack: Vec<&'a TimelineItem> = tree.iter().collect();
    while let Some(item) = stack.pop() {
        match item.node() {
            Some(TimelineNode::Block(block)) => {
                if block.id == id {
                    return Some(ActiveSelection::Block(block));
                }
                if let Some(action) = block.find_action(id) {
                    return Some(ActiveSelection::Action(action));
                }
            }
            Some(TimelineNode::Thought(thought)) if thought.id == id => {
                return Some(ActiveSelection::Thought(thought));
            }
            _ => {}
        }
        stack.extend(item.children.iter());
    }
    None
}

fn latest_selection(tree: &[TimelineItem], latest: LatestEnd) -> Option<ActiveSelection<'_>> {
    let item = match latest {
        LatestEnd::First => tree.first(),
        LatestEnd::Last => tree.last(),
    }?;
    match item.node()? {
        TimelineNode::Block(block) => Some(
            block
                .latest_action()
                .map_or(ActiveSelection::Block(block), ActiveSelection::Action),
        ),
        TimelineNode::Thought(thought) => Some(ActiveSelection::Thought(thought)),
    }
}
