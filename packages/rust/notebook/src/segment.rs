//! Splitting a source's code blocks into independently cached groups.

use quire_shared::syntax::RESET_MARKER;
use quire_shared::{CodeBlock, content_hash};

/// Consecutive code blocks of one source that share a kernel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookGroup {
    pub source: String,
    /// 1-based position among the source's groups.
    pub ordinal: usize,
    /// Number of groups in the source.
    pub total: usize,
    pub blocks: Vec<CodeBlock>,
    /// Cache key: hash of the concatenated block hashes.
    pub hash: String,
}

impl NotebookGroup {
    /// Offset of the block with the given 1-based index inside this group.
    pub fn position(&self, index: usize) -> Option<usize> {
        self.blocks.iter().position(|b| b.index == index)
    }

    pub fn codes(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.code.clone()).collect()
    }
}

/// Hash identifying a group's content. Only the cells' code enters the
/// key; the source path and line numbers do not. The same code in two
/// different sources yields the same hash and shares one artifact.
pub fn group_hash(blocks: &[CodeBlock]) -> String {
    let joined: String = blocks.iter().map(|b| b.hash.as_str()).collect();
    content_hash(&joined)
}

/// Split ordered blocks into groups. A block whose code starts with
/// `%reset -f` opens a new group.
pub fn segment(blocks: &[CodeBlock]) -> Vec<NotebookGroup> {
    let mut runs: Vec<Vec<CodeBlock>> = Vec::new();
    for block in blocks {
        let resets = block.code.trim_start().starts_with(RESET_MARKER);
        match runs.last_mut() {
            Some(run) if !resets => run.push(block.clone()),
            _ => runs.push(vec![block.clone()]),
        }
    }

    let total = runs.len();
    runs.into_iter()
        .enumerate()
        .map(|(i, blocks)| NotebookGroup {
            source: blocks.first().map(|b| b.source.clone()).unwrap_or_default(),
            ordinal: i + 1,
            total,
            hash: group_hash(&blocks),
            blocks,
        })
        .collect()
}

/// Find the group holding block `index` and the block's offset in it.
pub fn locate(groups: &[NotebookGroup], index: usize) -> Option<(&NotebookGroup, usize)> {
    groups
        .iter()
        .find_map(|g| g.position(index).map(|offset| (g, offset)))
}
