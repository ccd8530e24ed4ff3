//! Administrative region hierarchy and address-to-region resolution.
//!
//! Regions are loaded once into an arena ([`RegionTree`]) and only ever
//! replaced wholesale through [`RegionResolver::reload`].
//!
//! Resolution takes a full street address such as
//! `"Daejeon Yuseong-gu Deokjin-dong 123"`:
//!
//! 1. the top-level region whose name is a prefix of the address is picked
//!    (`Daejeon`);
//! 2. its children are searched for a name occurring anywhere in the rest of
//!    the address (`Yuseong-gu`);
//! 3. the child is returned if one matched, the top-level region otherwise.
//!
//! When several candidates match at either step the longest name wins, and
//! among equally long names the one loaded first.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub type RegionId = i32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegionError {
    #[error("No administrative region found for address: {0}")]
    NoMatch(String),

    #[error("Region {0} appears more than once")]
    DuplicateId(RegionId),

    #[error("Region {id} has an empty name")]
    EmptyName { id: RegionId },

    #[error("Region {id} references missing parent {parent}")]
    DanglingParent { id: RegionId, parent: RegionId },

    #[error("Region {0} is part of a parent cycle")]
    Cycle(RegionId),
}

/// A region row as stored
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RegionRecord {
    pub region_id: RegionId,
    pub parent_id: Option<RegionId>,
    pub name: String,
}

impl RegionRecord {
    pub fn new(region_id: RegionId, parent_id: Option<RegionId>, name: impl Into<String>) -> Self {
        Self {
            region_id,
            parent_id,
            name: name.into(),
        }
    }
}

/// A node of the region tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: RegionId,
    pub parent: Option<RegionId>,
    pub name: String,
    /// Depth in the tree; top-level regions are level 1
    pub level: u32,
}

impl Region {
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

/// Immutable arena of regions
#[derive(Debug, Default)]
pub struct RegionTree {
    nodes: Vec<Region>,
    index: HashMap<RegionId, usize>,
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
}

impl RegionTree {
    /// Build a tree from stored rows, preserving their order.
    pub fn build(records: impl IntoIterator<Item = RegionRecord>) -> Result<Self, RegionError> {
        let mut nodes = Vec::new();
        let mut index = HashMap::new();

        for record in records {
            if record.name.trim().is_empty() {
                return Err(RegionError::EmptyName {
                    id: record.region_id,
                });
            }
            if index.insert(record.region_id, nodes.len()).is_some() {
                return Err(RegionError::DuplicateId(record.region_id));
            }
            nodes.push(Region {
                id: record.region_id,
                parent: record.parent_id,
                name: record.name,
                level: 0,
            });
        }

        let mut roots = Vec::new();
        let mut children = vec![Vec::new(); nodes.len()];
        for (slot, node) in nodes.iter().enumerate() {
            match node.parent {
                None => roots.push(slot),
                Some(parent) => {
                    let parent_slot = *index.get(&parent).ok_or(RegionError::DanglingParent {
                        id: node.id,
                        parent,
                    })?;
                    children[parent_slot].push(slot);
                }
            }
        }

        let levels = derive_levels(&nodes, &index)?;
        for (node, level) in nodes.iter_mut().zip(levels) {
            node.level = level;
        }

        Ok(Self {
            nodes,
            index,
            roots,
            children,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.index.get(&id).map(|&slot| &self.nodes[slot])
    }

    /// Top-level regions in load order
    pub fn roots(&self) -> impl Iterator<Item = &Region> {
        self.roots.iter().map(|&slot| &self.nodes[slot])
    }

    /// Direct children of a region in load order
    pub fn children(&self, id: RegionId) -> impl Iterator<Item = &Region> {
        self.index
            .get(&id)
            .map(|&slot| self.children[slot].as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&slot| &self.nodes[slot])
    }

    /// Most specific region for a full street address
    pub fn resolve(&self, address: &str) -> Result<&Region, RegionError> {
        let address = address.trim();

        let top = longest_name(self.roots().filter(|r| address.starts_with(r.name.as_str())))
            .ok_or_else(|| RegionError::NoMatch(address.to_string()))?;

        let rest = &address[top.name.len()..];
        let child = longest_name(
            self.children(top.id)
                .filter(|c| rest.contains(c.name.as_str())),
        );

        Ok(child.unwrap_or(top))
    }
}

/// First of the longest-named candidates
fn longest_name<'a>(candidates: impl Iterator<Item = &'a Region>) -> Option<&'a Region> {
    candidates.fold(None, |best: Option<&Region>, candidate| match best {
        Some(current) if current.name.len() >= candidate.name.len() => Some(current),
        _ => Some(candidate),
    })
}

fn derive_levels(nodes: &[Region], index: &HashMap<RegionId, usize>) -> Result<Vec<u32>, RegionError> {
    let mut levels = vec![0u32; nodes.len()];

    for start in 0..nodes.len() {
        // Walk up until a node with a known level or a root
        let mut path = Vec::new();
        let mut slot = start;
        let base = loop {
            if levels[slot] != 0 {
                break levels[slot];
            }
            if path.len() > nodes.len() {
                return Err(RegionError::Cycle(nodes[start].id));
            }
            path.push(slot);
            match nodes[slot].parent {
                None => break 0,
                Some(parent) => slot = index[&parent],
            }
        };

        for (depth, &slot) in path.iter().rev().enumerate() {
            levels[slot] = base + depth as u32 + 1;
        }
    }

    Ok(levels)
}

/// Shared, reloadable view of the region tree
pub struct RegionResolver {
    tree: RwLock<Arc<RegionTree>>,
}

impl RegionResolver {
    pub fn new(tree: RegionTree) -> Self {
        Self {
            tree: RwLock::new(Arc::new(tree)),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = RegionRecord>) -> Result<Self, RegionError> {
        Ok(Self::new(RegionTree::build(records)?))
    }

    /// Current tree; unaffected by later reloads
    pub fn snapshot(&self) -> Arc<RegionTree> {
        self.tree.read().clone()
    }

    pub fn resolve(&self, address: &str) -> Result<Region, RegionError> {
        self.snapshot().resolve(address).cloned()
    }

    /// Replace the tree with one built from `records`.
    ///
    /// The current tree stays in place if the new one is invalid.
    pub fn reload(&self, records: impl IntoIterator<Item = RegionRecord>) -> Result<usize, RegionError> {
        let tree = RegionTree::build(records)?;
        let count = tree.len();
        *self.tree.write() = Arc::new(tree);
        info!(regions = count, "Region tree reloaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> RegionTree {
        RegionTree::build(vec![
            RegionRecord::new(1, None, "Daejeon"),
            RegionRecord::new(2, None, "Seoul"),
            RegionRecord::new(10, Some(1), "Yuseong-gu"),
            RegionRecord::new(11, Some(1), "Seo-gu"),
            RegionRecord::new(20, Some(2), "Gangnam-gu"),
            RegionRecord::new(21, Some(2), "Yuseong-gu Annex"),
            RegionRecord::new(100, Some(10), "Deokjin-dong"),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolves_child_after_prefix() {
        let tree = sample_tree();
        let region = tree.resolve("Daejeon Yuseong-gu Deokjin-dong 123").unwrap();
        assert_eq!(region.name, "Yuseong-gu");
        assert_eq!(region.level, 2);
    }

    #[test]
    fn test_falls_back_to_top_level_region() {
        let tree = sample_tree();
        let region = tree.resolve("Daejeon Daedeok-gu 45").unwrap();
        assert_eq!(region.id, 1);
        assert!(region.is_top_level());
    }

    #[test]
    fn test_child_name_may_follow_street_tokens() {
        let tree = sample_tree();
        let region = tree.resolve("Seoul 123 Teheran-ro Gangnam-gu").unwrap();
        assert_eq!(region.id, 20);
    }

    #[test]
    fn test_no_prefix_fails() {
        let tree = sample_tree();
        let err = tree.resolve("Busan Haeundae-gu 1").unwrap_err();
        assert_eq!(err, RegionError::NoMatch("Busan Haeundae-gu 1".to_string()));

        // Top-level names must be a prefix, not merely contained
        assert!(tree.resolve("Near Daejeon Yuseong-gu").is_err());
    }

    #[test]
    fn test_never_returns_sibling_of_matched_root() {
        let tree = sample_tree();
        // "Yuseong-gu Annex" lives under Seoul and must not be picked for a Daejeon address
        let region = tree
            .resolve("Daejeon Yuseong-gu Annex Deokjin-dong 7")
            .unwrap();
        assert_eq!(region.parent, Some(1));
        assert_eq!(region.id, 10);

        for address in [
            "Daejeon Seo-gu 1",
            "Daejeon Yuseong-gu 2",
            "Daejeon 3",
            "Seoul Gangnam-gu 4",
        ] {
            let root = tree.roots().find(|r| address.starts_with(&r.name)).unwrap();
            let region = tree.resolve(address).unwrap();
            assert!(region.id == root.id || region.parent == Some(root.id));
        }
    }

    #[test]
    fn test_longest_match_wins_between_overlapping_siblings() {
        let tree = RegionTree::build(vec![
            RegionRecord::new(1, None, "Gyeonggi"),
            RegionRecord::new(2, None, "Gyeonggi-do"),
            RegionRecord::new(10, Some(2), "Jung-gu"),
            RegionRecord::new(11, Some(2), "Seongnam Jung-gu"),
        ])
        .unwrap();

        let region = tree.resolve("Gyeonggi-do Seongnam Jung-gu 9").unwrap();
        assert_eq!(region.id, 11);

        let region = tree.resolve("Gyeonggi-do Suwon 1").unwrap();
        assert_eq!(region.id, 2);
    }

    #[test]
    fn test_equal_length_matches_keep_load_order() {
        let tree = RegionTree::build(vec![
            RegionRecord::new(1, None, "Ulsan"),
            RegionRecord::new(10, Some(1), "Dong-gu"),
            RegionRecord::new(11, Some(1), "Nam-gu"),
        ])
        .unwrap();

        let region = tree.resolve("Ulsan Nam-gu Dong-gu-ro 5").unwrap();
        assert_eq!(region.id, 10);
    }

    #[test]
    fn test_multibyte_names() {
        let tree = RegionTree::build(vec![
            RegionRecord::new(1, None, "대전광역시"),
            RegionRecord::new(10, Some(1), "유성구"),
        ])
        .unwrap();

        let region = tree.resolve("대전광역시 유성구 덕진동 123").unwrap();
        assert_eq!(region.id, 10);
    }

    #[test]
    fn test_levels_are_derived() {
        let tree = sample_tree();
        assert_eq!(tree.get(1).unwrap().level, 1);
        assert_eq!(tree.get(10).unwrap().level, 2);
        assert_eq!(tree.get(100).unwrap().level, 3);
        assert_eq!(tree.children(1).count(), 2);
    }

    #[test]
    fn test_build_rejects_invalid_trees() {
        assert_eq!(
            RegionTree::build(vec![RegionRecord::new(10, Some(1), "Orphan-gu")]).unwrap_err(),
            RegionError::DanglingParent { id: 10, parent: 1 }
        );
        assert_eq!(
            RegionTree::build(vec![
                RegionRecord::new(1, None, "Daejeon"),
                RegionRecord::new(1, None, "Seoul"),
            ])
            .unwrap_err(),
            RegionError::DuplicateId(1)
        );
        assert!(matches!(
            RegionTree::build(vec![
                RegionRecord::new(1, Some(2), "Loop-a"),
                RegionRecord::new(2, Some(1), "Loop-b"),
            ])
            .unwrap_err(),
            RegionError::Cycle(_)
        ));
        assert_eq!(
            RegionTree::build(vec![RegionRecord::new(1, None, "  ")]).unwrap_err(),
            RegionError::EmptyName { id: 1 }
        );
    }

    #[test]
    fn test_reload_swaps_tree_and_keeps_old_on_error() {
        let resolver =
            RegionResolver::from_records(vec![RegionRecord::new(1, None, "Daejeon")]).unwrap();
        let before = resolver.snapshot();

        assert!(resolver
            .reload(vec![RegionRecord::new(5, Some(9), "Broken")])
            .is_err());
        assert_eq!(resolver.resolve("Daejeon 1").unwrap().id, 1);

        let count = resolver
            .reload(vec![
                RegionRecord::new(1, None, "Daejeon"),
                RegionRecord::new(10, Some(1), "Yuseong-gu"),
            ])
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(resolver.resolve("Daejeon Yuseong-gu").unwrap().id, 10);

        // Earlier snapshots are unaffected
        assert_eq!(before.resolve("Daejeon Yuseong-gu").unwrap().id, 1);
    }
}
