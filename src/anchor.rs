//! Locating mutation anchors inside a filter list.

use crate::ast::FilterNode;

/// Position of an anchor filter: an index into a filter list and, when the
/// anchor sits one level down, the index inside that filter's nested list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorPath {
    pub index: usize,
    pub nested: Option<usize>,
}

impl AnchorPath {
    pub fn get<'a>(&self, filters: &'a [FilterNode]) -> Option<&'a FilterNode> {
        let outer = filters.get(self.index)?;
        match self.nested {
            Some(nested) => outer.filters.get(nested),
            None => Some(outer),
        }
    }

    pub fn get_mut<'a>(&self, filters: &'a mut [FilterNode]) -> Option<&'a mut FilterNode> {
        let outer = filters.get_mut(self.index)?;
        match self.nested {
            Some(nested) => outer.filters.get_mut(nested),
            None => Some(outer),
        }
    }

    /// Detaches the anchor filter from the list it lives in.
    pub fn remove(&self, filters: &mut Vec<FilterNode>) -> Option<FilterNode> {
        match self.nested {
            None if self.index < filters.len() => Some(filters.remove(self.index)),
            None => None,
            Some(nested) => {
                let outer = filters.get_mut(self.index)?;
                if nested < outer.filters.len() {
                    Some(outer.filters.remove(nested))
                } else {
                    None
                }
            }
        }
    }
}

/// Searches each filter of the list, then its direct children, for an anchor
/// on `attribute`. Deeper nesting is not searched.
pub fn find_anchor(filters: &[FilterNode], attribute: &str) -> Option<AnchorPath> {
    for (index, filter) in filters.iter().enumerate() {
        if filter.is_anchor_for(attribute) {
            return Some(AnchorPath { index, nested: None });
        }
        if let Some(nested) = filter.filters.iter().position(|f| f.is_anchor_for(attribute)) {
            return Some(AnchorPath {
                index,
                nested: Some(nested),
            });
        }
    }
    None
}
