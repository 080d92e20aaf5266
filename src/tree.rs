use crate::types::SidebarNode;

/// A sidebar item as read from the page, before nesting is known.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatItem {
    pub label: String,
    pub level: u32,
    pub expanded: bool,
    pub checked: bool,
}

impl FlatItem {
    pub fn new(label: impl Into<String>, level: u32) -> Self {
        Self {
            label: label.into(),
            level,
            expanded: false,
            checked: false,
        }
    }
}

/// Rebuilds the sidebar tree from a preorder list of level-annotated items.
///
/// The stack holds the open ancestor chain. An item at level `L` closes every
/// entry at level `>= L`, then becomes a child of whatever is left on top (or a
/// root). Inconsistent levels degrade to siblings; nothing is ever dropped.
pub fn build_tree(items: impl IntoIterator<Item = FlatItem>) -> Vec<SidebarNode> {
    let mut roots: Vec<SidebarNode> = Vec::new();
    let mut stack: Vec<(u32, SidebarNode)> = Vec::new();

    for item in items {
        while stack.last().is_some_and(|(level, _)| *level >= item.level) {
            close_top(&mut stack, &mut roots);
        }
        let node = SidebarNode {
            label: item.label,
            expanded: item.expanded,
            checked: item.checked,
            sub_items: Vec::new(),
        };
        stack.push((item.level, node));
    }

    while !stack.is_empty() {
        close_top(&mut stack, &mut roots);
    }
    roots
}

// Nodes are owned by the stack while open and moved into their parent when closed,
// which keeps document order since children close before their parent does.
fn close_top(stack: &mut Vec<(u32, SidebarNode)>, roots: &mut Vec<SidebarNode>) {
    if let Some((_, node)) = stack.pop() {
        match stack.last_mut() {
            Some((_, parent)) => parent.sub_items.push(node),
            None => roots.push(node),
        }
    }
}
