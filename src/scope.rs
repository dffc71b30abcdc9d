use super::ir::SlotId;
use std::collections::HashMap;

/// Names visible in the function being lowered, each mapped to its stack slot.
///
/// Every `bind` is recorded in an undo log; `unwind` to an earlier `mark` restores
/// shadowed bindings and forgets names that were not bound before.
#[derive(Debug, Default)]
pub(crate) struct ScopeMap {
    live: HashMap<String, SlotId>,
    undo: Vec<(String, Option<SlotId>)>,
}

impl ScopeMap {
    pub(crate) fn new() -> Self {
        ScopeMap::default()
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<SlotId> {
        self.live.get(name).copied()
    }

    pub(crate) fn bind(&mut self, name: &str, slot: SlotId) {
        let previous = self.live.insert(name.to_owned(), slot);
        self.undo.push((name.to_owned(), previous));
    }

    pub(crate) fn mark(&self) -> usize {
        self.undo.len()
    }

    pub(crate) fn unwind(&mut self, mark: usize) {
        while self.undo.len() > mark {
            if let Some((name, previous)) = self.undo.pop() {
                match previous {
                    Some(slot) => self.live.insert(name, slot),
                    None => self.live.remove(&name),
                };
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.live.clear();
        self.undo.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}
