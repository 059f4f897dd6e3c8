use ahash::AHashMap;
use std::collections::VecDeque;

use super::SignatureKey;

/// Narrow keys remembered per relaxation group.
pub const HISTORY_LIMIT: usize = 16;

#[derive(Debug, Default)]
struct RelaxationGroup {
    history: VecDeque<SignatureKey>,
    relaxed: Option<SignatureKey>,
}

/// Decides when a miss should be traced with a widened key.
///
/// Keys fall into the same group when they differ only in dimension sizes.
/// Once a group has seen `threshold` distinct keys, new misses in that group
/// are traced with the most specific key covering all of them. A group's
/// relaxed key only ever widens.
#[derive(Debug)]
pub struct RelaxationState {
    threshold: usize,
    groups: Vec<RelaxationGroup>,
    index: AHashMap<SignatureKey, usize>,
}

impl RelaxationState {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            groups: Vec::new(),
            index: AHashMap::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn group(&self, key: &SignatureKey) -> Option<&RelaxationGroup> {
        self.index
            .get(&key.erased())
            .and_then(|&idx| self.groups.get(idx))
    }

    /// The relaxed key already covering `key`, if any.
    pub fn covering_key(&self, key: &SignatureKey) -> Option<SignatureKey> {
        self.group(key)
            .and_then(|group| group.relaxed.as_ref())
            .filter(|relaxed| key.is_subtype_of(relaxed))
            .cloned()
    }

    /// Key to trace for a miss on `key`, or `None` to trace `key` itself.
    pub fn consider(&self, key: &SignatureKey) -> Option<SignatureKey> {
        let group = self.group(key);
        let seen = group.map_or(0, |g| g.history.iter().filter(|k| *k != key).count());
        if seen + 1 < self.threshold {
            return None;
        }

        let mut widened = key.clone();
        if let Some(group) = group {
            let start = group.relaxed.iter().chain(group.history.iter());
            for other in start {
                widened = widened.most_specific_common_supertype(other)?;
            }
        }
        (widened != *key).then_some(widened)
    }

    /// Records a successful trace of `key` under `traced`.
    pub fn record(&mut self, key: SignatureKey, traced: &SignatureKey) {
        let erased = key.erased();
        let idx = match self.index.get(&erased) {
            Some(&idx) => idx,
            None => {
                self.groups.push(RelaxationGroup::default());
                let idx = self.groups.len() - 1;
                self.index.insert(erased, idx);
                idx
            }
        };
        let group = &mut self.groups[idx];

        if traced != &key {
            let widens = group
                .relaxed
                .as_ref()
                .is_none_or(|current| current.is_subtype_of(traced));
            if widens {
                group.relaxed = Some(traced.clone());
            }
        }
        if !group.history.contains(&key) {
            if group.history.len() == HISTORY_LIMIT {
                group.history.pop_front();
            }
            group.history.push_back(key);
        }
    }

    pub fn relaxed_keys(&self) -> Vec<SignatureKey> {
        self.groups
            .iter()
            .filter_map(|g| g.relaxed.clone())
            .collect()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl Default for RelaxationState {
    fn default() -> Self {
        Self::new(2)
    }
}
