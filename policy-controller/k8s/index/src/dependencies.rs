use admission_policy_controller_core::ResourceId;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};

/// Maps each definition to the bindings that target it.
///
/// Every definition key has at least one binding; a definition's entry is
/// removed with its last binding. The definition a binding targets is read
/// from the binding itself, so this is the only direction that needs indexing.
#[derive(Debug, Default)]
pub(crate) struct DependencyIndex {
    bindings: HashMap<ResourceId, HashSet<ResourceId>>,
}

impl DependencyIndex {
    pub(crate) fn insert(&mut self, definition: ResourceId, binding: ResourceId) {
        self.bindings.entry(definition).or_default().insert(binding);
    }

    pub(crate) fn remove(&mut self, definition: &ResourceId, binding: &ResourceId) {
        if let Some(bindings) = self.bindings.get_mut(definition) {
            bindings.remove(binding);
            if bindings.is_empty() {
                self.bindings.remove(definition);
            }
        }
    }

    /// Returns the bindings that target `definition`, in no particular order.
    pub(crate) fn bindings<'i>(
        &'i self,
        definition: &ResourceId,
    ) -> impl Iterator<Item = &'i ResourceId> + 'i {
        self.bindings.get(definition).into_iter().flatten()
    }

    /// Returns the bindings that target `definition`, sorted by identity.
    pub(crate) fn sorted_bindings(&self, definition: &ResourceId) -> Vec<ResourceId> {
        let mut bindings = self.bindings(definition).cloned().collect::<Vec<_>>();
        bindings.sort();
        bindings
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ResourceId, &HashSet<ResourceId>)> {
        self.bindings.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_empty_entries() {
        let mut index = DependencyIndex::default();
        let policy = ResourceId::cluster("policy-a");
        index.insert(policy.clone(), ResourceId::cluster("binding-1"));
        index.insert(policy.clone(), ResourceId::cluster("binding-2"));

        index.remove(&policy, &ResourceId::cluster("binding-1"));
        assert_eq!(
            index.sorted_bindings(&policy),
            vec![ResourceId::cluster("binding-2")]
        );

        index.remove(&policy, &ResourceId::cluster("binding-2"));
        assert_eq!(index.bindings(&policy).count(), 0);
        assert_eq!(index.iter().count(), 0);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut index = DependencyIndex::default();
        index.remove(
            &ResourceId::cluster("policy-a"),
            &ResourceId::cluster("binding-1"),
        );
        assert_eq!(index.iter().count(), 0);
    }

    #[test]
    fn sorts_bindings() {
        let mut index = DependencyIndex::default();
        let policy = ResourceId::cluster("policy-a");
        for name in ["c", "a", "b"] {
            index.insert(policy.clone(), ResourceId::cluster(name));
        }
        assert_eq!(
            index.sorted_bindings(&policy),
            vec![
                ResourceId::cluster("a"),
                ResourceId::cluster("b"),
                ResourceId::cluster("c"),
            ]
        );
    }
}
