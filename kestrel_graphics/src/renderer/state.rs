use crate::{handle::Handle, vulkan::types::ResourceState};

pub(crate) const STATE_TRANSLATION_MAX: usize = 64;

pub(crate) struct ResolvedTranslation {
    pub(crate) handle: Handle,
    pub(crate) old_state: ResourceState,
    pub(crate) new_state: ResourceState,
}

/// Bounded list of per-frame state transitions. Repeated requests for the
/// same handle collapse so translation emits at most one barrier per handle,
/// from the state it had when first scheduled to the latest requested state.
#[derive(Default)]
pub(crate) struct PendingTranslations {
    entries: Vec<(Handle, ResourceState)>,
}

impl PendingTranslations {
    pub(crate) fn add(&mut self, handle: Handle, new_state: ResourceState) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(h, _)| *h == handle) {
            entry.1 = new_state;
            return true;
        }
        if self.entries.len() >= STATE_TRANSLATION_MAX {
            return false;
        }

        self.entries.push((handle, new_state));
        true
    }

    /// Resolves pending entries against current states and clears the list.
    /// Handles that vanished or already hold the requested state drop out.
    pub(crate) fn resolve(
        &mut self,
        current_state: impl Fn(Handle) -> Option<ResourceState>,
    ) -> Vec<ResolvedTranslation> {
        let resolved = self
            .entries
            .drain(..)
            .filter_map(|(handle, new_state)| {
                let old_state = current_state(handle)?;
                (old_state != new_state).then_some(ResolvedTranslation {
                    handle,
                    old_state,
                    new_state,
                })
            })
            .collect();

        resolved
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandlePool;

    #[test]
    fn duplicate_translations_collapse_to_latest() {
        let mut pool = HandlePool::new(4);
        let handle = pool.allocate(ResourceState::Undefined);

        let mut pending = PendingTranslations::default();
        pending.add(handle, ResourceState::TransferDst);
        pending.add(handle, ResourceState::ShaderRead);

        let resolved = pending.resolve(|h| pool.get(h).copied());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].old_state, ResourceState::Undefined);
        assert_eq!(resolved[0].new_state, ResourceState::ShaderRead);
        assert!(pending.is_empty());
    }

    #[test]
    fn noop_translation_is_dropped() {
        let mut pool = HandlePool::new(4);
        let handle = pool.allocate(ResourceState::ShaderRead);

        let mut pending = PendingTranslations::default();
        pending.add(handle, ResourceState::TransferDst);
        pending.add(handle, ResourceState::ShaderRead);

        assert!(pending.resolve(|h| pool.get(h).copied()).is_empty());
    }

    #[test]
    fn stale_handles_are_skipped() {
        let mut pool = HandlePool::new(4);
        let handle = pool.allocate(ResourceState::Undefined);

        let mut pending = PendingTranslations::default();
        pending.add(handle, ResourceState::ShaderRead);
        pool.free(handle);

        assert!(pending.resolve(|h| pool.get(h).copied()).is_empty());
    }

    #[test]
    fn list_is_bounded() {
        let mut pool = HandlePool::new(STATE_TRANSLATION_MAX + 1);
        let mut pending = PendingTranslations::default();

        let mut handles = Vec::new();
        for _ in 0..STATE_TRANSLATION_MAX {
            let handle = pool.allocate(ResourceState::Undefined);
            assert!(pending.add(handle, ResourceState::ShaderRead));
            handles.push(handle);
        }

        let overflow = pool.allocate(ResourceState::Undefined);
        assert!(!pending.add(overflow, ResourceState::ShaderRead));
        // Updating an existing entry still works at capacity.
        assert!(pending.add(handles[0], ResourceState::TransferSrc));
    }
}
