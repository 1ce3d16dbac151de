use admission_policy_controller_k8s_api::{ApiResource, GroupVersionKind};

/// Maps a parameter kind to a concrete, watchable resource.
pub trait ResolveParamKind: Send + Sync + 'static {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource, ResolveError>;
}

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum ResolveError {
    #[error("no resource found for {group}/{version}, Kind={kind}")]
    NotFound {
        group: String,
        version: String,
        kind: String,
    },

    #[error("resource discovery is not available")]
    Unavailable,
}

impl ResolveError {
    pub fn not_found(gvk: &GroupVersionKind) -> Self {
        Self::NotFound {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
        }
    }
}
