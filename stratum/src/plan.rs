/// Which subset of the pending or applied migrations an operation should touch.
///
/// `steps` caps the number of migrations (0 means no cap) and `versions` restricts the selection
/// to the listed keys (empty means any). Both constraints apply together.
///
/// ```
/// use stratum::Plan;
///
/// let plan = Plan::all().with_steps(2).with_versions([1596897167, 1596897188]);
/// assert_eq!(plan.steps, 2);
/// assert!(plan.allows(1596897188));
/// assert!(!plan.allows(1597897177));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub steps: usize,
    pub versions: Vec<u64>,
}

impl Plan {
    /// No step cap and no version filter.
    pub fn all() -> Self {
        Self::default()
    }

    /// At most `steps` migrations.
    pub fn steps(steps: usize) -> Self {
        Self::all().with_steps(steps)
    }

    /// Only the migrations with the given keys.
    pub fn versions(versions: impl IntoIterator<Item = u64>) -> Self {
        Self::all().with_versions(versions)
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_versions(mut self, versions: impl IntoIterator<Item = u64>) -> Self {
        self.versions.extend(versions);
        self
    }

    /// Whether the version filter lets `key` through.
    pub fn allows(&self, key: u64) -> bool {
        self.versions.is_empty() || self.versions.contains(&key)
    }

    /// Whether a schedule of length `len` has reached the step cap.
    pub(crate) fn is_full(&self, len: usize) -> bool {
        self.steps > 0 && len >= self.steps
    }
}
