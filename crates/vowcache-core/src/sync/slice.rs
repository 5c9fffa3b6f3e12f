use crate::error::Error;

/// Where a slice is in its mutation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// `value` reflects the last known authoritative state.
    #[default]
    Idle,
    /// At least one optimistic mutation has not been persisted yet.
    Pending,
    /// Reloading authoritative state to replace `value`.
    Reconciling,
}

/// The state a UI screen renders for one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticSlice<T> {
    /// Optimistic view; may run ahead of the record store while loading.
    pub value: T,
    pub is_loading: bool,
    /// Last failure, kept until the next mutation or `clear_error`.
    pub error: Option<Error>,
    pub phase: SyncPhase,
}

impl<T> OptimisticSlice<T> {
    /// Initial state before the first authoritative load.
    pub fn loading(value: T) -> Self {
        Self {
            value,
            is_loading: true,
            error: None,
            phase: SyncPhase::Reconciling,
        }
    }

    /// Neither pending nor reconciling.
    pub fn is_settled(&self) -> bool {
        !self.is_loading
    }
}
