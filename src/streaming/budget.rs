//! Memory budget management for the resident set
//!
//! Tracks bytes held by resident bricks and bytes reserved by loads in
//! flight. Provides pressure metrics to guide eviction and admission.

/// Memory budget for GPU-resident bricks
#[derive(Clone, Debug)]
pub struct BrickBudget {
    /// Maximum bytes allowed
    budget_bytes: u64,
    /// Bytes held by Resident and Stale bricks
    used_bytes: u64,
    /// Bytes reserved by bricks in Loading
    pending_bytes: u64,
}

impl BrickBudget {
    /// Create a new budget
    ///
    /// # Arguments
    /// * `budget_bytes` - Maximum GPU memory in bytes
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            used_bytes: 0,
            pending_bytes: 0,
        }
    }

    /// Change the limit; current usage is kept
    pub fn set_budget(&mut self, budget_bytes: u64) {
        self.budget_bytes = budget_bytes;
    }

    // --- Tracking methods ---

    /// Reserve bytes for a load that was just admitted
    pub fn reserve(&mut self, bytes: u64) {
        self.pending_bytes = self.pending_bytes.saturating_add(bytes);
    }

    /// Drop a reservation without committing it
    pub fn release_reservation(&mut self, bytes: u64) {
        self.pending_bytes = self.pending_bytes.saturating_sub(bytes);
    }

    /// Turn a reservation into resident usage
    ///
    /// # Arguments
    /// * `reserved` - Bytes reserved at admission
    /// * `actual` - Bytes the uploaded texture occupies
    pub fn commit(&mut self, reserved: u64, actual: u64) {
        self.release_reservation(reserved);
        self.used_bytes = self.used_bytes.saturating_add(actual);
    }

    /// Remove resident usage after an eviction
    pub fn free(&mut self, bytes: u64) {
        self.used_bytes = self.used_bytes.saturating_sub(bytes);
    }

    // --- Query methods ---

    pub fn budget(&self) -> u64 {
        self.budget_bytes
    }

    pub fn used(&self) -> u64 {
        self.used_bytes
    }

    pub fn pending(&self) -> u64 {
        self.pending_bytes
    }

    /// Used plus pending
    pub fn committed(&self) -> u64 {
        self.used_bytes.saturating_add(self.pending_bytes)
    }

    /// Bytes still free after used and pending
    pub fn available(&self) -> u64 {
        self.budget_bytes.saturating_sub(self.committed())
    }

    /// Get memory pressure (0.0 to 1.0+)
    ///
    /// Values above 1.0 indicate over-budget.
    pub fn pressure(&self) -> f32 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        self.committed() as f32 / self.budget_bytes as f32
    }

    // --- Decision methods ---

    /// True while used + pending exceeds the budget
    pub fn over_budget(&self) -> bool {
        self.committed() > self.budget_bytes
    }

    /// Check if a brick of `bytes` can be admitted
    pub fn can_load(&self, bytes: u64) -> bool {
        self.available() >= bytes
    }
}
