/// Quiescence timer driven by an external clock reading.
///
/// Each `touch` pushes the deadline out by the quiet period. The owner polls
/// `take_due` and may flush early regardless; `cancel` drops the deadline.
#[derive(Debug, Clone)]
pub struct Debounce {
    quiet_ms: u64,
    deadline: Option<u64>,
}

impl Debounce {
    pub fn new(quiet_ms: u64) -> Self {
        Self {
            quiet_ms,
            deadline: None,
        }
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.deadline = Some(now_ms.saturating_add(self.quiet_ms));
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.deadline.is_some_and(|deadline| now_ms >= deadline)
    }

    /// Returns true and disarms if the deadline has passed.
    pub fn take_due(&mut self, now_ms: u64) -> bool {
        if self.is_due(now_ms) {
            self.deadline = None;
            true
        } else {
            false
        }
    }

    /// Returns whether a deadline was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }
}
