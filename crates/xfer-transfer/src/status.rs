//! The transfer lifecycle's linear state DAG (spec §4.8).

/// A transfer's position in its lifecycle.
///
/// States only ever move forward: `Init -> Start -> Running -> (Cancelling
/// -> Cancelled) -> Done`, with `Done` also reachable directly from
/// `Running` once every element finishes naturally. Once `Done`, a transfer
/// is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// Constructed, not yet started.
    Init,
    /// `start()` is linking, setting up, and starting elements.
    Start,
    /// Every element has been started; data may be flowing.
    Running,
    /// A `Cancel` has been accepted and every element's `cancel()` has been
    /// called; elements may still be draining.
    Cancelling,
    /// Every element has been told to cancel; waiting for the remaining
    /// elements to post `Done`.
    Cancelled,
    /// Terminal: every element has posted `Done` (or `start()` gave up
    /// early), and the transfer's own `Done` has been delivered.
    Done,
}

impl TransferStatus {
    /// A total order over the lifecycle, used to implement "wait until at
    /// least this far along" without repeating the DAG's edges at every call
    /// site.
    pub(crate) const fn ordinal(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Start => 1,
            Self::Running => 2,
            Self::Cancelling => 3,
            Self::Cancelled => 4,
            Self::Done => 5,
        }
    }
}
