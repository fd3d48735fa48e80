pub mod mpsc;

pub use mpsc::GrowableQueue;

/// Common interface for all MPSC queues.
pub trait MpscQueue<T: Send>: Send + Sync + 'static {
    /// Error on push when the queue is full.
    type PushError;
    /// Error on pop when the queue is empty.
    type PopError;

    fn push(&self, item: T) -> Result<(), Self::PushError>;
    fn pop(&self) -> Result<T, Self::PopError>;

    /// True when the queue currently looks drained. Best-effort under
    /// concurrent pushes; exact only in quiescence.
    fn is_empty(&self) -> bool;
    /// True when a subsequent `push` would likely report capacity exceeded.
    fn is_full(&self) -> bool;
}
