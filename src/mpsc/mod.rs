mod growable;

pub use growable::GrowableQueue;
