use std::error::Error;

/// Boxed error with send + sync.
pub type BoxedError = Box<dyn Error + Send + Sync>;
