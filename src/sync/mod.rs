mod signal;

pub(crate) use signal::{Signal, YieldNow};
