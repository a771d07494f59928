pub(crate) mod sse;
pub(crate) mod task;
