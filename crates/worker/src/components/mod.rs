pub(crate) mod log_pump;
pub(crate) mod panic_capture;
pub(crate) mod task_execution;
pub(crate) mod upstream_sync;
