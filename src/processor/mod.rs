pub mod alert_dispatcher;
pub mod retry_sweep;
