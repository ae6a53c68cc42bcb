pub type TransactionId = String;

lazy_static::lazy_static! {
  pub static ref STARTUP_TID: TransactionId = "Startup".to_string();
  pub static ref TEST_TID: TransactionId = "TestTest".to_string();
  pub static ref DAEMON_TID: TransactionId = "EfimonDaemon".to_string();
  pub static ref SYSTEM_MONITOR_TID: TransactionId = "SystemMonitor".to_string();
  pub static ref WORKER_MONITOR_TID: TransactionId = "WorkerMonitor".to_string();
  pub static ref LAUNCHER_TID: TransactionId = "EfimonLauncher".to_string();
}
