/// Time-boxed unlocking of restricted applications
///
/// This module provides functionality to:
/// - Record unlock sessions in a durable ledger
/// - Arm a monitoring window that ends each unlock
/// - Re-block applications when their window closes
/// - Gate unlocks behind a local passcode with lockout
/// - Mirror device state to a remote backend and accept remote commands

pub mod clock;
pub mod commands;
pub mod error;
pub mod ledger;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod passcode;
pub mod profiles;
pub mod remote;
pub mod scheduler;
pub mod shield;

pub use clock::{Clock, SystemClock};
pub use commands::{CommandOutcome, PendingNavigation, RemoteCommand};
pub use error::SessionError;
pub use ledger::SessionLedger;
pub use model::AppHandle;
pub use monitor::{ActivityMonitor, MonitorEvent, TimerMonitor};
pub use orchestrator::{SessionOrchestrator, UnlockOutcome};
pub use passcode::{GuardPolicy, GuardState, PasscodeGuard, Validation};
pub use profiles::ProfileStore;
pub use remote::{HttpBackend, RemoteBackend, RemoteMirror};
pub use scheduler::{RetryPolicy, WindowScheduler};
pub use shield::{CommandShield, ShieldHooks};
