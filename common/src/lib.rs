#[cfg(feature = "cli")]
mod permission_mode_cli_arg;

#[cfg(feature = "elapsed")]
pub mod elapsed;

#[cfg(feature = "cli")]
pub use permission_mode_cli_arg::PermissionModeCliArg;
