use clap::ValueEnum;
use listener_core::mode::PermissionMode;

/// `--permission-mode` as it arrives on the command line, kept distinct
/// from [`PermissionMode`] so clap's `ValueEnum` derive stays in `common`
/// rather than leaking a CLI dependency into `listener-core`.
#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum PermissionModeCliArg {
    /// Ask for anything not already covered by a rule.
    Default,
    /// Auto-approve file edits; everything else still asks.
    AcceptEdits,
    /// Read-only tools and edits confined to the plan file are auto-approved.
    Plan,
    /// Every tool call is auto-approved.
    BypassPermissions,
}

impl From<PermissionModeCliArg> for PermissionMode {
    fn from(arg: PermissionModeCliArg) -> Self {
        match arg {
            PermissionModeCliArg::Default => PermissionMode::Default,
            PermissionModeCliArg::AcceptEdits => PermissionMode::AcceptEdits,
            PermissionModeCliArg::Plan => PermissionMode::Plan,
            PermissionModeCliArg::BypassPermissions => PermissionMode::BypassPermissions,
        }
    }
}
