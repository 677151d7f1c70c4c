//! Caller permission checks

use crate::protocol::Pid;

/// Privileged capabilities a caller may need
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Volumes, mode, mutes, parameters, suspend
    ModifyAudioSettings,
    RecordAudio,
    Dump,
}

/// Decides whether `pid` holds `permission`
pub trait PermissionPolicy: Send + Sync {
    fn check(&self, pid: Pid, permission: Permission) -> bool;
}

/// Grants everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
    fn check(&self, _pid: Pid, _permission: Permission) -> bool {
        true
    }
}

impl<F> PermissionPolicy for F
where
    F: Fn(Pid, Permission) -> bool + Send + Sync,
{
    fn check(&self, pid: Pid, permission: Permission) -> bool {
        self(pid, permission)
    }
}
