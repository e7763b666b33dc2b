#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- target setup ----------------------------------------------
    #[error("target rejected: {0}")]
    TargetRejected(String),
    #[error("failed to launch target: {0}")]
    LaunchFailed(#[source] std::io::Error),
    #[error("failed to attach to target: {0}")]
    AttachFailed(#[source] nix::Error),
    #[error("failed to set trace options: {0}")]
    OptionsFailed(#[source] nix::Error),
    #[error("debug information unavailable: {0}")]
    DebugInfoUnavailable(#[source] Box<Error>),

    // --------------------------------- debug info queries ----------------------------------------
    #[error("symbol `{0}` not found (symbol table stripped?)")]
    SymbolMissing(String),
    #[error("no instruction address is mapped to {0}:{1}")]
    LineUnmapped(String, u64),

    // --------------------------------- breakpoints and memory ------------------------------------
    #[error("breakpoint at {0:#x} is not armed")]
    NotArmed(u64),
    #[error("failed to read target memory at {0:#x}: {1}")]
    MemoryReadFailed(u64, #[source] nix::Error),
    #[error("failed to write target memory at {0:#x}: {1}")]
    MemoryWriteFailed(u64, #[source] nix::Error),

    // --------------------------------- syscalls --------------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(#[source] nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, #[source] nix::Error),

    // --------------------------------- generic ---------------------------------------------------
    #[error("debug session is not started")]
    NotStarted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, ": {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}
