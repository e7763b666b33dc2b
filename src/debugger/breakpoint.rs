//! Software breakpoint bookkeeping.
//!
//! The table maps a runtime program-counter address to the original
//! instruction bytes the trap overwrote. It is owned by the engine's pinned
//! thread and never shared, so it needs no locking. The memory invariant:
//! an address is a key exactly while the trap byte is planted there.

use crate::debugger::code::TRAP_INSTRUCTION;
use crate::debugger::error::Error;
use log::{debug, warn};
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use std::collections::HashMap;

/// Original instruction bytes displaced by one planted trap.
pub type SavedInstruction = [u8; TRAP_INSTRUCTION.len()];

#[derive(Debug, Default)]
pub struct BreakpointTable {
    saved: HashMap<u64, SavedInstruction>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant a trap at `addr`, remembering the displaced byte. Re-arming an
    /// already-armed address is a no-op: the originally saved byte must never
    /// be overwritten with the trap byte.
    pub fn arm(&mut self, pid: Pid, addr: u64) -> Result<(), Error> {
        if self.saved.contains_key(&addr) {
            debug!(target: "debugger", "breakpoint at {addr:#x} already armed");
            return Ok(());
        }
        let original = read_byte(pid, addr).map_err(|e| Error::MemoryReadFailed(addr, e))?;
        write_byte(pid, addr, TRAP_INSTRUCTION[0])
            .map_err(|e| Error::MemoryWriteFailed(addr, e))?;
        self.saved.insert(addr, [original]);
        Ok(())
    }

    /// Restore the original byte at `addr` and forget the entry.
    pub fn disarm(&mut self, pid: Pid, addr: u64) -> Result<(), Error> {
        let saved = *self.saved.get(&addr).ok_or(Error::NotArmed(addr))?;
        write_byte(pid, addr, saved[0]).map_err(|e| Error::MemoryWriteFailed(addr, e))?;
        self.saved.remove(&addr);
        Ok(())
    }

    /// Restore every armed address. Used on engine teardown so a detached
    /// target does not trip over leftover trap bytes.
    pub fn disarm_all(&mut self, pid: Pid) {
        for (addr, saved) in self.saved.drain() {
            if let Err(e) = write_byte(pid, addr, saved[0]) {
                warn!(target: "debugger", "failed to restore byte at {addr:#x}: {e}");
            }
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.saved.contains_key(&addr)
    }

    pub fn saved_bytes(&self, addr: u64) -> Option<SavedInstruction> {
        self.saved.get(&addr).copied()
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

/// Read one byte of target memory. ptrace reads are word-sized, the byte is
/// the word's low octet.
fn read_byte(pid: Pid, addr: u64) -> nix::Result<u8> {
    let word = sys::ptrace::read(pid, addr as *mut c_void)?;
    Ok((word & 0xff) as u8)
}

/// Write one byte of target memory, preserving the rest of the word.
fn write_byte(pid: Pid, addr: u64, byte: u8) -> nix::Result<()> {
    let word = sys::ptrace::read(pid, addr as *mut c_void)? as u64;
    let patched = (word & !0xff) | byte as u64;
    unsafe { sys::ptrace::write(pid, addr as *mut c_void, patched as *mut c_void) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_word_patch_preserves_high_bytes() {
        let word: u64 = 0x1122_3344_5566_7788;
        let patched = (word & !0xff) | TRAP_INSTRUCTION[0] as u64;
        assert_eq!(patched, 0x1122_3344_5566_77CC);
        let restored = (patched & !0xff) | 0x88;
        assert_eq!(restored, word);
    }
}
