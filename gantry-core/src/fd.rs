//! File-descriptor table and speculative-I/O bookkeeping.
//!
//! Every registered descriptor is tracked per direction. A direction is
//! `Idle` (no interest), `Spec` (speculative: try the I/O before asking the
//! kernel), `Wait` (registered with the kernel poller) or `Stop` (was
//! `Wait`, removal pending the next update flush).
//!
//! The speculative state saves one syscall on the common path: a freshly
//! accepted connection usually has its first bytes available immediately,
//! and a freshly connected socket is usually writable. Only when the
//! optimistic attempt reports "would block" does the descriptor get
//! registered with the kernel. An FD is never `Spec` and `Wait` in the same
//! direction at once, which bounds the speculative list to half the
//! registered directions.
//!
//! The SPEC list is a contiguous vector of `(fd, dir)` entries with
//! back-references stored in the table for O(1) removal.

use std::os::unix::io::RawFd;

use crate::slots::SlotId;

// ============================================================================
// Directions and States
// ============================================================================

/// I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdDir {
    Read = 0,
    Write = 1,
}

/// Per-direction interest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirState {
    /// No interest.
    #[default]
    Idle,
    /// Interest; attempt the I/O before polling.
    Spec,
    /// Interest; registered with the kernel poller.
    Wait,
    /// Was `Wait`; kernel removal pending.
    Stop,
}

/// Who handles events on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdOwner {
    /// A frontend listening socket (frontend index, listener index).
    Listener(usize, usize),
    /// Client side of a session.
    SessionClient(SlotId),
    /// Server side of a session.
    SessionServer(SlotId),
    /// The admin applet's listening socket.
    AdminListener,
    /// An accepted admin connection.
    Admin(SlotId),
    /// Read end of the signal self-pipe.
    WakePipe,
}

// ============================================================================
// Table
// ============================================================================

#[derive(Debug)]
struct FdEntry {
    owner: FdOwner,
    state: [DirState; 2],
    /// Back-reference into the SPEC list, per direction.
    spec_pos: [Option<u32>; 2],
    /// Interest mask currently installed in the kernel poller.
    kernel_read: bool,
    kernel_write: bool,
    /// Pending kernel update (sits in the update queue).
    update_queued: bool,
}

/// Dense table indexed by raw descriptor.
pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
    spec: Vec<(RawFd, FdDir)>,
    spec_cursor: usize,
    updates: Vec<RawFd>,
    count: usize,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            spec: Vec::new(),
            spec_cursor: 0,
            updates: Vec::new(),
            count: 0,
        }
    }

    /// Number of registered descriptors.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of directions currently in the speculative list.
    #[inline]
    pub fn spec_len(&self) -> usize {
        self.spec.len()
    }

    fn slot(&mut self, fd: RawFd) -> &mut Option<FdEntry> {
        let idx = fd as usize;
        if idx >= self.entries.len() {
            self.entries.resize_with(idx + 1, || None);
        }
        &mut self.entries[idx]
    }

    fn entry_mut(&mut self, fd: RawFd) -> Option<&mut FdEntry> {
        self.entries.get_mut(fd as usize).and_then(|e| e.as_mut())
    }

    fn entry(&self, fd: RawFd) -> Option<&FdEntry> {
        self.entries.get(fd as usize).and_then(|e| e.as_ref())
    }

    /// Install a descriptor with its owner. Both directions start `Idle`.
    pub fn register(&mut self, fd: RawFd, owner: FdOwner) {
        debug_assert!(fd >= 0);
        let slot = self.slot(fd);
        debug_assert!(slot.is_none(), "fd {fd} registered twice");
        *slot = Some(FdEntry {
            owner,
            state: [DirState::Idle; 2],
            spec_pos: [None; 2],
            kernel_read: false,
            kernel_write: false,
            update_queued: false,
        });
        self.count += 1;
    }

    /// Owner of a registered descriptor.
    pub fn owner(&self, fd: RawFd) -> Option<FdOwner> {
        self.entry(fd).map(|e| e.owner)
    }

    /// Rebind a descriptor to a new owner (session hand-offs).
    pub fn set_owner(&mut self, fd: RawFd, owner: FdOwner) {
        if let Some(entry) = self.entry_mut(fd) {
            entry.owner = owner;
        }
    }

    #[inline]
    pub fn state(&self, fd: RawFd, dir: FdDir) -> DirState {
        self.entry(fd)
            .map(|e| e.state[dir as usize])
            .unwrap_or(DirState::Idle)
    }

    fn spec_push(&mut self, fd: RawFd, dir: FdDir) {
        let pos = self.spec.len() as u32;
        self.spec.push((fd, dir));
        if let Some(entry) = self.entry_mut(fd) {
            entry.spec_pos[dir as usize] = Some(pos);
        }
    }

    fn spec_remove(&mut self, fd: RawFd, dir: FdDir) {
        let pos = match self.entry_mut(fd).and_then(|e| e.spec_pos[dir as usize].take()) {
            Some(p) => p as usize,
            None => return,
        };
        self.spec.swap_remove(pos);
        if pos < self.spec.len() {
            let (moved_fd, moved_dir) = self.spec[pos];
            if let Some(entry) = self.entry_mut(moved_fd) {
                entry.spec_pos[moved_dir as usize] = Some(pos as u32);
            }
        }
    }

    fn queue_update(&mut self, fd: RawFd) {
        if let Some(entry) = self.entry_mut(fd) {
            if !entry.update_queued {
                entry.update_queued = true;
                self.updates.push(fd);
            }
        }
    }

    /// Request interest in a direction. Idempotent.
    ///
    /// `Idle` goes speculative; `Stop` re-arms the existing kernel
    /// registration; `Spec`/`Wait` stay as they are.
    pub fn want(&mut self, fd: RawFd, dir: FdDir) {
        let state = match self.entry(fd) {
            Some(e) => e.state[dir as usize],
            None => return,
        };
        match state {
            DirState::Idle => {
                if let Some(entry) = self.entry_mut(fd) {
                    entry.state[dir as usize] = DirState::Spec;
                }
                self.spec_push(fd, dir);
            }
            DirState::Stop => {
                if let Some(entry) = self.entry_mut(fd) {
                    entry.state[dir as usize] = DirState::Wait;
                }
                self.queue_update(fd);
            }
            DirState::Spec | DirState::Wait => {}
        }
    }

    /// Drop interest in a direction. Idempotent.
    pub fn stop(&mut self, fd: RawFd, dir: FdDir) {
        let state = match self.entry(fd) {
            Some(e) => e.state[dir as usize],
            None => return,
        };
        match state {
            DirState::Spec => {
                self.spec_remove(fd, dir);
                if let Some(entry) = self.entry_mut(fd) {
                    entry.state[dir as usize] = DirState::Idle;
                }
            }
            DirState::Wait => {
                if let Some(entry) = self.entry_mut(fd) {
                    entry.state[dir as usize] = DirState::Stop;
                }
                self.queue_update(fd);
            }
            DirState::Idle | DirState::Stop => {}
        }
    }

    /// The optimistic attempt would block: demote `Spec` to `Wait` and
    /// queue the kernel registration.
    pub fn would_block(&mut self, fd: RawFd, dir: FdDir) {
        if self.state(fd, dir) != DirState::Spec {
            return;
        }
        self.spec_remove(fd, dir);
        if let Some(entry) = self.entry_mut(fd) {
            entry.state[dir as usize] = DirState::Wait;
        }
        self.queue_update(fd);
    }

    /// Forget a descriptor entirely. Returns whether a kernel deregistration
    /// is needed (the fd was installed in the kernel set).
    pub fn deregister(&mut self, fd: RawFd) -> bool {
        self.spec_remove(fd, FdDir::Read);
        self.spec_remove(fd, FdDir::Write);
        let entry = match self.entries.get_mut(fd as usize).and_then(|e| e.take()) {
            Some(e) => e,
            None => return false,
        };
        self.count -= 1;
        entry.kernel_read || entry.kernel_write
    }

    /// Snapshot of up to `max` speculative entries, rotated so a long SPEC
    /// list cannot starve its own tail.
    pub fn spec_batch(&mut self, max: usize) -> Vec<(RawFd, FdDir, FdOwner)> {
        let len = self.spec.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self.spec_cursor % len;
        let take = max.min(len);
        let batch: Vec<(RawFd, FdDir, FdOwner)> = (0..take)
            .map(|i| self.spec[(start + i) % len])
            .filter_map(|(fd, dir)| self.owner(fd).map(|o| (fd, dir, o)))
            .collect();
        self.spec_cursor = (start + take) % len;
        batch
    }

    /// Descriptors with directions installed in the kernel set, with their
    /// masks. Used to rebuild a fresh kernel handle after `fork()`.
    pub fn kernel_installed(&self) -> Vec<(RawFd, bool, bool)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(fd, e)| {
                e.as_ref().and_then(|e| {
                    (e.kernel_read || e.kernel_write)
                        .then_some((fd as RawFd, e.kernel_read, e.kernel_write))
                })
            })
            .collect()
    }

    /// Drain queued kernel updates as `(fd, want_read, want_write,
    /// was_read, was_write)` tuples, recording the new installed mask.
    pub fn drain_updates(&mut self) -> Vec<(RawFd, bool, bool, bool, bool)> {
        let fds = std::mem::take(&mut self.updates);
        let mut out = Vec::with_capacity(fds.len());
        for fd in fds {
            let entry = match self.entry_mut(fd) {
                Some(e) => e,
                None => continue,
            };
            entry.update_queued = false;
            let want_read = matches!(entry.state[0], DirState::Wait);
            let want_write = matches!(entry.state[1], DirState::Wait);
            let was_read = entry.kernel_read;
            let was_write = entry.kernel_write;
            if matches!(entry.state[0], DirState::Stop) {
                entry.state[0] = DirState::Idle;
            }
            if matches!(entry.state[1], DirState::Stop) {
                entry.state[1] = DirState::Idle;
            }
            if want_read == was_read && want_write == was_write {
                continue;
            }
            entry.kernel_read = want_read;
            entry.kernel_write = want_write;
            out.push((fd, want_read, want_write, was_read, was_write));
        }
        out
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> FdOwner {
        FdOwner::Listener(0, 0)
    }

    #[test]
    fn test_register_idle() {
        let mut table = FdTable::new();
        table.register(5, owner());
        assert_eq!(table.state(5, FdDir::Read), DirState::Idle);
        assert_eq!(table.state(5, FdDir::Write), DirState::Idle);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_want_goes_speculative() {
        let mut table = FdTable::new();
        table.register(5, owner());
        table.want(5, FdDir::Read);
        assert_eq!(table.state(5, FdDir::Read), DirState::Spec);
        assert_eq!(table.spec_len(), 1);
        // Idempotent.
        table.want(5, FdDir::Read);
        assert_eq!(table.spec_len(), 1);
    }

    #[test]
    fn test_would_block_demotes_to_wait() {
        let mut table = FdTable::new();
        table.register(5, owner());
        table.want(5, FdDir::Read);
        table.would_block(5, FdDir::Read);
        assert_eq!(table.state(5, FdDir::Read), DirState::Wait);
        assert_eq!(table.spec_len(), 0);
        let ups = table.drain_updates();
        assert_eq!(ups, vec![(5, true, false, false, false)]);
    }

    #[test]
    fn test_never_spec_and_wait_same_direction() {
        let mut table = FdTable::new();
        table.register(5, owner());
        table.want(5, FdDir::Read);
        table.would_block(5, FdDir::Read);
        // Requesting interest again must not re-enter Spec.
        table.want(5, FdDir::Read);
        assert_eq!(table.state(5, FdDir::Read), DirState::Wait);
        assert_eq!(table.spec_len(), 0);
    }

    #[test]
    fn test_stop_spec_returns_idle() {
        let mut table = FdTable::new();
        table.register(5, owner());
        table.want(5, FdDir::Write);
        table.stop(5, FdDir::Write);
        assert_eq!(table.state(5, FdDir::Write), DirState::Idle);
        assert_eq!(table.spec_len(), 0);
    }

    #[test]
    fn test_stop_wait_defers_removal() {
        let mut table = FdTable::new();
        table.register(5, owner());
        table.want(5, FdDir::Read);
        table.would_block(5, FdDir::Read);
        table.drain_updates();
        table.stop(5, FdDir::Read);
        assert_eq!(table.state(5, FdDir::Read), DirState::Stop);
        let ups = table.drain_updates();
        assert_eq!(ups, vec![(5, false, false, true, false)]);
        assert_eq!(table.state(5, FdDir::Read), DirState::Idle);
    }

    #[test]
    fn test_stop_then_want_rearms_without_spec() {
        let mut table = FdTable::new();
        table.register(5, owner());
        table.want(5, FdDir::Read);
        table.would_block(5, FdDir::Read);
        table.drain_updates();
        table.stop(5, FdDir::Read);
        table.want(5, FdDir::Read);
        assert_eq!(table.state(5, FdDir::Read), DirState::Wait);
        // Mask unchanged: no kernel call needed.
        assert!(table.drain_updates().is_empty());
    }

    #[test]
    fn test_spec_list_swap_remove_backrefs() {
        let mut table = FdTable::new();
        for fd in 3..7 {
            table.register(fd, owner());
            table.want(fd, FdDir::Read);
        }
        table.would_block(3, FdDir::Read);
        assert_eq!(table.spec_len(), 3);
        // The moved tail entry must still be findable.
        table.would_block(6, FdDir::Read);
        assert_eq!(table.spec_len(), 2);
        let batch = table.spec_batch(16);
        let fds: Vec<RawFd> = batch.iter().map(|(fd, _, _)| *fd).collect();
        assert!(fds.contains(&4) && fds.contains(&5));
    }

    #[test]
    fn test_deregister_clears_everything() {
        let mut table = FdTable::new();
        table.register(5, owner());
        table.want(5, FdDir::Read);
        table.would_block(5, FdDir::Read);
        table.drain_updates();
        assert!(table.deregister(5));
        assert_eq!(table.len(), 0);
        assert_eq!(table.owner(5), None);
        assert!(!table.deregister(5));
    }

    #[test]
    fn test_spec_batch_bounded() {
        let mut table = FdTable::new();
        for fd in 0..40 {
            table.register(fd, owner());
            table.want(fd, FdDir::Read);
        }
        assert_eq!(table.spec_batch(25).len(), 25);
    }
}
