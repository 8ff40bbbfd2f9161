/*!
Process table: an insertion-ordered collection of descriptors.

Table order is the scheduling queue: "next ready" is the first READY
descriptor in order, and the scheduler rotates a preempted or blocked
process to the tail. Removal preserves the relative order of survivors.

PIDs are allocated monotonically over the live set (0 for an empty table,
otherwise one past the highest live PID), so a PID is never reused while
the table is non-empty even after rotations have reordered it.
*/

use super::process::{Pid, Process};

#[derive(Debug, Default)]
pub struct ProcessTable {
    procs: Vec<Process>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.procs.iter()
    }

    /// Next PID to hand out.
    pub fn alloc_pid(&self) -> Pid {
        self.procs.iter().map(|p| p.pid() + 1).max().unwrap_or(0)
    }

    /// Create a descriptor with a fresh PID, append it, return the PID.
    pub fn create(&mut self, name: &str) -> Pid {
        let pid = self.alloc_pid();
        self.procs.push(Process::new(pid, name));
        pid
    }

    #[inline]
    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.iter().any(|p| p.pid() == pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.iter().find(|p| p.pid() == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.iter_mut().find(|p| p.pid() == pid)
    }

    /// Remove a descriptor, keeping survivors in order.
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        let idx = self.procs.iter().position(|p| p.pid() == pid)?;
        Some(self.procs.remove(idx))
    }

    /// First READY descriptor in table order.
    pub fn first_ready(&self) -> Option<Pid> {
        self.procs.iter().find(|p| p.is_ready()).map(|p| p.pid())
    }

    /// Move a descriptor to the tail of the table (remove + append).
    /// Returns false when the PID is absent.
    pub fn rotate_to_tail(&mut self, pid: Pid) -> bool {
        match self.remove(pid) {
            Some(p) => {
                self.procs.push(p);
                true
            }
            None => false,
        }
    }

    /// PIDs of every blocked descriptor, in table order. Snapshot for the
    /// pendency sweep, which mutates the table while consulting devices.
    pub fn blocked_pids(&self) -> Vec<Pid> {
        self.procs
            .iter()
            .filter(|p| p.is_blocked())
            .map(|p| p.pid())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::{BlockReason, ProcessState};
    use proptest::prelude::*;

    #[test]
    fn pids_are_dense_then_monotone() {
        let mut t = ProcessTable::new();
        assert_eq!(t.create("a"), 0);
        assert_eq!(t.create("b"), 1);
        assert_eq!(t.create("c"), 2);
        t.remove(1);
        // 1 is gone but 2 is still live: next must be 3, never 1 again.
        assert_eq!(t.create("d"), 3);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn empty_table_restarts_at_zero() {
        let mut t = ProcessTable::new();
        t.create("a");
        t.remove(0);
        assert!(t.is_empty());
        assert_eq!(t.create("b"), 0);
    }

    #[test]
    fn removal_preserves_order() {
        let mut t = ProcessTable::new();
        t.create("a");
        t.create("b");
        t.create("c");
        t.remove(1);
        let pids: Vec<_> = t.iter().map(|p| p.pid()).collect();
        assert_eq!(pids, vec![0, 2]);
    }

    #[test]
    fn first_ready_respects_order_and_state() {
        let mut t = ProcessTable::new();
        t.create("a");
        t.create("b");
        t.get_mut(0).unwrap().block(BlockReason::IoRead);
        assert_eq!(t.first_ready(), Some(1));
        t.get_mut(1).unwrap().state = ProcessState::Running;
        assert_eq!(t.first_ready(), None);
        t.get_mut(0).unwrap().unblock();
        assert_eq!(t.first_ready(), Some(0));
    }

    #[test]
    fn rotate_moves_to_tail() {
        let mut t = ProcessTable::new();
        t.create("a");
        t.create("b");
        t.create("c");
        assert!(t.rotate_to_tail(0));
        let pids: Vec<_> = t.iter().map(|p| p.pid()).collect();
        assert_eq!(pids, vec![1, 2, 0]);
        assert!(!t.rotate_to_tail(99));
    }

    proptest! {
        // Rotating any live pid keeps the survivor set identical and
        // preserves the relative order of everything else.
        #[test]
        fn rotation_preserves_relative_order(n in 1usize..8, pick in 0usize..8) {
            let mut t = ProcessTable::new();
            for i in 0..n {
                t.create(&format!("p{i}"));
            }
            let pid = (pick % n) as Pid;
            let before: Vec<_> = t.iter().map(|p| p.pid()).filter(|&p| p != pid).collect();
            prop_assert!(t.rotate_to_tail(pid));
            let after: Vec<_> = t.iter().map(|p| p.pid()).collect();
            prop_assert_eq!(after.len(), n);
            prop_assert_eq!(&after[..n - 1], &before[..]);
            prop_assert_eq!(after[n - 1], pid);
        }

        // Allocation never collides with a live pid, whatever the order of
        // prior removals.
        #[test]
        fn alloc_never_collides(removals in proptest::collection::vec(0i32..10, 0..10)) {
            let mut t = ProcessTable::new();
            for i in 0..5 {
                t.create(&format!("p{i}"));
            }
            for pid in removals {
                t.remove(pid);
                let fresh = t.create("fresh");
                let count = t.iter().filter(|p| p.pid() == fresh).count();
                prop_assert_eq!(count, 1);
            }
        }
    }
}
