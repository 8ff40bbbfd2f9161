//! End-to-end kernel scenarios: a full machine booting assembled programs.
//!
//! Programs are preloaded into the kernel's registry, so nothing here
//! touches the filesystem (a spawn of an unregistered name exercises the
//! missing-executable path).

use proptest::prelude::*;

use crate::clock::Clock;
use crate::console::Console;
use crate::isa::{OP_JMP, OP_LOADI, OP_TAX, OP_TRAP};
use crate::kernel::process::BlockReason;
use crate::kernel::syscall::{SYS_EXIT, SYS_READ, SYS_SPAWN, SYS_WAIT, SYS_WRITE};
use crate::kernel::{INIT_PROGRAM, Kernel, ProcessState};
use crate::machine::{Hardware, Machine, MachineConfig, StopReason};
use crate::memory::{Memory, Word};
use crate::mmu::{Mmu, PAGE_SIZE};
use crate::program::Program;
use crate::test_utils::{Asm, exit_immediately, loop_forever};

const BUDGET: u64 = 50_000;

fn machine_with(programs: &[(&str, Program)]) -> Machine {
    machine_with_config(programs, MachineConfig::default())
}

fn machine_with_config(programs: &[(&str, Program)], config: MachineConfig) -> Machine {
    let mut m = Machine::new(config);
    for (name, p) in programs {
        m.register_program(*name, p.clone());
    }
    m
}

/// Spawn `name`, leaving the child PID in A.
fn emit_spawn(a: &mut Asm, name: &str) {
    let hole = a.here() + 1;
    a.opa(OP_LOADI, 0); // patched below: address of the name string
    a.op(OP_TAX);
    a.opa(OP_LOADI, SYS_SPAWN);
    a.op(OP_TRAP);
    // Jump over the inline string.
    let jump_hole = a.here() + 1;
    a.opa(OP_JMP, 0);
    let name_at = a.here();
    a.string(name);
    a.patch(hole, name_at);
    let after = a.here();
    a.patch(jump_hole, after);
}

/// Write the current A to the caller's terminal (clobbers X).
fn emit_write_a(a: &mut Asm) {
    a.op(OP_TAX);
    a.opa(OP_LOADI, SYS_WRITE);
    a.op(OP_TRAP);
}

// ---------------------------------------------------------------------
// S1: boot and halt
// ---------------------------------------------------------------------

#[test]
fn boot_without_init_halts() {
    let mut m = machine_with(&[]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.kernel().process_count(), 0);
    assert!(m.kernel().running_pid().is_none());
}

// ---------------------------------------------------------------------
// S2: a single process survives quantum expiry after quantum expiry
// ---------------------------------------------------------------------

#[test]
fn single_process_keeps_running_through_preemptions() {
    let mut m = machine_with(&[(INIT_PROGRAM, loop_forever())]);
    m.boot();
    // Enough for many clock interrupts and several quantum expiries.
    assert_eq!(m.run(3_000), StopReason::BudgetExhausted);

    assert_eq!(m.kernel().running_pid(), Some(0));
    let proc = m.kernel().processes().get(0).expect("init alive");
    assert_eq!(proc.state(), ProcessState::Running);
    // The quantum is being consumed and recycled, never pinned or negative.
    assert!((1..=crate::kernel::QUANTUM_INITIAL).contains(&proc.quantum()));
}

// ---------------------------------------------------------------------
// S3: spawn + wait + exit synchronization
// ---------------------------------------------------------------------

#[test]
fn wait_blocks_until_child_exits() {
    let mut a = Asm::new();
    emit_spawn(&mut a, "child.maq");
    a.op(OP_TAX); // X = child pid
    a.opa(OP_LOADI, SYS_WAIT);
    a.op(OP_TRAP);
    // Only reached once the child is gone.
    a.sys(SYS_WRITE, 42);
    a.sys(SYS_EXIT, 0);
    let init = a.build(0);

    let mut m = machine_with(&[(INIT_PROGRAM, init), ("child.maq", exit_immediately())]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.console().output(0), &[42]);
    assert_eq!(m.kernel().process_count(), 0);
}

#[test]
fn wait_on_absent_pid_returns_immediately() {
    let mut a = Asm::new();
    a.sys(SYS_WAIT, 17); // never existed
    a.sys(SYS_WRITE, 5);
    a.sys(SYS_EXIT, 0);
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0))]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.console().output(0), &[5]);
}

// ---------------------------------------------------------------------
// S4: write blocking and the pendency sweep
// ---------------------------------------------------------------------

#[test]
fn blocked_writer_completes_when_terminal_becomes_ready() {
    let mut a = Asm::new();
    emit_spawn(&mut a, "loop.maq"); // keep the machine alive
    a.sys(SYS_WRITE, 1); // accepted immediately, terminal goes busy
    a.sys(SYS_WRITE, 2); // gate closed: blocks, finished by the sweep
    a.sys(SYS_EXIT, 0);
    let init = a.build(0);

    let config = MachineConfig {
        write_delay: 120,
        ..MachineConfig::default()
    };
    let mut m = machine_with_config(&[(INIT_PROGRAM, init), ("loop.maq", loop_forever())], config);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::BudgetExhausted);

    // Both words arrived, in order; init exited afterwards, the looper
    // remains.
    assert_eq!(m.console().output(0), &[1, 2]);
    assert_eq!(m.kernel().process_count(), 1);
    assert!(m.kernel().processes().get(0).is_none());
}

// ---------------------------------------------------------------------
// S5: CPU errors kill the offending process only
// ---------------------------------------------------------------------

#[test]
fn illegal_instruction_kills_last_process_and_halts() {
    let mut a = Asm::new();
    a.word(77); // not an opcode
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0))]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.kernel().process_count(), 0);
}

#[test]
fn cpu_error_kills_only_the_offender() {
    let mut bad = Asm::new();
    bad.word(77);

    let mut a = Asm::new();
    emit_spawn(&mut a, "bad.maq");
    a.op(OP_TAX);
    a.opa(OP_LOADI, SYS_WAIT);
    a.op(OP_TRAP);
    a.sys(SYS_WRITE, 99);
    a.sys(SYS_EXIT, 0);

    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0)), ("bad.maq", bad.build(0))]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    // init outlived the crashing child and saw its termination.
    assert_eq!(m.console().output(0), &[99]);
    assert_eq!(m.kernel().process_count(), 0);
}

#[test]
fn unknown_syscall_kills_the_caller() {
    let mut a = Asm::new();
    a.sys(99, 0);
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0))]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.kernel().process_count(), 0);
}

// ---------------------------------------------------------------------
// S6: spawn failure surfaces -1 and the caller continues
// ---------------------------------------------------------------------

#[test]
fn failed_spawn_returns_minus_one() {
    let mut a = Asm::new();
    emit_spawn(&mut a, "no-such-program.maq");
    emit_write_a(&mut a); // expose A to the test via the terminal
    a.sys(SYS_EXIT, 0);
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0))]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.console().output(0), &[-1]);
    // No half-created descriptor lingers.
    assert_eq!(m.kernel().process_count(), 0);
}

#[test]
fn spawn_returns_child_pid_in_a() {
    let mut a = Asm::new();
    emit_spawn(&mut a, "loop.maq");
    emit_write_a(&mut a);
    a.sys(SYS_EXIT, 0);
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0)), ("loop.maq", loop_forever())]);
    m.boot();
    m.run(BUDGET);
    assert_eq!(m.console().output(0), &[1]);
}

// ---------------------------------------------------------------------
// Terminal input: immediate and blocking reads
// ---------------------------------------------------------------------

#[test]
fn read_with_input_queued_is_immediate() {
    let mut a = Asm::new();
    a.sys(SYS_READ, 0);
    emit_write_a(&mut a); // echo what was read
    a.sys(SYS_EXIT, 0);
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0))]);
    m.console_mut().feed_input(0, [7]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.console().output(0), &[7]);
}

#[test]
fn read_blocks_until_input_arrives() {
    let mut a = Asm::new();
    emit_spawn(&mut a, "loop.maq");
    a.sys(SYS_READ, 0);
    emit_write_a(&mut a);
    a.sys(SYS_EXIT, 0);
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0)), ("loop.maq", loop_forever())]);
    m.boot();

    m.run(5_000);
    let init = m.kernel().processes().get(0).expect("init alive");
    assert_eq!(init.state(), ProcessState::Blocked(BlockReason::IoRead));
    assert!(m.console().output(0).is_empty());

    // Input shows up; the next pendency sweep finishes the read.
    m.console_mut().feed_input(0, [123]);
    m.run(5_000);
    assert_eq!(m.console().output(0), &[123]);
    assert!(m.kernel().processes().get(0).is_none());
}

// ---------------------------------------------------------------------
// Fairness: two CPU-bound processes both make progress
// ---------------------------------------------------------------------

#[test]
fn round_robin_shares_the_cpu() {
    // Each writer loops writing 1 to its own terminal.
    let mut w = Asm::new();
    w.sys(SYS_WRITE, 1);
    w.opa(OP_JMP, 0);
    let writer = w.build(0);

    let mut a = Asm::new();
    emit_spawn(&mut a, "writer.maq");
    emit_spawn(&mut a, "writer.maq");
    a.sys(SYS_EXIT, 0);

    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0)), ("writer.maq", writer)]);
    m.boot();
    assert_eq!(m.run(20_000), StopReason::BudgetExhausted);

    // Both children (pids 1 and 2, slots 1 and 2) got scheduled.
    assert!(!m.console().output(1).is_empty());
    assert!(!m.console().output(2).is_empty());
    assert_eq!(m.kernel().process_count(), 2);
}

// ---------------------------------------------------------------------
// Kill by PID (non-zero X)
// ---------------------------------------------------------------------

#[test]
fn exit_with_pid_kills_that_process() {
    let mut a = Asm::new();
    emit_spawn(&mut a, "loop.maq");
    a.op(OP_TAX); // X = child pid
    a.opa(OP_LOADI, SYS_EXIT);
    a.op(OP_TRAP); // kill the child, not ourselves
    a.sys(SYS_WRITE, 8);
    a.sys(SYS_EXIT, 0);
    let mut m = machine_with(&[(INIT_PROGRAM, a.build(0)), ("loop.maq", loop_forever())]);
    m.boot();
    assert_eq!(m.run(BUDGET), StopReason::Halted);
    assert_eq!(m.console().output(0), &[8]);
    assert_eq!(m.kernel().process_count(), 0);
}

// ---------------------------------------------------------------------
// Loader: mapping, copy, disjoint allocation
// ---------------------------------------------------------------------

fn bare_hardware() -> Hardware {
    Hardware {
        mem: Memory::new(8_192),
        mmu: Mmu::new(),
        console: Console::new(4),
        clock: Clock::new(),
    }
}

#[test]
fn loader_maps_unaligned_images_correctly() {
    let mut hw = bare_hardware();
    let mut k = Kernel::new();
    // 12 words loading at virtual 5: pages 0 and 1.
    let words: Vec<Word> = (100..112).collect();
    k.register_program("p.maq", Program::from_words(5, words.clone()));
    let pid = k.table.create("p.maq");
    let entry = k.load_program(&mut hw, "p.maq", pid).expect("load");
    assert_eq!(entry, 5);

    let pt = k.table.get(pid).unwrap().page_table().clone();
    let f0 = pt.frame_of(0).unwrap();
    let f1 = pt.frame_of(1).unwrap();
    assert_eq!(f1, f0 + 1);
    // Word 0 lives at offset 5 of the first frame.
    assert_eq!(hw.mem.read((f0 * PAGE_SIZE + 5) as Word).unwrap(), 100);
    // Word 5 crosses into the second frame at offset 0.
    assert_eq!(hw.mem.read((f1 * PAGE_SIZE) as Word).unwrap(), 105);
}

#[test]
fn loading_missing_program_fails() {
    let mut hw = bare_hardware();
    let mut k = Kernel::new();
    let pid = k.table.create("ghost");
    assert!(k.load_program(&mut hw, "no-such-program.maq", pid).is_err());
}

proptest! {
    // Every load claims a frame range disjoint from all earlier ones.
    #[test]
    fn loads_never_overlap_frames(lens in proptest::collection::vec(1usize..60, 1..8)) {
        let mut hw = bare_hardware();
        let mut k = Kernel::new();
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for (i, len) in lens.iter().enumerate() {
            let name = format!("p{i}.maq");
            let words = vec![0; *len];
            k.register_program(name.clone(), Program::from_words(0, words));
            let pid = k.table.create(&name);
            k.load_program(&mut hw, &name, pid).expect("load");

            let pt = k.table.get(pid).unwrap().page_table();
            let frames: Vec<usize> = (0..pt.span()).filter_map(|p| pt.frame_of(p)).collect();
            let lo = *frames.first().unwrap();
            let hi = *frames.last().unwrap();
            prop_assert_eq!(frames.len(), len.div_ceil(PAGE_SIZE));
            for &(plo, phi) in &ranges {
                prop_assert!(hi < plo || lo > phi, "frame ranges overlap");
            }
            ranges.push((lo, hi));
        }
    }
}
