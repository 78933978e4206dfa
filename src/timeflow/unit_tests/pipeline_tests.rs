use crate::base::behavior::*;
use crate::sim::arch::Arch;
use crate::sim::device::{Device, SimDevice, STARTUP_ADDR};
use crate::sim::runtime::{dcr_initialize, upload_kernel_bytes};
use crate::sim::top::{ProcessorConfig, RunOutcome};
use crate::timeflow::isa::{AluOp, Instr, KernelBuilder, Reg, INSTR_BYTES};
use crate::timeflow::pipeline::{CoreEvent, EventKind};
use crate::timeflow::warp::WarpStatus;

fn launch(arch: Arch, kernel: &KernelBuilder) -> SimDevice {
    let mut config = ProcessorConfig::new(arch);
    config.record_events = true;
    let mut dev = SimDevice::new(config);
    dcr_initialize(&mut dev).unwrap();
    upload_kernel_bytes(&mut dev, &kernel.build()).unwrap();
    dev.start().unwrap();
    dev
}

fn run_to_halt(arch: Arch, kernel: &KernelBuilder) -> SimDevice {
    let mut dev = launch(arch, kernel);
    let outcome = dev.wait(100_000).unwrap();
    assert!(matches!(outcome, RunOutcome::Halted(_)), "kernel did not halt");
    dev
}

fn pc_of(index: usize) -> u64 {
    STARTUP_ADDR + index as u64 * INSTR_BYTES
}

fn events_of(events: &[CoreEvent], wid: usize, kind: EventKind) -> Vec<CoreEvent> {
    events
        .iter()
        .filter(|e| e.wid == wid && e.kind == kind)
        .copied()
        .collect()
}

fn alu(op: AluOp, rd: u8, rs1: u8, rs2: u8) -> Instr {
    Instr::Alu {
        op,
        rd: Reg::x(rd),
        rs1: Reg::x(rs1),
        rs2: Reg::x(rs2),
    }
}

#[test]
fn warps_issue_in_program_order() {
    let mut kb = KernelBuilder::new();
    kb.push(alu(AluOp::Div, 5, 1, 2))
        .push(alu(AluOp::Arith, 6, 5, 0))
        .push(Instr::Fpu {
            rd: Reg::f(1),
            rs1: Reg::f(2),
            rs2: Reg::f(3),
        })
        .push(alu(AluOp::Mul, 7, 1, 2))
        .push(Instr::Halt);
    let dev = run_to_halt(Arch::new(4, 2, 1, 1).unwrap(), &kb);
    let core = dev.processor().core(0).unwrap();
    let events = core.events();

    for wid in 0..2 {
        let issues = events_of(events, wid, EventKind::Issue);
        let writebacks = events_of(events, wid, EventKind::Writeback);
        assert_eq!(issues.len(), 5);
        assert_eq!(writebacks.len(), 5);
        assert!(issues.windows(2).all(|w| w[0].pc < w[1].pc && w[0].uid < w[1].uid));
        for wb in writebacks.iter() {
            let issue = issues.iter().find(|i| i.uid == wb.uid).unwrap();
            assert!(issue.cycle < wb.cycle);
        }

        // the consumer of x5 waits for the divide to write back
        let div_wb = writebacks.iter().find(|e| e.pc == pc_of(0)).unwrap();
        let use_issue = issues.iter().find(|e| e.pc == pc_of(1)).unwrap();
        assert!(use_issue.cycle >= div_wb.cycle);
    }
    assert_eq!(core.counters().instrs.get(), 10);
}

#[test]
fn barrier_releases_all_warps_together() {
    let mut kb = KernelBuilder::new();
    kb.push(alu(AluOp::Div, 5, 1, 2))
        .push(Instr::Bar { id: 0, count: 2 })
        .push(alu(AluOp::Arith, 6, 5, 0))
        .push(Instr::Halt);
    let dev = run_to_halt(Arch::new(4, 2, 1, 1).unwrap(), &kb);
    let events = dev.processor().core(0).unwrap().events();

    let releases: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::BarrierRelease)
        .collect();
    assert_eq!(releases.len(), 2);
    let release_cycle = releases[0].cycle;
    assert!(releases.iter().all(|e| e.cycle == release_cycle));

    let last_arrival = events
        .iter()
        .filter(|e| e.kind == EventKind::Writeback && e.pc == pc_of(1))
        .map(|e| e.cycle)
        .max()
        .unwrap();
    assert_eq!(last_arrival, release_cycle);

    for wid in 0..2 {
        let after = events_of(events, wid, EventKind::Issue)
            .into_iter()
            .find(|e| e.pc == pc_of(2))
            .unwrap();
        assert!(after.cycle > release_cycle);
    }
}

#[test]
fn single_warp_barrier_does_not_block() {
    let mut kb = KernelBuilder::new();
    kb.push(Instr::Bar { id: 3, count: 1 }).push(Instr::Halt);
    let dev = run_to_halt(Arch::new(4, 2, 1, 1).unwrap(), &kb);
    let events = dev.processor().core(0).unwrap().events();
    let releases = events
        .iter()
        .filter(|e| e.kind == EventKind::BarrierRelease)
        .count();
    assert_eq!(releases, 2);
}

#[test]
fn divergent_paths_reconverge_with_full_mask() {
    let kb = two_sided(0b0011);

    let mut dev = launch(Arch::new(4, 2, 1, 1).unwrap(), &kb);
    let mut masks = vec![dev.processor().core(0).unwrap().warp_tmask(0)];
    let mut saw_diverged = false;
    for _ in 0..100_000 {
        if dev.processor().is_done() {
            break;
        }
        dev.processor_mut().tick_one();
        let core = dev.processor().core(0).unwrap();
        let mask = core.warp_tmask(0);
        if masks.last() != Some(&mask) {
            masks.push(mask);
        }
        saw_diverged |= core.warp_status(0) == WarpStatus::Diverged;
    }

    assert!(dev.processor().is_done());
    assert_eq!(masks, vec![0b1111, 0b0011, 0b1100, 0b1111]);
    assert!(saw_diverged);
    let core = dev.processor().core(0).unwrap();
    assert_eq!(core.warp_status(1), WarpStatus::Idle);
    assert_eq!(core.warp_tmask(1), 0b1111);
    // split, two blocks of two, halt; the skip jump is never reached
    assert_eq!(core.counters().instrs.get(), 2 * 6);
}

/// `0 SPLIT; 1 ALU; 2 JOIN; 3 JUMP; 4 ALU; 5 JOIN; 6 HALT`
fn two_sided(then_mask: u32) -> KernelBuilder {
    let mut kb = KernelBuilder::new();
    kb.if_else(
        then_mask,
        |kb| {
            kb.push(alu(AluOp::Arith, 1, 1, 0));
        },
        |kb| {
            kb.push(alu(AluOp::Arith, 2, 2, 0));
        },
    )
    .push(Instr::Halt);
    kb
}

fn issued_indices(dev: &SimDevice, wid: usize) -> Vec<u64> {
    let events = dev.processor().core(0).unwrap().events();
    events_of(events, wid, EventKind::Issue)
        .iter()
        .map(|e| (e.pc - STARTUP_ADDR) / INSTR_BYTES)
        .collect()
}

#[test]
fn uniformly_taken_split_skips_else_block() {
    let dev = run_to_halt(Arch::new(4, 2, 1, 1).unwrap(), &two_sided(0b1111));
    let core = dev.processor().core(0).unwrap();
    for wid in 0..2 {
        assert_eq!(issued_indices(&dev, wid), vec![0, 1, 2, 3, 6]);
        assert_eq!(core.warp_tmask(wid), 0b1111);
    }
    assert_eq!(core.counters().instrs.get(), 2 * 5);
}

#[test]
fn uniformly_not_taken_split_runs_only_else_block() {
    let dev = run_to_halt(Arch::new(4, 2, 1, 1).unwrap(), &two_sided(0));
    let core = dev.processor().core(0).unwrap();
    for wid in 0..2 {
        assert_eq!(issued_indices(&dev, wid), vec![0, 4, 5, 6]);
        assert_eq!(core.warp_tmask(wid), 0b1111);
    }
    assert_eq!(core.counters().instrs.get(), 2 * 4);
}

#[test]
fn budget_is_relative_to_the_current_cycle() {
    let mut kb = KernelBuilder::new();
    kb.push(Instr::Halt);
    let mut dev = launch(Arch::new(4, 1, 1, 1).unwrap(), &kb);
    assert_eq!(dev.wait(5).unwrap(), RunOutcome::BudgetExhausted);
    assert_eq!(dev.processor().cycle(), 5);
    match dev.wait(100_000).unwrap() {
        RunOutcome::Halted(cycles) => assert!(cycles > 5),
        other => panic!("expected halt, got {other:?}"),
    }
}
