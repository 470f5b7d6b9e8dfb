use ubpf_core::{opcode, Insn};
use ubpf_jit::x86_64::{translate_program, JitState, RegisterMap, Target};
use ubpf_jit::{Error, Vm};

fn vm_with(insts: Vec<Insn>) -> Vm {
    let mut vm = Vm::new();
    vm.load(insts).unwrap();
    vm
}

fn translated(insts: Vec<Insn>) -> JitState {
    translate_program(&vm_with(insts), RegisterMap::host()).unwrap()
}

fn read_disp(state: &JitState, loc: usize) -> i32 {
    i32::from_le_bytes(state.buf[loc..loc + 4].try_into().unwrap())
}

/// Byte offset a resolved displacement lands on.
fn jump_dest(state: &JitState, loc: usize) -> i64 {
    loc as i64 + 4 + read_disp(state, loc) as i64
}

#[test]
fn pc_locs_cover_every_instruction() {
    let state = translated(vec![
        Insn::mov64_imm(0, 1),
        Insn::mov64_imm(1, 2),
        Insn::new(opcode::ADD64_REG, 0, 1, 0, 0),
        Insn::exit(),
    ]);
    // The prologue precedes pc 0 and offsets never move backwards.
    assert!(state.pc_locs[0] > 0);
    for pair in state.pc_locs[..4].windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    assert!(state.exit_loc >= state.pc_locs[3]);
    assert!(state.div_by_zero_loc > state.exit_loc);
}

#[test]
fn forward_jump_lands_on_target_pc() {
    let state = translated(vec![
        Insn::mov64_imm(0, 1),
        Insn::jump(1),
        Insn::mov64_imm(0, 2),
        Insn::exit(),
    ]);
    let jump = state
        .jumps
        .iter()
        .find(|j| j.target == Target::Pc(3))
        .expect("ja fixup");
    assert_eq!(jump_dest(&state, jump.offset_loc), state.pc_locs[3] as i64);
}

#[test]
fn backward_jump_has_negative_displacement() {
    let state = translated(vec![
        Insn::mov64_imm(0, 0),
        Insn::mov64_imm(1, 3),
        Insn::new(opcode::ADD64_IMM, 0, 0, 0, 1),
        Insn::new(opcode::SUB64_IMM, 1, 0, 0, 1),
        Insn::new(opcode::JNE_IMM, 1, 0, -3, 0),
        Insn::exit(),
    ]);
    let jump = state
        .jumps
        .iter()
        .find(|j| j.target == Target::Pc(2))
        .expect("loop fixup");
    assert!(read_disp(&state, jump.offset_loc) < 0);
    assert_eq!(jump_dest(&state, jump.offset_loc), state.pc_locs[2] as i64);
}

#[test]
fn every_fixup_is_unique_and_in_bounds() {
    let state = translated(vec![
        Insn::mov64_imm(0, 10),
        Insn::mov64_imm(1, 2),
        Insn::new(opcode::DIV64_REG, 0, 1, 0, 0),
        Insn::new(opcode::JEQ_IMM, 0, 0, 1, 5),
        Insn::exit(),
        Insn::mov64_imm(0, 0),
        Insn::exit(),
    ]);
    let mut locs: Vec<usize> = state.jumps.iter().map(|j| j.offset_loc).collect();
    locs.sort_unstable();
    locs.dedup();
    assert_eq!(locs.len(), state.jumps.len(), "duplicate fixup site");
    for jump in &state.jumps {
        let dest = jump_dest(&state, jump.offset_loc);
        assert!(dest >= 0 && dest < state.buf.len() as i64);
    }
}

#[test]
fn mid_program_exit_jumps_to_epilogue() {
    let state = translated(vec![
        Insn::mov64_imm(0, 1),
        Insn::exit(),
        Insn::mov64_imm(0, 2),
        Insn::exit(),
    ]);
    let jump = state
        .jumps
        .iter()
        .find(|j| j.target == Target::Exit)
        .expect("exit fixup");
    assert_eq!(jump_dest(&state, jump.offset_loc), state.exit_loc as i64);
}

#[test]
fn final_exit_falls_through() {
    let state = translated(vec![Insn::mov64_imm(0, 1), Insn::exit()]);
    assert!(!state.jumps.iter().any(|j| j.target == Target::Exit));
}

#[test]
fn division_guard_targets_trampoline() {
    let state = translated(vec![
        Insn::mov64_imm(0, 10),
        Insn::mov64_imm(1, 0),
        Insn::new(opcode::MOD64_REG, 0, 1, 0, 0),
        Insn::exit(),
    ]);
    let jump = state
        .jumps
        .iter()
        .find(|j| j.target == Target::DivByZero)
        .expect("guard fixup");
    assert_eq!(
        jump_dest(&state, jump.offset_loc),
        state.div_by_zero_loc as i64
    );
    // The trampoline itself rejoins the epilogue.
    assert!(state.jumps.iter().any(|j| j.target == Target::Exit));
}

#[test]
fn multiplication_emits_no_guard() {
    let state = translated(vec![
        Insn::mov64_imm(0, 6),
        Insn::new(opcode::MUL64_IMM, 0, 0, 0, 7),
        Insn::exit(),
    ]);
    assert!(!state.jumps.iter().any(|j| j.target == Target::DivByZero));
}

#[test]
fn lddw_consumes_two_slots() {
    let [lo, hi] = Insn::lddw(0, 0x1122334455667788);
    let state = translated(vec![lo, hi, Insn::exit()]);
    // The second slot gets no code of its own: the exit at pc 2 starts
    // where the lddw lowering ended.
    assert!(state.pc_locs[2] > state.pc_locs[0]);
}

#[test]
fn truncated_lddw_is_rejected() {
    let [lo, _] = Insn::lddw(0, 1);
    let err = vm_with(vec![lo]).translate().unwrap_err();
    assert!(matches!(err, Error::TruncatedLddw { pc: 0 }));
}

#[test]
fn unknown_opcode_reports_pc_and_byte() {
    let err = vm_with(vec![Insn::new(0xff, 0, 0, 0, 0)])
        .translate()
        .unwrap_err();
    match err {
        Error::UnknownOpcode { pc, opcode } => {
            assert_eq!(pc, 0);
            assert_eq!(opcode, 0xff);
        }
        other => panic!("unexpected error: {other}"),
    }
    let err = vm_with(vec![Insn::mov64_imm(0, 1), Insn::new(0x06, 0, 0, 0, 0)])
        .translate()
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("PC 1"), "{msg}");
    assert!(msg.contains("0x06"), "{msg}");
}

#[test]
fn translate_requires_loaded_code() {
    let err = Vm::new().translate().unwrap_err();
    assert!(matches!(err, Error::NotLoaded));
    assert_eq!(err.to_string(), "code has not been loaded into this VM");
}

#[test]
fn unregistered_call_is_rejected() {
    let err = vm_with(vec![Insn::call(3), Insn::exit()])
        .translate()
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedCall { pc: 0, imm: 3 }));
}

#[test]
fn ext_func_slot_is_bounded() {
    unsafe extern "C" fn nop(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
        0
    }
    let mut vm = Vm::new();
    assert!(matches!(
        vm.register(64, nop),
        Err(Error::ExtFuncOutOfRange(64))
    ));
    vm.register(63, nop).unwrap();
}

#[test]
fn translation_is_deterministic() {
    let prog = vec![
        Insn::mov64_imm(0, 5),
        Insn::new(opcode::JGT_IMM, 0, 0, 1, 3),
        Insn::mov64_imm(0, 0),
        Insn::exit(),
    ];
    let a = vm_with(prog.clone()).translate().unwrap();
    let b = vm_with(prog).translate().unwrap();
    assert_eq!(a, b);
}

#[test]
fn reshuffled_map_changes_encoding_not_structure() {
    let prog = vec![
        Insn::mov64_imm(0, 1),
        Insn::jump(1),
        Insn::mov64_imm(0, 2),
        Insn::exit(),
    ];
    let base = translate_program(&vm_with(prog.clone()), RegisterMap::host()).unwrap();
    let moved = translate_program(&vm_with(prog), RegisterMap::rotated(4)).unwrap();
    assert_eq!(base.jumps.len(), moved.jumps.len());
    for (a, b) in base.jumps.iter().zip(moved.jumps.iter()) {
        assert_eq!(a.target, b.target);
    }
}
