use ubpf_core::{opcode, Insn};

#[test]
fn decode_fields() {
    // add64 r3, r7 encoded by hand: opcode, src<<4 | dst, offset, imm.
    let raw = [0x0f, 0x73, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    let insn = Insn::decode(&raw);
    assert_eq!(insn.opcode, opcode::ADD64_REG);
    assert_eq!(insn.dst, 3);
    assert_eq!(insn.src, 7);
    assert_eq!(insn.offset, 0);
    assert_eq!(insn.imm, 0);
}

#[test]
fn decode_negative_offset_and_imm() {
    let raw = [0x55, 0x02, 0xfe, 0xff, 0xff, 0xff, 0xff, 0xff];
    let insn = Insn::decode(&raw);
    assert_eq!(insn.opcode, opcode::JNE_IMM);
    assert_eq!(insn.dst, 2);
    assert_eq!(insn.offset, -2);
    assert_eq!(insn.imm, -1);
}

#[test]
fn encode_round_trips_decode() {
    let insn = Insn::new(opcode::STXDW, 10, 1, -8, 0);
    assert_eq!(Insn::decode(&insn.encode()), insn);
}

#[test]
fn lddw_halves() {
    let [lo, hi] = Insn::lddw(0, 0x1122334455667788);
    assert!(lo.is_wide());
    assert_eq!(lo.imm as u32, 0x55667788);
    assert_eq!(hi.imm as u32, 0x11223344);
    let val = lo.imm as u32 as u64 | (hi.imm as u32 as u64) << 32;
    assert_eq!(val, 0x1122334455667788);
}

#[test]
fn only_lddw_is_wide() {
    assert!(!Insn::mov64_imm(0, 1).is_wide());
    assert!(!Insn::exit().is_wide());
}
