//! Per-instruction lowering from eBPF to x86-64.
//!
//! The translator walks the instruction stream in order, records the
//! byte offset of every source pc, and emits jumps and calls with
//! placeholder displacements. A second pass rewrites the placeholders
//! once the epilogue and trampoline offsets are known.

use ubpf_core::{opcode as op, STACK_SIZE};

use super::emit::{
    cc, emit_alu32, emit_alu32_ext, emit_alu32_imm32, emit_alu32_imm8, emit_alu64, emit_alu64_ext,
    emit_alu64_imm32, emit_alu64_imm8, emit_bswap, emit_call, emit_cmp, emit_cmp_imm32, emit_jcc,
    emit_jmp, emit_load, emit_load_imm, emit_mov, emit_pop, emit_push, emit_ret, emit_rex,
    emit_store, emit_store_imm32, OperandSize,
};
use super::regs::{Abi, Reg, RegisterMap};
use super::{JitState, Target};
use crate::error::Error;
use crate::vm::Vm;

extern "C" {
    static stderr: *mut libc::FILE;
}

/// Diagnostic format handed to the error callback by the
/// divide-by-zero trampoline. NUL-terminated for the C side.
static DIV_BY_ZERO_FMT: &[u8] = b"uBPF error: division by zero at PC %u\n\0";

/// Run both passes over `vm`'s program and return the finished state.
pub fn translate_program(vm: &Vm, regs: RegisterMap) -> Result<JitState, Error> {
    let mut state = JitState::new(vm.insts().len(), Abi::host(), regs);
    translate(vm, &mut state)?;
    resolve_jumps(&mut state);
    Ok(state)
}

/// First pass: emit prologue, body, epilogue, and the divide-by-zero
/// trampoline, recording pc locations and jump fixups.
pub fn translate(vm: &Vm, state: &mut JitState) -> Result<(), Error> {
    let abi = state.abi;
    let map = state.regs;

    // Prologue: save the ABI non-volatile set, stage the context
    // argument in r1, and carve out the program stack with r10 left
    // at its top.
    for &reg in abi.nonvolatile {
        emit_push(state, reg);
    }
    if map.get(1) != abi.params[0] {
        emit_mov(state, abi.params[0], map.get(1));
    }
    emit_mov(state, Reg::Rsp, map.get(10));
    emit_alu64_imm32(state, 0x81, 5, Reg::Rsp, STACK_SIZE as i32);

    let insts = vm.insts();
    let mut i = 0;
    while i < insts.len() {
        let inst = insts[i];
        state.pc_locs[i] = state.offset();

        let dst = map.get(inst.dst);
        let src = map.get(inst.src);
        let target = Target::Pc((i as i64 + inst.offset as i64 + 1) as usize);

        match inst.opcode {
            op::ADD_IMM => emit_alu32_imm32(state, 0x81, 0, dst, inst.imm),
            op::ADD_REG => emit_alu32(state, 0x01, src, dst),
            op::SUB_IMM => emit_alu32_imm32(state, 0x81, 5, dst, inst.imm),
            op::SUB_REG => emit_alu32(state, 0x29, src, dst),
            op::MUL_IMM | op::MUL_REG | op::DIV_IMM | op::DIV_REG | op::MOD_IMM | op::MOD_REG => {
                muldivmod(state, i, inst.opcode, src, dst, inst.imm)
            }
            op::OR_IMM => emit_alu32_imm32(state, 0x81, 1, dst, inst.imm),
            op::OR_REG => emit_alu32(state, 0x09, src, dst),
            op::AND_IMM => emit_alu32_imm32(state, 0x81, 4, dst, inst.imm),
            op::AND_REG => emit_alu32(state, 0x21, src, dst),
            op::LSH_IMM => emit_alu32_imm8(state, 0xc1, 4, dst, inst.imm as u8),
            op::LSH_REG => {
                emit_mov(state, src, Reg::Rcx);
                emit_alu32_ext(state, 0xd3, 4, dst);
            }
            op::RSH_IMM => emit_alu32_imm8(state, 0xc1, 5, dst, inst.imm as u8),
            op::RSH_REG => {
                emit_mov(state, src, Reg::Rcx);
                emit_alu32_ext(state, 0xd3, 5, dst);
            }
            op::NEG => emit_alu32_ext(state, 0xf7, 3, dst),
            op::XOR_IMM => emit_alu32_imm32(state, 0x81, 6, dst, inst.imm),
            op::XOR_REG => emit_alu32(state, 0x31, src, dst),
            op::MOV_IMM => emit_alu32_imm32(state, 0xc7, 0, dst, inst.imm),
            // The 32-bit form clears the upper half of dst.
            op::MOV_REG => emit_alu32(state, 0x89, src, dst),
            op::ARSH_IMM => emit_alu32_imm8(state, 0xc1, 7, dst, inst.imm as u8),
            op::ARSH_REG => {
                emit_mov(state, src, Reg::Rcx);
                emit_alu32_ext(state, 0xd3, 7, dst);
            }

            // The host is little-endian.
            op::LE => {}
            op::BE => match inst.imm {
                16 => {
                    // rol dst,8 under a 16-bit override, then mask.
                    state.emit_u8(0x66);
                    emit_alu32_imm8(state, 0xc1, 0, dst, 8);
                    emit_alu32_imm32(state, 0x81, 4, dst, 0xffff);
                }
                32 | 64 => emit_bswap(state, inst.imm == 64, dst),
                // Other widths are verifier-rejected; emit nothing.
                _ => {}
            },

            op::ADD64_IMM => emit_alu64_imm32(state, 0x81, 0, dst, inst.imm),
            op::ADD64_REG => emit_alu64(state, 0x01, src, dst),
            op::SUB64_IMM => emit_alu64_imm32(state, 0x81, 5, dst, inst.imm),
            op::SUB64_REG => emit_alu64(state, 0x29, src, dst),
            op::MUL64_IMM
            | op::MUL64_REG
            | op::DIV64_IMM
            | op::DIV64_REG
            | op::MOD64_IMM
            | op::MOD64_REG => muldivmod(state, i, inst.opcode, src, dst, inst.imm),
            op::OR64_IMM => emit_alu64_imm32(state, 0x81, 1, dst, inst.imm),
            op::OR64_REG => emit_alu64(state, 0x09, src, dst),
            op::AND64_IMM => emit_alu64_imm32(state, 0x81, 4, dst, inst.imm),
            op::AND64_REG => emit_alu64(state, 0x21, src, dst),
            op::LSH64_IMM => emit_alu64_imm8(state, 0xc1, 4, dst, inst.imm as u8),
            op::LSH64_REG => {
                emit_mov(state, src, Reg::Rcx);
                emit_alu64_ext(state, 0xd3, 4, dst);
            }
            op::RSH64_IMM => emit_alu64_imm8(state, 0xc1, 5, dst, inst.imm as u8),
            op::RSH64_REG => {
                emit_mov(state, src, Reg::Rcx);
                emit_alu64_ext(state, 0xd3, 5, dst);
            }
            op::NEG64 => emit_alu64_ext(state, 0xf7, 3, dst),
            op::XOR64_IMM => emit_alu64_imm32(state, 0x81, 6, dst, inst.imm),
            op::XOR64_REG => emit_alu64(state, 0x31, src, dst),
            op::MOV64_IMM => emit_load_imm(state, dst, inst.imm as i64),
            op::MOV64_REG => emit_mov(state, src, dst),
            op::ARSH64_IMM => emit_alu64_imm8(state, 0xc1, 7, dst, inst.imm as u8),
            op::ARSH64_REG => {
                emit_mov(state, src, Reg::Rcx);
                emit_alu64_ext(state, 0xd3, 7, dst);
            }

            op::JA => emit_jmp(state, target),
            op::JEQ_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JE, target);
            }
            op::JEQ_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JE, target);
            }
            op::JGT_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JA, target);
            }
            op::JGT_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JA, target);
            }
            op::JGE_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JAE, target);
            }
            op::JGE_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JAE, target);
            }
            op::JLT_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JB, target);
            }
            op::JLT_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JB, target);
            }
            op::JLE_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JBE, target);
            }
            op::JLE_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JBE, target);
            }
            op::JSET_IMM => {
                // test dst, imm32
                emit_alu64_imm32(state, 0xf7, 0, dst, inst.imm);
                emit_jcc(state, cc::JNE, target);
            }
            op::JSET_REG => {
                // test dst, src
                emit_alu64(state, 0x85, src, dst);
                emit_jcc(state, cc::JNE, target);
            }
            op::JNE_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JNE, target);
            }
            op::JNE_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JNE, target);
            }
            op::JSGT_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JG, target);
            }
            op::JSGT_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JG, target);
            }
            op::JSGE_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JGE, target);
            }
            op::JSGE_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JGE, target);
            }
            op::JSLT_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JL, target);
            }
            op::JSLT_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JL, target);
            }
            op::JSLE_IMM => {
                emit_cmp_imm32(state, dst, inst.imm);
                emit_jcc(state, cc::JLE, target);
            }
            op::JSLE_REG => {
                emit_cmp(state, src, dst);
                emit_jcc(state, cc::JLE, target);
            }

            op::CALL => {
                // RCX is reserved for shift counts; the eBPF argument
                // parked in rcx_alt moves back before the call.
                emit_mov(state, abi.rcx_alt, Reg::Rcx);
                let func = usize::try_from(inst.imm)
                    .ok()
                    .and_then(|idx| vm.ext_func(idx))
                    .ok_or(Error::UnresolvedCall {
                        pc: i,
                        imm: inst.imm,
                    })?;
                emit_call(state, func as usize as u64);
                if vm.unwind_index() == Some(inst.imm as usize) {
                    emit_cmp_imm32(state, map.get(0), 0);
                    emit_jcc(state, cc::JE, Target::Exit);
                }
            }
            op::EXIT => {
                if i != insts.len() - 1 {
                    emit_jmp(state, Target::Exit);
                }
            }

            op::LDXW => emit_load(state, OperandSize::S32, src, dst, inst.offset as i32),
            op::LDXH => emit_load(state, OperandSize::S16, src, dst, inst.offset as i32),
            op::LDXB => emit_load(state, OperandSize::S8, src, dst, inst.offset as i32),
            op::LDXDW => emit_load(state, OperandSize::S64, src, dst, inst.offset as i32),

            op::STW => emit_store_imm32(state, OperandSize::S32, dst, inst.offset as i32, inst.imm),
            op::STH => emit_store_imm32(state, OperandSize::S16, dst, inst.offset as i32, inst.imm),
            op::STB => emit_store_imm32(state, OperandSize::S8, dst, inst.offset as i32, inst.imm),
            op::STDW => {
                emit_store_imm32(state, OperandSize::S64, dst, inst.offset as i32, inst.imm)
            }

            op::STXW => emit_store(state, OperandSize::S32, src, dst, inst.offset as i32),
            op::STXH => emit_store(state, OperandSize::S16, src, dst, inst.offset as i32),
            op::STXB => emit_store(state, OperandSize::S8, src, dst, inst.offset as i32),
            op::STXDW => emit_store(state, OperandSize::S64, src, dst, inst.offset as i32),

            op::LDDW => {
                let hi = insts
                    .get(i + 1)
                    .copied()
                    .ok_or(Error::TruncatedLddw { pc: i })?;
                i += 1;
                let imm = inst.imm as u32 as u64 | (hi.imm as u32 as u64) << 32;
                emit_load_imm(state, dst, imm as i64);
            }

            _ => {
                return Err(Error::UnknownOpcode {
                    pc: i,
                    opcode: inst.opcode,
                })
            }
        }

        i += 1;
    }

    // Epilogue: hand r0 back in RAX and unwind the frame.
    state.exit_loc = state.offset();
    if map.get(0) != Reg::Rax {
        emit_mov(state, map.get(0), Reg::Rax);
    }
    emit_alu64_imm32(state, 0x81, 0, Reg::Rsp, STACK_SIZE as i32);
    for &reg in abi.nonvolatile.iter().rev() {
        emit_pop(state, reg);
    }
    emit_ret(state);

    // Divide-by-zero trampoline: report the offending pc (carried in
    // RCX by the muldivmod guard) and return -1 to the host.
    state.div_by_zero_loc = state.offset();
    emit_mov(state, Reg::Rcx, abi.params[2]);
    // SAFETY: reading the C stderr stream pointer.
    let stream = unsafe { stderr } as usize as u64;
    emit_load_imm(state, abi.params[0], stream as i64);
    emit_load_imm(state, abi.params[1], DIV_BY_ZERO_FMT.as_ptr() as i64);
    emit_call(state, vm.error_printf_addr());
    emit_load_imm(state, map.get(0), -1);
    emit_jmp(state, Target::Exit);

    Ok(())
}

/// Lowering for multiply, divide, and modulus. Saves and restores
/// RAX/RDX around the one-operand 0xF7 forms, zero-extends the
/// dividend, and guards division with a jump to the trap trampoline.
fn muldivmod(state: &mut JitState, pc: usize, opcode: u8, src: Reg, dst: Reg, imm: i32) {
    let mul = op::alu_op(opcode) == op::alu_op(op::MUL_IMM);
    let div = op::alu_op(opcode) == op::alu_op(op::DIV_IMM);
    let modulus = op::alu_op(opcode) == op::alu_op(op::MOD_IMM);
    let is64 = op::class(opcode) == op::CLS_ALU64;

    if div || modulus {
        // The trap handler reads the offending pc out of RCX.
        emit_load_imm(state, Reg::Rcx, pc as i64);
        if is64 {
            emit_alu64(state, 0x85, src, src);
        } else {
            emit_alu32(state, 0x85, src, src);
        }
        emit_jcc(state, cc::JE, Target::DivByZero);
    }

    if dst != Reg::Rax {
        emit_push(state, Reg::Rax);
    }
    if dst != Reg::Rdx {
        emit_push(state, Reg::Rdx);
    }
    if imm != 0 {
        emit_load_imm(state, Reg::Rcx, imm as i64);
    } else {
        emit_mov(state, src, Reg::Rcx);
    }

    emit_mov(state, dst, Reg::Rax);

    if div || modulus {
        // Zero-extend the dividend: eBPF division is unsigned.
        emit_alu32(state, 0x31, Reg::Rdx, Reg::Rdx);
    }

    if is64 {
        emit_rex(state, true, false, false, false);
    }
    // mul rcx or div rcx
    emit_alu32_ext(state, 0xf7, if mul { 4 } else { 6 }, Reg::Rcx);

    if dst != Reg::Rdx {
        if modulus {
            emit_mov(state, Reg::Rdx, dst);
        }
        emit_pop(state, Reg::Rdx);
    }
    if dst != Reg::Rax {
        if div || mul {
            emit_mov(state, Reg::Rax, dst);
        }
        emit_pop(state, Reg::Rax);
    }
}

/// Second pass: rewrite every recorded rel32 displacement now that
/// the target offsets are known. Only fixup sites are touched.
pub fn resolve_jumps(state: &mut JitState) {
    for i in 0..state.jumps.len() {
        let jump = state.jumps[i];
        let target_loc = match jump.target {
            Target::Exit => state.exit_loc,
            Target::DivByZero => state.div_by_zero_loc,
            Target::Pc(pc) => state.pc_locs[pc],
        };
        // rel32 is relative to the end of the displacement field.
        let rel = target_loc as i64 - (jump.offset_loc as i64 + 4);
        state.patch_u32(jump.offset_loc, rel as i32 as u32);
    }
}
