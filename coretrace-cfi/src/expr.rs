//! The DWARF expression evaluator for call frame information.
//!
//! CFI uses a narrow slice of the expression language: register reads
//! with offsets, literals, and a handful of arithmetic and comparison
//! operators. This evaluator supports exactly that slice; anything else
//! fails with [`CfiErrorKind::ExprError`] rather than guessing.

use coretrace_dwarf::constants::*;
use coretrace_dwarf::{Encoding, Endian, SectionReader};

use crate::error::{CfiError, CfiErrorKind};

/// The outcome of evaluating an expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExprResult {
    /// The expression produced a final value (`DW_OP_stack_value` was
    /// executed, or the caller asked for a value).
    Value(u64),
    /// The expression produced an address; the caller dereferences it
    /// with one memory read.
    Location(u64),
}

impl ExprResult {
    /// The inner number, regardless of its interpretation.
    pub fn inner(self) -> u64 {
        match self {
            ExprResult::Value(value) | ExprResult::Location(value) => value,
        }
    }
}

/// The frame context an expression evaluates against.
pub trait ExprContext {
    /// The current value of a DWARF register, if known.
    fn register(&self, register: u16) -> Option<u64>;

    /// The canonical frame address of the frame, if already computed.
    fn cfa(&self) -> Option<u64>;
}

/// Evaluates a CFI expression.
///
/// The result is a [`ExprResult::Value`] if `DW_OP_stack_value`
/// terminated the computation and a [`ExprResult::Location`] otherwise.
/// Stack underflow, an unknown register and unsupported opcodes all yield
/// [`CfiErrorKind::ExprError`].
pub fn evaluate(
    expr: &[u8],
    endian: Endian,
    address_size: u8,
    ctx: &dyn ExprContext,
) -> Result<ExprResult, CfiError> {
    let mut reader = SectionReader::new(expr, Encoding::new(endian, address_size));
    let mut stack: Vec<u64> = Vec::with_capacity(8);
    let mut is_value = false;

    fn pop(stack: &mut Vec<u64>) -> Result<u64, CfiError> {
        stack.pop().ok_or_else(|| CfiErrorKind::ExprError.into())
    }

    while !reader.is_empty() {
        let op = reader.read_u8()?;
        match op {
            DW_OP_lit0..=DW_OP_lit31 => stack.push(u64::from(op - DW_OP_lit0)),
            DW_OP_breg0..=DW_OP_breg31 => {
                let register = u16::from(op - DW_OP_breg0);
                let offset = reader.read_sleb128()?;
                let base = ctx
                    .register(register)
                    .ok_or(CfiErrorKind::ExprError)?;
                stack.push(base.wrapping_add(offset as u64));
            }
            DW_OP_bregx => {
                let register = reader.read_uleb128()?;
                let register =
                    u16::try_from(register).map_err(|_| CfiErrorKind::ExprError)?;
                let offset = reader.read_sleb128()?;
                let base = ctx
                    .register(register)
                    .ok_or(CfiErrorKind::ExprError)?;
                stack.push(base.wrapping_add(offset as u64));
            }
            DW_OP_and => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                stack.push(lhs & rhs);
            }
            DW_OP_ge => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                stack.push(u64::from(lhs >= rhs));
            }
            DW_OP_shl => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                stack.push(lhs.wrapping_shl(rhs as u32));
            }
            DW_OP_plus => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                stack.push(lhs.wrapping_add(rhs));
            }
            DW_OP_plus_uconst => {
                let addend = reader.read_uleb128()?;
                let value = pop(&mut stack)?;
                stack.push(value.wrapping_add(addend));
            }
            DW_OP_call_frame_cfa => {
                let cfa = ctx.cfa().ok_or(CfiErrorKind::ExprError)?;
                stack.push(cfa);
            }
            DW_OP_stack_value => {
                is_value = true;
                // Terminates the expression per the standard.
                break;
            }
            DW_OP_nop => {}
            _ => return Err(CfiErrorKind::ExprError.into()),
        }
    }

    let top = pop(&mut stack)?;
    Ok(if is_value {
        ExprResult::Value(top)
    } else {
        ExprResult::Location(top)
    })
}
