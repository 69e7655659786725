//! Instruction builders shared by the weaving stages.

use anyhow::Result;

use crate::classfile::ConstantPool;
use crate::descriptor::{MethodSignature, ValueKind};
use crate::ir::{CallKind, Insn};
use crate::opcodes;
use crate::pointcut::AdviceBinding;

/// Local variable slot holding a value of a known kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Slot {
    pub(crate) kind: ValueKind,
    pub(crate) index: u16,
}

impl Slot {
    pub(crate) fn load(self) -> Insn {
        local_insn(self.kind.load_opcode(), self.index)
    }

    pub(crate) fn store(self) -> Insn {
        local_insn(self.kind.store_opcode(), self.index)
    }
}

fn local_insn(opcode: u8, index: u16) -> Insn {
    match u8::try_from(index) {
        Ok(short) => Insn::Plain {
            opcode,
            operands: vec![short],
        },
        Err(_) => {
            let [high, low] = index.to_be_bytes();
            Insn::Plain {
                opcode: opcodes::WIDE,
                operands: vec![opcode, high, low],
            }
        }
    }
}

/// Consecutive slots for `kinds`, starting at `first`.
pub(crate) fn slots_from(kinds: &[ValueKind], first: u16) -> Vec<Slot> {
    let mut next = first;
    kinds
        .iter()
        .map(|kind| {
            let slot = Slot {
                kind: *kind,
                index: next,
            };
            next += kind.slots();
            slot
        })
        .collect()
}

pub(crate) fn total_slots(slots: &[Slot]) -> u16 {
    slots.iter().map(|slot| slot.kind.slots()).sum()
}

/// Value handed to an advice method as its first parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Receiver {
    Null,
    Local(u16),
}

impl Receiver {
    fn load(self) -> Insn {
        match self {
            Receiver::Null => Insn::plain(opcodes::ACONST_NULL),
            Receiver::Local(index) => Slot {
                kind: ValueKind::Reference,
                index,
            }
            .load(),
        }
    }
}

/// Which of the available arguments feed the advice's remaining parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Alignment {
    Leading,
    Trailing,
}

pub(crate) fn invoke(
    pool: &mut ConstantPool,
    kind: CallKind,
    owner: &str,
    name: &str,
    descriptor: &str,
    interface: bool,
) -> Result<Insn> {
    let index = pool.add_method_ref(owner, name, descriptor, interface)?;
    let [high, low] = index.to_be_bytes();
    let operands = if kind == CallKind::Interface {
        let count = 1 + MethodSignature::parse(descriptor)?.parameter_slots()?;
        let count = u8::try_from(count)
            .map_err(|_| anyhow::anyhow!("too many arguments for invokeinterface {descriptor}"))?;
        vec![high, low, count, 0]
    } else {
        vec![high, low]
    };
    Ok(Insn::Plain {
        opcode: kind.opcode(),
        operands,
    })
}

/// Static call of `advice` passing the receiver and a window of `arguments`.
pub(crate) fn advice_call(
    pool: &mut ConstantPool,
    advice: &AdviceBinding,
    receiver: Receiver,
    arguments: &[Slot],
    alignment: Alignment,
) -> Result<Vec<Insn>> {
    let arity = MethodSignature::parse(&advice.descriptor)?.parameters.len();
    let mut insns = Vec::with_capacity(arity + 1);
    if arity > 0 {
        let wanted = arity - 1;
        if wanted > arguments.len() {
            anyhow::bail!(
                "advice {}.{}{} expects {} arguments but only {} are available",
                advice.aspect,
                advice.method,
                advice.descriptor,
                wanted,
                arguments.len()
            );
        }
        let window = match alignment {
            Alignment::Leading => &arguments[..wanted],
            Alignment::Trailing => &arguments[arguments.len() - wanted..],
        };
        insns.push(receiver.load());
        insns.extend(window.iter().map(|slot| slot.load()));
    }
    insns.push(invoke(
        pool,
        CallKind::Static,
        &advice.aspect,
        &advice.method,
        &advice.descriptor,
        false,
    )?);
    Ok(insns)
}

pub(crate) fn return_insn(kind: Option<ValueKind>) -> Insn {
    Insn::plain(kind.map_or(opcodes::RETURN, ValueKind::return_opcode))
}
