use crate::classfile::{AttributeInfo, ExceptionEntry};
use crate::opcodes;

/// Original bytecode offset used as a symbolic branch target.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct Label(pub(crate) u32);

/// Bytecode instruction with offset-dependent operands made symbolic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Insn {
    /// Opcode plus operands that do not depend on the instruction's position.
    Plain { opcode: u8, operands: Vec<u8> },
    /// Conditional or unconditional jump, including the `_w` variants.
    Branch { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

impl Insn {
    pub(crate) fn plain(opcode: u8) -> Self {
        Insn::Plain {
            opcode,
            operands: Vec::new(),
        }
    }

    pub(crate) fn opcode(&self) -> u8 {
        match self {
            Insn::Plain { opcode, .. } | Insn::Branch { opcode, .. } => *opcode,
            Insn::TableSwitch { .. } => opcodes::TABLESWITCH,
            Insn::LookupSwitch { .. } => opcodes::LOOKUPSWITCH,
        }
    }

    /// Constant pool index carried by invoke instructions.
    pub(crate) fn pool_index(&self) -> Option<u16> {
        match self {
            Insn::Plain { opcode, operands }
                if (opcodes::is_method_invoke(*opcode) || *opcode == opcodes::INVOKEDYNAMIC)
                    && operands.len() >= 2 =>
            {
                Some(u16::from_be_bytes([operands[0], operands[1]]))
            }
            _ => None,
        }
    }
}

/// Instruction in a method body. `origin` is the offset the instruction had in
/// the parsed code; inserted instructions have none, except the first
/// instruction of a sequence replacing an original one, which inherits it so
/// branches into the replaced instruction land on the whole sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct CodeItem {
    pub(crate) origin: Option<u32>,
    pub(crate) insn: Insn,
}

impl CodeItem {
    pub(crate) fn inserted(insn: Insn) -> Self {
        Self { origin: None, insn }
    }
}

/// Decoded Code attribute that weaving stages rewrite.
#[derive(Clone, Debug)]
pub(crate) struct MethodBody {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) items: Vec<CodeItem>,
    /// Length of the parsed code; labels may point here (end of last range).
    pub(crate) code_length: u32,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<AttributeInfo>,
    pub(crate) changed: bool,
}

impl MethodBody {
    /// Grow `max_stack` so that `extra` more words fit above any reachable depth.
    pub(crate) fn reserve_stack(&mut self, extra: u16) {
        self.max_stack = self.max_stack.saturating_add(extra);
    }

    pub(crate) fn reserve_locals(&mut self, required: u16) {
        self.max_locals = self.max_locals.max(required);
    }
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

impl CallKind {
    pub(crate) fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            opcodes::INVOKEVIRTUAL => Some(CallKind::Virtual),
            opcodes::INVOKEINTERFACE => Some(CallKind::Interface),
            opcodes::INVOKESPECIAL => Some(CallKind::Special),
            opcodes::INVOKESTATIC => Some(CallKind::Static),
            _ => None,
        }
    }

    pub(crate) fn opcode(self) -> u8 {
        match self {
            CallKind::Virtual => opcodes::INVOKEVIRTUAL,
            CallKind::Interface => opcodes::INVOKEINTERFACE,
            CallKind::Special => opcodes::INVOKESPECIAL,
            CallKind::Static => opcodes::INVOKESTATIC,
        }
    }
}
