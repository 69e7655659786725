use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::MethodDescriptor;

use crate::opcodes;

/// Computational category of a JVM value as seen by loads, stores and returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl ValueKind {
    pub(crate) fn from_field_descriptor(descriptor: &str) -> Result<Self> {
        let first = descriptor
            .as_bytes()
            .first()
            .copied()
            .context("empty field descriptor")?;
        let kind = match first {
            b'B' | b'C' | b'I' | b'S' | b'Z' => ValueKind::Int,
            b'J' => ValueKind::Long,
            b'F' => ValueKind::Float,
            b'D' => ValueKind::Double,
            b'L' | b'[' => ValueKind::Reference,
            _ => anyhow::bail!("invalid field descriptor: {descriptor}"),
        };
        Ok(kind)
    }

    /// Number of local variable slots (and operand stack words) the value occupies.
    pub(crate) fn slots(self) -> u16 {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }

    pub(crate) fn load_opcode(self) -> u8 {
        match self {
            ValueKind::Int => opcodes::ILOAD,
            ValueKind::Long => opcodes::LLOAD,
            ValueKind::Float => opcodes::FLOAD,
            ValueKind::Double => opcodes::DLOAD,
            ValueKind::Reference => opcodes::ALOAD,
        }
    }

    pub(crate) fn store_opcode(self) -> u8 {
        match self {
            ValueKind::Int => opcodes::ISTORE,
            ValueKind::Long => opcodes::LSTORE,
            ValueKind::Float => opcodes::FSTORE,
            ValueKind::Double => opcodes::DSTORE,
            ValueKind::Reference => opcodes::ASTORE,
        }
    }

    pub(crate) fn return_opcode(self) -> u8 {
        match self {
            ValueKind::Int => opcodes::IRETURN,
            ValueKind::Long => opcodes::LRETURN,
            ValueKind::Float => opcodes::FRETURN,
            ValueKind::Double => opcodes::DRETURN,
            ValueKind::Reference => opcodes::ARETURN,
        }
    }
}

/// Method descriptor split into raw parameter and return descriptors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSignature {
    pub(crate) parameters: Vec<String>,
    pub(crate) return_type: String,
}

impl MethodSignature {
    pub(crate) fn parse(descriptor: &str) -> Result<Self> {
        let validated = MethodDescriptor::from_str(descriptor)
            .with_context(|| format!("invalid method descriptor {descriptor}"))?;
        let body = descriptor
            .strip_prefix('(')
            .with_context(|| format!("invalid method descriptor {descriptor}"))?;
        let close = body
            .find(')')
            .with_context(|| format!("invalid method descriptor {descriptor}"))?;
        let parameters = split_parameters(&body[..close])
            .with_context(|| format!("invalid method descriptor {descriptor}"))?;
        if parameters.len() != validated.parameter_types().len() {
            anyhow::bail!("invalid method descriptor {descriptor}");
        }
        Ok(Self {
            parameters,
            return_type: body[close + 1..].to_string(),
        })
    }

    pub(crate) fn parameter_kinds(&self) -> Result<Vec<ValueKind>> {
        self.parameters
            .iter()
            .map(|parameter| ValueKind::from_field_descriptor(parameter))
            .collect()
    }

    /// Kind of the returned value, `None` for `void`.
    pub(crate) fn return_kind(&self) -> Result<Option<ValueKind>> {
        if self.return_type == "V" {
            return Ok(None);
        }
        ValueKind::from_field_descriptor(&self.return_type).map(Some)
    }

    pub(crate) fn parameter_slots(&self) -> Result<u16> {
        Ok(self.parameter_kinds()?.iter().map(|kind| kind.slots()).sum())
    }
}

fn split_parameters(list: &str) -> Result<Vec<String>> {
    let bytes = list.as_bytes();
    let mut parameters = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        match bytes[index] {
            b'[' => {
                index += 1;
                continue;
            }
            b'L' => {
                let end = list[index..]
                    .find(';')
                    .context("unterminated object type")?;
                index += end + 1;
            }
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => index += 1,
            other => anyhow::bail!("unexpected descriptor character {}", other as char),
        }
        parameters.push(list[start..index].to_string());
        start = index;
    }
    if start != bytes.len() {
        anyhow::bail!("dangling array marker");
    }
    Ok(parameters)
}

/// Internal class name of an object descriptor such as `Lcom/example/A;`.
pub(crate) fn object_class_name(descriptor: &str) -> Option<&str> {
    descriptor.strip_prefix('L')?.strip_suffix(';')
}
