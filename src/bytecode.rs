use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::classfile::{
    AttributeInfo, ByteReader, CodeAttribute, ConstantPool, ExceptionEntry, put_u16, put_u32,
};
use crate::ir::{CodeItem, Insn, Label, MethodBody};
use crate::opcodes;

/// Decode a Code attribute into an editable method body.
pub(crate) fn decode(code: &CodeAttribute) -> Result<MethodBody> {
    Ok(MethodBody {
        max_stack: code.max_stack,
        max_locals: code.max_locals,
        items: decode_instructions(&code.code)?,
        code_length: code.code.len() as u32,
        exception_table: code.exception_table.clone(),
        attributes: code.attributes.clone(),
        changed: false,
    })
}

fn decode_instructions(code: &[u8]) -> Result<Vec<CodeItem>> {
    let mut items = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let insn = match opcode {
            opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
                let branch = read_i16(code, offset + 1)?;
                Insn::Branch {
                    opcode,
                    target: relative_label(offset, branch as i32)?,
                }
            }
            opcodes::GOTO_W | opcodes::JSR_W => {
                let branch = read_i32(code, offset + 1)?;
                Insn::Branch {
                    opcode,
                    target: relative_label(offset, branch)?,
                }
            }
            opcodes::TABLESWITCH => decode_tableswitch(code, offset)?,
            opcodes::LOOKUPSWITCH => decode_lookupswitch(code, offset)?,
            _ => Insn::Plain {
                opcode,
                operands: code[offset + 1..offset + length].to_vec(),
            },
        };
        items.push(CodeItem {
            origin: Some(offset as u32),
            insn,
        });
        offset += length;
    }
    Ok(items)
}

fn relative_label(offset: usize, delta: i32) -> Result<Label> {
    let target = offset as i64 + delta as i64;
    if target < 0 {
        anyhow::bail!("branch at {} targets negative offset", offset);
    }
    Ok(Label(target as u32))
}

fn decode_tableswitch(code: &[u8], offset: usize) -> Result<Insn> {
    let base = offset + 1 + padding(offset);
    let default = relative_label(offset, read_i32(code, base)?)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    let mut targets = Vec::with_capacity(count.max(0) as usize);
    let mut idx = base + 12;
    for _ in 0..count {
        targets.push(relative_label(offset, read_i32(code, idx)?)?);
        idx += 4;
    }
    Ok(Insn::TableSwitch {
        default,
        low,
        targets,
    })
}

fn decode_lookupswitch(code: &[u8], offset: usize) -> Result<Insn> {
    let base = offset + 1 + padding(offset);
    let default = relative_label(offset, read_i32(code, base)?)?;
    let npairs = read_i32(code, base + 4)?;
    let mut pairs = Vec::with_capacity(npairs.max(0) as usize);
    let mut idx = base + 8;
    for _ in 0..npairs {
        let key = read_i32(code, idx)?;
        let target = relative_label(offset, read_i32(code, idx + 4)?)?;
        pairs.push((key, target));
        idx += 8;
    }
    Ok(Insn::LookupSwitch { default, pairs })
}

/// Re-encode a method body, relocating every offset-bearing structure.
///
/// Branches whose displacement no longer fits 16 bits are widened to
/// `goto_w`/`jsr_w`; a conditional one becomes the inverted condition
/// jumping over a `goto_w`. A body whose layout changed loses its
/// `StackMapTable`; verifiers that need frames must recompute them.
pub(crate) fn encode(body: &MethodBody, pool: &ConstantPool) -> Result<CodeAttribute> {
    let mut wide = vec![false; body.items.len()];
    let (positions, labels, code_length) = loop {
        let (positions, code_length) = layout(body, &wide);
        let labels = label_positions(body, &positions, code_length);
        let mut grew = false;
        for (index, item) in body.items.iter().enumerate() {
            if let Insn::Branch { opcode, target } = &item.insn
                && !wide[index]
                && !is_wide_branch(*opcode)
                && let Some(destination) = labels.get(&target.0)
                && i16::try_from(*destination as i64 - positions[index] as i64).is_err()
            {
                wide[index] = true;
                grew = true;
            }
        }
        if !grew {
            break (positions, labels, code_length);
        }
    };
    if code_length == 0 || code_length > u16::MAX as u32 {
        anyhow::bail!("method code length {} out of range", code_length);
    }

    let resolve = |label: Label| -> Result<u32> {
        labels
            .get(&label.0)
            .copied()
            .with_context(|| format!("no instruction at original offset {}", label.0))
    };

    let mut code = Vec::with_capacity(code_length as usize);
    for ((item, position), widened) in body.items.iter().zip(&positions).zip(&wide) {
        let position = *position;
        match &item.insn {
            Insn::Plain { opcode, operands } => {
                code.push(*opcode);
                code.extend_from_slice(operands);
            }
            Insn::Branch { opcode, target } if *widened => {
                let destination = resolve(*target)? as i64;
                let jump_at = match *opcode {
                    opcodes::GOTO => {
                        code.push(opcodes::GOTO_W);
                        position
                    }
                    opcodes::JSR => {
                        code.push(opcodes::JSR_W);
                        position
                    }
                    conditional => {
                        let inverted = opcodes::inverted_branch(conditional).with_context(|| {
                            format!("cannot widen branch opcode 0x{conditional:02x}")
                        })?;
                        code.push(inverted);
                        put_u16(&mut code, 8);
                        code.push(opcodes::GOTO_W);
                        position + 3
                    }
                };
                put_u32(&mut code, (destination - jump_at as i64) as i32 as u32);
            }
            Insn::Branch { opcode, target } => {
                let delta = resolve(*target)? as i64 - position as i64;
                code.push(*opcode);
                if is_wide_branch(*opcode) {
                    put_u32(&mut code, delta as i32 as u32);
                } else {
                    let short = i16::try_from(delta)
                        .map_err(|_| anyhow::anyhow!("branch offset {} out of range", delta))?;
                    put_u16(&mut code, short as u16);
                }
            }
            Insn::TableSwitch {
                default,
                low,
                targets,
            } => {
                code.push(opcodes::TABLESWITCH);
                code.extend(std::iter::repeat_n(0u8, padding(position as usize)));
                put_u32(&mut code, switch_delta(resolve(*default)?, position));
                put_u32(&mut code, *low as u32);
                let high = low + targets.len() as i32 - 1;
                put_u32(&mut code, high as u32);
                for target in targets {
                    put_u32(&mut code, switch_delta(resolve(*target)?, position));
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                code.push(opcodes::LOOKUPSWITCH);
                code.extend(std::iter::repeat_n(0u8, padding(position as usize)));
                put_u32(&mut code, switch_delta(resolve(*default)?, position));
                put_u32(&mut code, pairs.len() as u32);
                for (key, target) in pairs {
                    put_u32(&mut code, *key as u32);
                    put_u32(&mut code, switch_delta(resolve(*target)?, position));
                }
            }
        }
    }

    let relocate = |pc: u16| -> Result<u16> { Ok(resolve(Label(pc as u32))? as u16) };
    let mut exception_table = Vec::with_capacity(body.exception_table.len());
    for entry in &body.exception_table {
        exception_table.push(ExceptionEntry {
            start_pc: relocate(entry.start_pc).context("relocate handler start")?,
            end_pc: relocate(entry.end_pc).context("relocate handler end")?,
            handler_pc: relocate(entry.handler_pc).context("relocate handler")?,
            catch_type: entry.catch_type,
        });
    }

    let mut attributes = Vec::with_capacity(body.attributes.len());
    for attribute in &body.attributes {
        let name = pool.utf8(attribute.name_index)?;
        let info = match name.as_str() {
            "LineNumberTable" => relocate_line_numbers(&attribute.info, &labels)?,
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                relocate_local_variables(&attribute.info, &labels)?
            }
            _ => {
                tracing::trace!(attribute = %name, "dropping code attribute of rewritten method");
                continue;
            }
        };
        attributes.push(AttributeInfo {
            name_index: attribute.name_index,
            info,
        });
    }

    Ok(CodeAttribute {
        max_stack: body.max_stack,
        max_locals: body.max_locals,
        code,
        exception_table,
        attributes,
    })
}

/// Offsets of every instruction under the given branch widths, plus the code length.
fn layout(body: &MethodBody, wide: &[bool]) -> (Vec<u32>, u32) {
    let mut positions = Vec::with_capacity(body.items.len());
    let mut offset = 0u32;
    for (item, widened) in body.items.iter().zip(wide) {
        positions.push(offset);
        offset += encoded_size(&item.insn, offset, *widened);
    }
    (positions, offset)
}

/// New offset of each original offset still present in the body.
fn label_positions(body: &MethodBody, positions: &[u32], code_length: u32) -> HashMap<u32, u32> {
    let mut labels = HashMap::new();
    for (item, position) in body.items.iter().zip(positions) {
        if let Some(origin) = item.origin {
            labels.entry(origin).or_insert(*position);
        }
    }
    labels.entry(body.code_length).or_insert(code_length);
    labels
}

fn is_wide_branch(opcode: u8) -> bool {
    matches!(opcode, opcodes::GOTO_W | opcodes::JSR_W)
}

fn switch_delta(target: u32, position: u32) -> u32 {
    (target as i64 - position as i64) as i32 as u32
}

fn encoded_size(insn: &Insn, offset: u32, widened: bool) -> u32 {
    match insn {
        Insn::Plain { operands, .. } => 1 + operands.len() as u32,
        Insn::Branch { opcode, .. } => match (*opcode, widened) {
            (opcodes::GOTO_W | opcodes::JSR_W, _) | (opcodes::GOTO | opcodes::JSR, true) => 5,
            (_, true) => 8,
            (_, false) => 3,
        },
        Insn::TableSwitch { targets, .. } => {
            1 + padding(offset as usize) as u32 + 12 + 4 * targets.len() as u32
        }
        Insn::LookupSwitch { pairs, .. } => {
            1 + padding(offset as usize) as u32 + 8 + 8 * pairs.len() as u32
        }
    }
}

fn relocate_line_numbers(info: &[u8], labels: &HashMap<u32, u32>) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut rows = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start_pc = reader.u16()?;
        let line = reader.u16()?;
        if let Some(start) = labels.get(&(start_pc as u32)) {
            rows.push((*start as u16, line));
        }
    }
    let mut out = Vec::with_capacity(2 + rows.len() * 4);
    put_u16(&mut out, rows.len() as u16);
    for (start, line) in rows {
        put_u16(&mut out, start);
        put_u16(&mut out, line);
    }
    Ok(out)
}

fn relocate_local_variables(info: &[u8], labels: &HashMap<u32, u32>) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut rows = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start_pc = reader.u16()? as u32;
        let length = reader.u16()? as u32;
        let name = reader.u16()?;
        let descriptor = reader.u16()?;
        let index = reader.u16()?;
        let (Some(start), Some(end)) = (labels.get(&start_pc), labels.get(&(start_pc + length)))
        else {
            continue;
        };
        rows.push([*start as u16, (end - start) as u16, name, descriptor, index]);
    }
    let mut out = Vec::with_capacity(2 + rows.len() * 10);
    put_u16(&mut out, rows.len() as u16);
    for row in rows {
        for value in row {
            put_u16(&mut out, value);
        }
    }
    Ok(out)
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa6 => 3,
        opcodes::GOTO | opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb5 => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        0xc5 => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == 0x84 { Ok(6) } else { Ok(4) }
}

pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    let value = read_u16(code, offset)?;
    Ok(i16::from_be_bytes(value.to_be_bytes()))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}
