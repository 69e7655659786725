use std::collections::BTreeMap;

use anyhow::{Context, Result};

use super::emit::{Alignment, Receiver, Slot, advice_call, slots_from, total_slots};
use super::{MethodInfo, WeavingContext, rewrite_bodies};
use crate::classfile::{ClassFile, ConstantPool, MemberRef};
use crate::classpath::TypeResolver;
use crate::descriptor::{MethodSignature, ValueKind};
use crate::ir::{CallKind, CodeItem, Insn, MethodBody};
use crate::pointcut::{PointcutClass, PointcutKind, PointcutMethod, PointcutModel};

/// Extra operand stack words a woven call site may need: a null receiver plus
/// a two-word result kept underneath after-advice arguments.
const CALL_SITE_STACK: u16 = 3;

pub(crate) fn weave_calls(
    class: &mut ClassFile,
    model: &PointcutModel,
    context: &mut WeavingContext<'_>,
) -> Result<()> {
    let pointcuts = model.classes(PointcutKind::Call);
    if pointcuts.is_empty() {
        return Ok(());
    }
    rewrite_bodies(class, |method, body, pool| {
        weave_body(method, body, pool, pointcuts, context)
    })
}

fn weave_body(
    method: &MethodInfo,
    body: &mut MethodBody,
    pool: &mut ConstantPool,
    pointcuts: &BTreeMap<String, PointcutClass>,
    context: &mut WeavingContext<'_>,
) -> Result<()> {
    // Scratch locals start above the method's own and are reused by every site.
    let scratch = body.max_locals;
    let original = std::mem::take(&mut body.items);
    let mut items = Vec::with_capacity(original.len());
    let mut woven = false;
    for item in original {
        let Some(kind) = CallKind::from_opcode(item.insn.opcode()) else {
            items.push(item);
            continue;
        };
        let index = item.insn.pool_index().context("invoke without operand")?;
        let target = pool.member_ref(index)?;
        let Some(pointcut) = find_pointcut(pointcuts, &target, context.resolver) else {
            items.push(item);
            continue;
        };
        let sequence = splice(body, pool, kind, &item.insn, &target, pointcut, scratch)?;
        tracing::debug!(
            class = %context.class_name,
            method = %format!("{}{}", method.name, method.descriptor),
            call = %format!("{}.{}{}", target.owner, target.name, target.descriptor),
            "woven call site"
        );
        let mut sequence = sequence.into_iter().map(CodeItem::inserted);
        if let Some(mut first) = sequence.next() {
            first.origin = item.origin;
            items.push(first);
        }
        items.extend(sequence);
        woven = true;
    }
    body.items = items;
    if woven {
        body.reserve_stack(CALL_SITE_STACK);
        body.changed = true;
        context.mark_modified();
    }
    Ok(())
}

/// First call pointcut class the invoked owner is assignable to that lists
/// the invoked method.
fn find_pointcut<'m>(
    pointcuts: &'m BTreeMap<String, PointcutClass>,
    target: &MemberRef,
    resolver: &dyn TypeResolver,
) -> Option<&'m PointcutMethod> {
    // The receiver of a constructor call is uninitialized and cannot be handed to advice.
    if target.name == "<init>" {
        return None;
    }
    pointcuts.values().find_map(|class| {
        class
            .method(&target.name, &target.descriptor)
            .filter(|_| resolver.is_subtype(&target.owner, &class.name))
    })
}

/// Store arguments and receiver, run before-advice, replay the call, run
/// after-advice.
fn splice(
    body: &mut MethodBody,
    pool: &mut ConstantPool,
    kind: CallKind,
    call: &Insn,
    target: &MemberRef,
    pointcut: &PointcutMethod,
    scratch: u16,
) -> Result<Vec<Insn>> {
    let signature = MethodSignature::parse(&target.descriptor)?;
    let arguments = slots_from(&signature.parameter_kinds()?, scratch);
    let argument_slots = total_slots(&arguments);
    let receiver_slot = (kind != CallKind::Static).then(|| Slot {
        kind: ValueKind::Reference,
        index: scratch + argument_slots,
    });
    let receiver = receiver_slot.map_or(Receiver::Null, |slot| Receiver::Local(slot.index));
    body.reserve_locals(scratch + argument_slots + u16::from(receiver_slot.is_some()));

    let mut insns = Vec::new();
    insns.extend(arguments.iter().rev().map(|slot| slot.store()));
    insns.extend(receiver_slot.map(Slot::store));
    for advice in pointcut.before() {
        insns.extend(advice_call(pool, advice, receiver, &arguments, Alignment::Trailing)?);
    }
    insns.extend(receiver_slot.map(Slot::load));
    insns.extend(arguments.iter().map(|slot| slot.load()));
    insns.push(call.clone());
    for advice in pointcut.after() {
        insns.extend(advice_call(pool, advice, receiver, &arguments, Alignment::Trailing)?);
    }
    Ok(insns)
}
