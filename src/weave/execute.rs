use std::collections::HashSet;

use anyhow::{Context, Result};

use super::emit::{
    Alignment, Receiver, advice_call, invoke, return_insn, slots_from, total_slots,
};
use super::{MethodInfo, WeavingContext, add_method, generated_body, insert_advice, rewrite_bodies};
use crate::classfile::{ACC_PUBLIC, ClassFile, ConstantPool};
use crate::descriptor::MethodSignature;
use crate::ir::{CallKind, Insn, MethodBody};
use crate::opcodes;
use crate::pointcut::{AdviceBinding, PointcutClass, PointcutKind, PointcutMethod, PointcutModel};

/// How a pointcut class relates to the class being woven.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Relation {
    Own,
    Superclass,
    Interface,
}

/// Pointcut class whose execution advice applies to the current class.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Applicable<'m> {
    pub(crate) class: &'m PointcutClass,
    pub(crate) kind: PointcutKind,
    pub(crate) relation: Relation,
}

/// Execute pointcuts of the class itself, plus super-execute pointcuts of the
/// class, its direct superclass and its direct interfaces.
pub(crate) fn applicable_pointcuts<'m>(
    model: &'m PointcutModel,
    class_name: &str,
    super_name: Option<&str>,
    interfaces: &[String],
) -> Vec<Applicable<'m>> {
    let mut applicable = Vec::new();
    let mut push = |kind, name: &str, relation| {
        if let Some(class) = model.class(kind, name) {
            applicable.push(Applicable {
                class,
                kind,
                relation,
            });
        }
    };
    push(PointcutKind::Execute, class_name, Relation::Own);
    push(PointcutKind::SuperExecute, class_name, Relation::Own);
    if let Some(super_name) = super_name {
        push(PointcutKind::SuperExecute, super_name, Relation::Superclass);
    }
    for interface in interfaces {
        push(PointcutKind::SuperExecute, interface, Relation::Interface);
    }
    applicable
}

/// Advice of every applicable pointcut for `name descriptor`, in order and
/// without duplicates.
fn merged_advice(applicable: &[Applicable<'_>], name: &str, descriptor: &str) -> Vec<AdviceBinding> {
    let mut advice: Vec<AdviceBinding> = Vec::new();
    for entry in applicable {
        if let Some(method) = entry.class.method(name, descriptor) {
            for binding in &method.advice {
                if !advice.contains(binding) {
                    advice.push(binding.clone());
                }
            }
        }
    }
    advice
}

pub(crate) fn weave_executions(
    class: &mut ClassFile,
    model: &PointcutModel,
    context: &mut WeavingContext<'_>,
) -> Result<()> {
    let super_name = class.super_name()?;
    let interfaces = class.interface_names()?;
    let applicable = applicable_pointcuts(
        model,
        &context.class_name,
        super_name.as_deref(),
        &interfaces,
    );
    if applicable.is_empty() {
        return Ok(());
    }
    context.mark_modified();

    let pool = &class.constant_pool;
    let declared = class
        .methods
        .iter()
        .map(|method| Ok((method.name(pool)?, method.descriptor(pool)?)))
        .collect::<Result<HashSet<(String, String)>>>()?;

    rewrite_bodies(class, |method, body, pool| {
        let advice = merged_advice(&applicable, &method.name, &method.descriptor);
        if advice.is_empty() {
            return Ok(());
        }
        weave_method(method, body, pool, &advice)?;
        tracing::debug!(
            class = %context.class_name,
            method = %format!("{}{}", method.name, method.descriptor),
            advice = advice.len(),
            "woven method execution"
        );
        Ok(())
    })?;

    let mut synthesized = HashSet::new();
    for entry in &applicable {
        if entry.kind != PointcutKind::SuperExecute {
            continue;
        }
        for pointcut in &entry.class.methods {
            let key = (pointcut.name.clone(), pointcut.descriptor.clone());
            if declared.contains(&key) || !synthesized.insert(key) {
                continue;
            }
            synthesize_override(
                class,
                pointcut,
                &applicable,
                super_name.as_deref(),
                context,
            )?;
        }
    }
    Ok(())
}

/// Before-advice at entry, after-advice ahead of every return.
pub(crate) fn weave_method(
    method: &MethodInfo,
    body: &mut MethodBody,
    pool: &mut ConstantPool,
    advice: &[AdviceBinding],
) -> Result<()> {
    let signature = MethodSignature::parse(&method.descriptor)?;
    let (receiver, first) = if method.is_static() {
        (Receiver::Null, 0)
    } else {
        (Receiver::Local(0), 1)
    };
    let arguments = slots_from(&signature.parameter_kinds()?, first);
    let mut before = Vec::new();
    let mut after = Vec::new();
    for binding in advice {
        let call = advice_call(pool, binding, receiver, &arguments, Alignment::Leading)?;
        if binding.is_before() {
            before.extend(call);
        } else {
            after.extend(call);
        }
    }
    let entry = if method.name == "<init>" {
        delegating_constructor_call(body, pool)? + 1
    } else {
        0
    };
    body.reserve_stack(1 + total_slots(&arguments));
    insert_advice(body, entry, before, &after);
    Ok(())
}

/// Index of the `this(...)`/`super(...)` call: the first `<init>` invocation
/// not paired with a preceding `new`.
fn delegating_constructor_call(body: &MethodBody, pool: &ConstantPool) -> Result<usize> {
    let mut pending_new = 0usize;
    for (index, item) in body.items.iter().enumerate() {
        match item.insn.opcode() {
            opcodes::NEW => pending_new += 1,
            opcodes::INVOKESPECIAL => {
                let target = item
                    .insn
                    .pool_index()
                    .context("invokespecial without operand")
                    .and_then(|index| pool.member_ref(index))?;
                if target.name != "<init>" {
                    continue;
                }
                if pending_new == 0 {
                    return Ok(index);
                }
                pending_new -= 1;
            }
            _ => {}
        }
    }
    anyhow::bail!("constructor has no delegating constructor call")
}

/// Call target of a synthesized override.
struct SuperTarget {
    owner: String,
    interface: bool,
}

fn synthesize_override(
    class: &mut ClassFile,
    pointcut: &PointcutMethod,
    applicable: &[Applicable<'_>],
    super_name: Option<&str>,
    context: &WeavingContext<'_>,
) -> Result<()> {
    let method = format!("{}{}", pointcut.name, pointcut.descriptor);
    if class.is_interface() {
        tracing::info!(class = %context.class_name, method = %method, "not synthesizing override in interface");
        return Ok(());
    }
    let target = match locate_super_target(pointcut, applicable, super_name, context) {
        Ok(target) => target,
        Err(reason) => {
            tracing::info!(class = %context.class_name, method = %method, reason, "not synthesizing override");
            return Ok(());
        }
    };

    let advice = merged_advice(
        &applicable
            .iter()
            .filter(|entry| entry.kind == PointcutKind::SuperExecute)
            .copied()
            .collect::<Vec<_>>(),
        &pointcut.name,
        &pointcut.descriptor,
    );
    let signature = MethodSignature::parse(&pointcut.descriptor)?;
    let arguments = slots_from(&signature.parameter_kinds()?, 1);
    let argument_slots = total_slots(&arguments);
    let return_kind = signature.return_kind()?;
    let pool = &mut class.constant_pool;

    let mut insns: Vec<Insn> = Vec::new();
    for binding in advice.iter().filter(|binding| binding.is_before()) {
        insns.extend(advice_call(pool, binding, Receiver::Local(0), &arguments, Alignment::Leading)?);
    }
    insns.push(Insn::Plain {
        opcode: opcodes::ALOAD,
        operands: vec![0],
    });
    insns.extend(arguments.iter().map(|slot| slot.load()));
    insns.push(invoke(
        pool,
        CallKind::Special,
        &target.owner,
        &pointcut.name,
        &pointcut.descriptor,
        target.interface,
    )?);
    for binding in advice.iter().filter(|binding| binding.is_after()) {
        insns.extend(advice_call(pool, binding, Receiver::Local(0), &arguments, Alignment::Leading)?);
    }
    insns.push(return_insn(return_kind));

    let max_stack = 1 + argument_slots + return_kind.map_or(0, |kind| kind.slots());
    let body = generated_body(insns, max_stack, 1 + argument_slots);
    add_method(class, ACC_PUBLIC, &pointcut.name, &pointcut.descriptor, &body)?;
    tracing::debug!(
        class = %context.class_name,
        method = %method,
        target = %target.owner,
        "synthesized override"
    );
    Ok(())
}

/// The superclass implementation, or a default method of a directly
/// implemented pointcut interface.
fn locate_super_target(
    pointcut: &PointcutMethod,
    applicable: &[Applicable<'_>],
    super_name: Option<&str>,
    context: &WeavingContext<'_>,
) -> std::result::Result<SuperTarget, &'static str> {
    let resolver = context.resolver;
    let found = super_name
        .and_then(|start| resolver.find_implementation(start, &pointcut.name, &pointcut.descriptor));
    if let (Some(found), Some(super_name)) = (&found, super_name) {
        if found.method.is_static {
            return Err("inherited method is static");
        }
        if found.method.is_final {
            return Err("inherited method is final");
        }
        if !found.method.is_abstract {
            return Ok(SuperTarget {
                owner: super_name.to_string(),
                interface: false,
            });
        }
    }
    applicable
        .iter()
        .filter(|entry| entry.relation == Relation::Interface && entry.class.method(&pointcut.name, &pointcut.descriptor).is_some())
        .find(|entry| {
            resolver
                .class(&entry.class.name)
                .and_then(|interface| interface.method(&pointcut.name, &pointcut.descriptor))
                .is_some_and(|method| !method.is_abstract && !method.is_static)
        })
        .map(|entry| SuperTarget {
            owner: entry.class.name.clone(),
            interface: true,
        })
        .ok_or("no concrete implementation found")
}
