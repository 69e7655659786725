//! Lambda and method reference desugaring.
//!
//! `invokedynamic` sites produced by `LambdaMetafactory` for a pointcut
//! interface get their implementation wrapped with advice. Foreign
//! implementations are routed through a static bridge in the current class;
//! implementations owned by the class are woven in place in a second pass.

use std::collections::HashMap;

use anyhow::{Context, Result};

use super::emit::{Alignment, Receiver, advice_call, invoke, return_insn, slots_from, total_slots};
use super::{WeavingContext, add_method, generated_body, insert_advice, rewrite_bodies};
use crate::classfile::{
    ACC_PRIVATE, ACC_STATIC, ACC_SYNTHETIC, BootstrapMethod, ClassFile, MethodHandle,
    REF_INVOKE_INTERFACE, REF_INVOKE_SPECIAL, REF_INVOKE_STATIC, REF_INVOKE_VIRTUAL,
    REF_NEW_INVOKE_SPECIAL, parse_bootstrap_methods, write_bootstrap_methods,
};
use crate::descriptor::{MethodSignature, object_class_name};
use crate::error::WeaveError;
use crate::ir::{CallKind, Insn};
use crate::opcodes;
use crate::pointcut::{AdviceBinding, PointcutMethod, PointcutModel};

const BOOTSTRAP_METHODS: &str = "BootstrapMethods";
const LAMBDA_METAFACTORY: &str = "java/lang/invoke/LambdaMetafactory";
const BRIDGE_PREFIX: &str = "lambda$weft$";

/// Lambda bodies owned by the class itself, woven after the first pass.
#[derive(Debug, Default)]
pub(crate) struct DeferredWeave {
    methods: Vec<PointcutMethod>,
}

impl DeferredWeave {
    fn add(&mut self, name: &str, descriptor: &str, advice: &[AdviceBinding]) {
        let index = match self
            .methods
            .iter()
            .position(|method| method.matches(name, descriptor))
        {
            Some(index) => index,
            None => {
                self.methods.push(PointcutMethod::new(name, descriptor));
                self.methods.len() - 1
            }
        };
        for binding in advice {
            self.methods[index].add_advice(binding.clone());
        }
    }

    fn take(&mut self, name: &str, descriptor: &str) -> Option<PointcutMethod> {
        let index = self
            .methods
            .iter()
            .position(|method| method.matches(name, descriptor))?;
        Some(self.methods.remove(index))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|method| format!("{}{}", method.name, method.descriptor))
            .collect()
    }
}

/// Synthesized static method standing in for a foreign lambda implementation.
#[derive(Debug)]
struct BridgeBlock {
    name: String,
    descriptor: String,
    target: MethodHandle,
    advice: Vec<AdviceBinding>,
}

#[derive(Debug, Eq, Hash, PartialEq)]
struct BridgeKey {
    interface: String,
    owner: String,
    name: String,
    descriptor: String,
}

/// Class-local bridge registry.
#[derive(Default)]
struct Bridges {
    blocks: Vec<BridgeBlock>,
    by_key: HashMap<BridgeKey, usize>,
    taken_names: Vec<String>,
    next: usize,
}

impl Bridges {
    fn bridge_for(
        &mut self,
        interface: &str,
        target: &MethodHandle,
        advice: Vec<AdviceBinding>,
    ) -> &BridgeBlock {
        let key = BridgeKey {
            interface: interface.to_string(),
            owner: target.target.owner.clone(),
            name: target.target.name.clone(),
            descriptor: target.target.descriptor.clone(),
        };
        if let Some(&index) = self.by_key.get(&key) {
            return &self.blocks[index];
        }
        let name = loop {
            let candidate = format!("{BRIDGE_PREFIX}{}", self.next);
            self.next += 1;
            if !self.taken_names.contains(&candidate) {
                break candidate;
            }
        };
        let descriptor = bridge_descriptor(target);
        self.blocks.push(BridgeBlock {
            name,
            descriptor,
            target: target.clone(),
            advice,
        });
        self.by_key.insert(key, self.blocks.len() - 1);
        &self.blocks[self.blocks.len() - 1]
    }
}

/// Static targets keep their descriptor; bound targets take the receiver as
/// an explicit first parameter.
fn bridge_descriptor(handle: &MethodHandle) -> String {
    let target = &handle.target;
    if handle.kind == REF_INVOKE_STATIC {
        target.descriptor.clone()
    } else {
        format!("(L{};{}", target.owner, &target.descriptor[1..])
    }
}

/// Call site descriptor whose first captured value is retyped to `owner`.
fn retarget_call_site(descriptor: &str, owner: &str) -> String {
    if !descriptor.starts_with("(L") {
        return descriptor.to_string();
    }
    match descriptor.find(';') {
        Some(end) => format!("(L{owner}{}", &descriptor[end..]),
        None => descriptor.to_string(),
    }
}

/// First pass: rewrite foreign lambda implementations to advised bridges and
/// collect the class-owned ones for [`weave_deferred`].
pub(crate) fn desugar(
    class: &mut ClassFile,
    model: &PointcutModel,
    context: &mut WeavingContext<'_>,
) -> Result<DeferredWeave> {
    let mut deferred = DeferredWeave::default();
    let Some(attribute) = class.attribute(BOOTSTRAP_METHODS) else {
        return Ok(deferred);
    };
    let mut bootstrap_methods =
        parse_bootstrap_methods(&attribute.info).context("parse bootstrap methods")?;
    let original_count = bootstrap_methods.len();
    let is_interface = class.is_interface();
    let pool = &class.constant_pool;
    let mut bridges = Bridges {
        taken_names: class
            .methods
            .iter()
            .map(|method| method.name(pool))
            .collect::<Result<_>>()?,
        ..Bridges::default()
    };
    let class_name = context.class_name.clone();
    let resolver = context.resolver;
    let mut rewritten = 0usize;

    rewrite_bodies(class, |method, body, pool| {
        for item in body.items.iter_mut() {
            if item.insn.opcode() != opcodes::INVOKEDYNAMIC {
                continue;
            }
            let index = item.insn.pool_index().context("invokedynamic without operand")?;
            let (bootstrap_index, sam_name, site_descriptor) = pool.invoke_dynamic(index)?;
            let bootstrap = bootstrap_methods
                .get(usize::from(bootstrap_index))
                .with_context(|| format!("missing bootstrap method {bootstrap_index}"))?
                .clone();
            let factory = pool.method_handle(bootstrap.method_ref)?;
            if factory.target.owner != LAMBDA_METAFACTORY || bootstrap.arguments.len() < 2 {
                continue;
            }
            let site = MethodSignature::parse(&site_descriptor)?;
            let Some(interface) = object_class_name(&site.return_type) else {
                continue;
            };
            let erased = pool.method_type(bootstrap.arguments[0])?;
            let mut advice: Vec<AdviceBinding> = Vec::new();
            for pointcut in model.execution_classes(interface) {
                if let Some(found) = pointcut.method(&sam_name, &erased) {
                    for binding in &found.advice {
                        if !advice.contains(binding) {
                            advice.push(binding.clone());
                        }
                    }
                }
            }
            if advice.is_empty() {
                continue;
            }

            let handle = pool.method_handle(bootstrap.arguments[1])?;
            let target = &handle.target;
            if target.name == sam_name && resolver.is_subtype(&target.owner, interface) {
                continue;
            }
            if target.owner == class_name {
                tracing::debug!(
                    class = %class_name,
                    lambda = %format!("{}{}", target.name, target.descriptor),
                    "deferring lambda body"
                );
                deferred.add(&target.name, &target.descriptor, &advice);
                continue;
            }
            match handle.kind {
                REF_NEW_INVOKE_SPECIAL => {
                    tracing::warn!(
                        class = %class_name,
                        method = %format!("{}{}", method.name, method.descriptor),
                        target = %format!("{}.{}{}", target.owner, target.name, target.descriptor),
                        "constructor reference cannot be bridged, leaving it unwoven"
                    );
                    continue;
                }
                REF_INVOKE_SPECIAL => {
                    return Err(WeaveError::UnsupportedBridgeHandle {
                        class: class_name.clone(),
                        owner: target.owner.clone(),
                        name: target.name.clone(),
                        descriptor: target.descriptor.clone(),
                    }
                    .into());
                }
                _ => {}
            }

            let bridge = bridges.bridge_for(interface, &handle, advice);
            let bridge_ref =
                pool.add_method_ref(&class_name, &bridge.name, &bridge.descriptor, is_interface)?;
            let bridge_handle = pool.add_method_handle(REF_INVOKE_STATIC, bridge_ref)?;
            let mut replacement = bootstrap;
            replacement.arguments[1] = bridge_handle;
            let replacement_index = match bootstrap_methods
                .iter()
                .position(|existing| *existing == replacement)
            {
                Some(existing) => existing,
                None => {
                    bootstrap_methods.push(replacement);
                    bootstrap_methods.len() - 1
                }
            };
            let replacement_index = u16::try_from(replacement_index)
                .map_err(|_| anyhow::anyhow!("too many bootstrap methods"))?;
            let descriptor = if handle.kind == REF_INVOKE_STATIC {
                site_descriptor.clone()
            } else {
                retarget_call_site(&site_descriptor, &target.owner)
            };
            let call_site = pool.add_invoke_dynamic(replacement_index, &sam_name, &descriptor)?;
            let [high, low] = call_site.to_be_bytes();
            item.insn = Insn::Plain {
                opcode: opcodes::INVOKEDYNAMIC,
                operands: vec![high, low, 0, 0],
            };
            body.changed = true;
            rewritten += 1;
            tracing::debug!(
                class = %class_name,
                method = %format!("{}{}", method.name, method.descriptor),
                bridge = %bridge.name,
                "bridged lambda implementation"
            );
        }
        Ok(())
    })?;

    if rewritten == 0 {
        return Ok(deferred);
    }
    if bootstrap_methods.len() != original_count {
        class.set_attribute(BOOTSTRAP_METHODS, write_bootstrap_methods(&bootstrap_methods))?;
    }
    for bridge in &bridges.blocks {
        emit_bridge(class, bridge)
            .with_context(|| format!("emit bridge {}{}", bridge.name, bridge.descriptor))?;
    }
    context.mark_modified();
    Ok(deferred)
}

fn call_kind(handle_kind: u8) -> Result<CallKind> {
    match handle_kind {
        REF_INVOKE_VIRTUAL => Ok(CallKind::Virtual),
        REF_INVOKE_STATIC => Ok(CallKind::Static),
        REF_INVOKE_INTERFACE => Ok(CallKind::Interface),
        other => anyhow::bail!("method handle kind {other} cannot be bridged"),
    }
}

fn emit_bridge(class: &mut ClassFile, bridge: &BridgeBlock) -> Result<()> {
    let signature = MethodSignature::parse(&bridge.descriptor)?;
    let parameters = slots_from(&signature.parameter_kinds()?, 0);
    let parameter_slots = total_slots(&parameters);
    let return_kind = signature.return_kind()?;
    // Advice sees the arguments that follow a bridged receiver.
    let window = if bridge.target.kind == REF_INVOKE_STATIC {
        &parameters[..]
    } else {
        parameters.get(1..).unwrap_or_default()
    };
    let target = &bridge.target.target;
    let pool = &mut class.constant_pool;

    let mut insns = Vec::new();
    for binding in bridge.advice.iter().filter(|binding| binding.is_before()) {
        insns.extend(advice_call(pool, binding, Receiver::Null, window, Alignment::Trailing)?);
    }
    insns.extend(parameters.iter().map(|slot| slot.load()));
    insns.push(invoke(
        pool,
        call_kind(bridge.target.kind)?,
        &target.owner,
        &target.name,
        &target.descriptor,
        target.interface,
    )?);
    for binding in bridge.advice.iter().filter(|binding| binding.is_after()) {
        insns.extend(advice_call(pool, binding, Receiver::Null, window, Alignment::Trailing)?);
    }
    insns.push(return_insn(return_kind));

    let max_stack = parameter_slots + return_kind.map_or(0, |kind| kind.slots()) + 1;
    let body = generated_body(insns, max_stack, parameter_slots);
    add_method(
        class,
        ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
        &bridge.name,
        &bridge.descriptor,
        &body,
    )
}

/// Second pass over the re-parsed class: weave the deferred lambda bodies.
/// Returns the entries whose method was not found.
pub(crate) fn weave_deferred(
    class: &mut ClassFile,
    mut deferred: DeferredWeave,
    context: &mut WeavingContext<'_>,
) -> Result<DeferredWeave> {
    rewrite_bodies(class, |method, body, pool| {
        let Some(pointcut) = deferred.take(&method.name, &method.descriptor) else {
            return Ok(());
        };
        let signature = MethodSignature::parse(&method.descriptor)?;
        let first = if method.is_static() { 0 } else { 1 };
        let arguments = slots_from(&signature.parameter_kinds()?, first);
        let mut before = Vec::new();
        let mut after = Vec::new();
        for binding in &pointcut.advice {
            let call = advice_call(pool, binding, Receiver::Null, &arguments, Alignment::Trailing)?;
            if binding.is_before() {
                before.extend(call);
            } else {
                after.extend(call);
            }
        }
        body.reserve_stack(1 + total_slots(&arguments));
        insert_advice(body, 0, before, &after);
        context.mark_modified();
        tracing::debug!(
            class = %context.class_name,
            lambda = %format!("{}{}", method.name, method.descriptor),
            "woven deferred lambda body"
        );
        Ok(())
    })?;
    Ok(deferred)
}
