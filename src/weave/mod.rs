//! Per-class weaving pipeline.
//!
//! Every class runs through the closure desugarer, the call-site weaver and
//! the execution weaver in that order. Lambda bodies owned by the class are
//! woven in a second pass over the re-parsed output of the first.

mod call;
mod closure;
mod emit;
mod execute;

use anyhow::{Context, Result};

use crate::bytecode;
use crate::classfile::{AttributeInfo, ClassFile, CodeAttribute, ConstantPool, MemberInfo};
use crate::classpath::TypeResolver;
use crate::error::is_fatal;
use crate::ir::{CodeItem, Insn, MethodBody};
use crate::opcodes;
use crate::pointcut::PointcutModel;

/// Class attribute marking output of a previous run.
pub(crate) const WOVEN_ATTRIBUTE: &str = "WeftWoven";

/// Per-class state shared by the stages.
pub(crate) struct WeavingContext<'a> {
    pub(crate) class_name: String,
    pub(crate) resolver: &'a dyn TypeResolver,
    modified: bool,
}

impl<'a> WeavingContext<'a> {
    pub(crate) fn new(class_name: String, resolver: &'a dyn TypeResolver) -> Self {
        Self {
            class_name,
            resolver,
            modified: false,
        }
    }

    pub(crate) fn mark_modified(&mut self) {
        self.modified = true;
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified
    }
}

/// Result of weaving one class.
#[derive(Debug)]
pub(crate) enum WeaveOutcome {
    Woven { class_name: String, bytes: Vec<u8> },
    Unchanged,
    Excluded,
    /// Rewriting failed; the original bytes are kept.
    Failed { message: String },
}

pub(crate) struct Weaver<'a> {
    model: &'a PointcutModel,
    resolver: &'a dyn TypeResolver,
    excluded_packages: Vec<String>,
}

impl<'a> Weaver<'a> {
    /// `excluded_packages` may be given in dotted or slash form.
    pub(crate) fn new(
        model: &'a PointcutModel,
        resolver: &'a dyn TypeResolver,
        excluded_packages: &[String],
    ) -> Self {
        Self {
            model,
            resolver,
            excluded_packages: excluded_packages
                .iter()
                .map(|package| package.replace('.', "/"))
                .collect(),
        }
    }

    fn is_excluded(&self, class_name: &str) -> bool {
        self.excluded_packages
            .iter()
            .any(|package| class_name.starts_with(package.as_str()))
    }

    /// Weave one class. Only fatal misconfigurations are returned as errors;
    /// anything else degrades to [`WeaveOutcome::Failed`].
    pub(crate) fn weave(&self, location: &str, data: &[u8]) -> Result<WeaveOutcome> {
        match self.transform(data) {
            Ok(outcome) => Ok(outcome),
            Err(err) if is_fatal(&err) => Err(err.context(format!("weave {location}"))),
            Err(err) => {
                tracing::error!(entry = location, error = %format!("{err:#}"), "weaving failed, keeping original class");
                Ok(WeaveOutcome::Failed {
                    message: format!("{err:#}"),
                })
            }
        }
    }

    fn transform(&self, data: &[u8]) -> Result<WeaveOutcome> {
        let mut class = ClassFile::parse(data).context("parse class")?;
        let class_name = class.name()?;
        if self.is_excluded(&class_name) {
            tracing::trace!(class = %class_name, "excluded package");
            return Ok(WeaveOutcome::Excluded);
        }
        if class.has_attribute(WOVEN_ATTRIBUTE) {
            tracing::debug!(class = %class_name, "already woven");
            return Ok(WeaveOutcome::Unchanged);
        }

        let mut context = WeavingContext::new(class_name.clone(), self.resolver);
        let deferred = closure::desugar(&mut class, self.model, &mut context)
            .context("desugar lambdas")?;
        call::weave_calls(&mut class, self.model, &mut context).context("weave call sites")?;
        execute::weave_executions(&mut class, self.model, &mut context)
            .context("weave executions")?;

        if !deferred.is_empty() {
            let bytes = class.to_bytes();
            let mut reparsed = ClassFile::parse(&bytes).context("re-parse desugared class")?;
            let remaining = closure::weave_deferred(&mut reparsed, deferred, &mut context)
                .context("weave deferred lambda bodies")?;
            if !remaining.is_empty() {
                tracing::warn!(class = %class_name, methods = ?remaining.names(), "deferred lambda bodies not found");
            }
            class = reparsed;
        }

        if !context.is_modified() {
            return Ok(WeaveOutcome::Unchanged);
        }
        class.set_attribute(WOVEN_ATTRIBUTE, Vec::new())?;
        tracing::debug!(class = %class_name, "woven");
        Ok(WeaveOutcome::Woven {
            class_name,
            bytes: class.to_bytes(),
        })
    }
}

/// Method identity passed to body rewriters.
pub(crate) struct MethodInfo {
    pub(crate) access_flags: u16,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MethodInfo {
    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & crate::classfile::ACC_STATIC != 0
    }
}

/// Decode every method with code, let `rewrite` edit it, and re-encode the
/// bodies it marked as changed.
pub(crate) fn rewrite_bodies<F>(class: &mut ClassFile, mut rewrite: F) -> Result<()>
where
    F: FnMut(&MethodInfo, &mut MethodBody, &mut ConstantPool) -> Result<()>,
{
    let pool = &mut class.constant_pool;
    for member in class.methods.iter_mut() {
        let method = MethodInfo {
            access_flags: member.access_flags,
            name: member.name(pool)?,
            descriptor: member.descriptor(pool)?,
        };
        let Some(position) = member
            .attributes
            .iter()
            .position(|attribute| pool.utf8(attribute.name_index).ok().as_deref() == Some("Code"))
        else {
            continue;
        };
        let code = CodeAttribute::parse(&member.attributes[position].info)
            .with_context(|| format!("parse code of {}{}", method.name, method.descriptor))?;
        let mut body = bytecode::decode(&code)
            .with_context(|| format!("decode {}{}", method.name, method.descriptor))?;
        rewrite(&method, &mut body, pool)
            .with_context(|| format!("rewrite {}{}", method.name, method.descriptor))?;
        if body.changed {
            let encoded = bytecode::encode(&body, pool)
                .with_context(|| format!("encode {}{}", method.name, method.descriptor))?;
            member.attributes[position].info = encoded.to_bytes();
        }
    }
    Ok(())
}

/// Body made only of generated instructions.
pub(crate) fn generated_body(insns: Vec<Insn>, max_stack: u16, max_locals: u16) -> MethodBody {
    MethodBody {
        max_stack,
        max_locals,
        items: insns.into_iter().map(CodeItem::inserted).collect(),
        code_length: 0,
        exception_table: Vec::new(),
        attributes: Vec::new(),
        changed: true,
    }
}

/// Append a method with a generated body.
pub(crate) fn add_method(
    class: &mut ClassFile,
    access_flags: u16,
    name: &str,
    descriptor: &str,
    body: &MethodBody,
) -> Result<()> {
    let pool = &mut class.constant_pool;
    let name_index = pool.add_utf8(name)?;
    let descriptor_index = pool.add_utf8(descriptor)?;
    let code_index = pool.add_utf8("Code")?;
    let code = bytecode::encode(body, pool).with_context(|| format!("encode {name}{descriptor}"))?;
    class.methods.push(MemberInfo {
        access_flags,
        name_index,
        descriptor_index,
        attributes: vec![AttributeInfo {
            name_index: code_index,
            info: code.to_bytes(),
        }],
    });
    Ok(())
}

/// Insert `before` at item `entry` and `after` ahead of every return. Branches
/// that targeted a return now target the advice preceding it.
pub(crate) fn insert_advice(body: &mut MethodBody, entry: usize, before: Vec<Insn>, after: &[Insn]) {
    let original = std::mem::take(&mut body.items);
    let mut items = Vec::with_capacity(original.len() + before.len() + after.len());
    let mut before = Some(before);
    for (index, item) in original.into_iter().enumerate() {
        if index == entry
            && let Some(before) = before.take()
        {
            items.extend(before.into_iter().map(CodeItem::inserted));
        }
        if !after.is_empty() && opcodes::is_return(item.insn.opcode()) {
            let mut sequence = after.iter().cloned().map(CodeItem::inserted);
            if let Some(mut first) = sequence.next() {
                first.origin = item.origin;
                items.push(first);
            }
            items.extend(sequence);
            items.push(CodeItem::inserted(item.insn));
        } else {
            items.push(item);
        }
    }
    if let Some(before) = before {
        items.extend(before.into_iter().map(CodeItem::inserted));
    }
    body.items = items;
    body.changed = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::classpath::{ClassIndex, summary};
    use crate::pointcut::{AdviceBinding, AdviceTiming, PointcutKind, PointcutModelBuilder};
    use crate::testing::{ClassBuilder, invoke, invoked_methods};

    fn model() -> PointcutModel {
        let mut builder = PointcutModelBuilder::new();
        builder.register(
            PointcutKind::Call,
            "com/example/A",
            "foo",
            "(I)V",
            AdviceBinding {
                aspect: "com/example/Aspect".to_string(),
                method: "afterFoo".to_string(),
                descriptor: "(Lcom/example/A;I)V".to_string(),
                timing: AdviceTiming::After,
            },
        );
        builder.build()
    }

    fn resolver() -> ClassIndex {
        ClassIndex::from_summaries([summary(
            "com/example/A",
            Some("java/lang/Object"),
            &[],
            &[("foo", "(I)V", ACC_PUBLIC)],
        )])
    }

    fn caller(name: &str) -> Vec<u8> {
        let mut builder = ClassBuilder::new(name);
        let foo = builder.method_ref("com/example/A", "foo", "(I)V", false);
        // aload_0; iconst_5; invokevirtual A.foo; return
        let mut code = vec![0x2a, 0x08];
        code.extend(invoke(opcodes::INVOKEVIRTUAL, foo, 1));
        code.push(opcodes::RETURN);
        builder
            .method(ACC_PUBLIC | ACC_STATIC, "main", "(Lcom/example/A;)V", code, 2, 1)
            .build()
    }

    #[test]
    fn advice_free_class_is_unchanged() {
        let model = PointcutModel::default();
        let resolver = resolver();
        let weaver = Weaver::new(&model, &resolver, &[]);

        let outcome = weaver.weave("C.class", &caller("com/example/C")).expect("weave");

        assert!(matches!(outcome, WeaveOutcome::Unchanged));
    }

    #[test]
    fn excluded_package_is_left_alone() {
        let model = model();
        let resolver = resolver();
        let weaver = Weaver::new(&model, &resolver, &["com.example.internal".to_string()]);

        let outcome = weaver
            .weave("C.class", &caller("com/example/internal/C"))
            .expect("weave");

        assert!(matches!(outcome, WeaveOutcome::Excluded));
    }

    #[test]
    fn second_run_does_not_duplicate_advice() {
        let model = model();
        let resolver = resolver();
        let weaver = Weaver::new(&model, &resolver, &[]);

        let first = match weaver.weave("C.class", &caller("com/example/C")).expect("weave") {
            WeaveOutcome::Woven { bytes, .. } => bytes,
            other => panic!("expected woven class, got {other:?}"),
        };
        let second = weaver.weave("C.class", &first).expect("weave again");

        assert!(matches!(second, WeaveOutcome::Unchanged));
        assert_eq!(
            invoked_methods(&first, "main", "(Lcom/example/A;)V"),
            vec!["com/example/A.foo", "com/example/Aspect.afterFoo"]
        );
    }

    #[test]
    fn malformed_class_fails_softly() {
        let model = model();
        let resolver = resolver();
        let weaver = Weaver::new(&model, &resolver, &[]);

        let outcome = weaver.weave("bad.class", b"\xca\xfe\xba\xbe").expect("weave");

        assert!(matches!(outcome, WeaveOutcome::Failed { .. }));
    }

    #[test]
    fn insert_advice_wraps_every_return() {
        let mut body = bytecode::decode(&CodeAttribute {
            max_stack: 1,
            max_locals: 1,
            // iload_0; ifeq +4; return; return
            code: vec![0x1a, 0x99, 0x00, 0x04, 0xb1, 0xb1],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        })
        .expect("decode");

        insert_advice(&mut body, 0, vec![Insn::plain(0x00)], &[Insn::plain(0x00)]);

        let opcodes: Vec<_> = body.items.iter().map(|item| item.insn.opcode()).collect();
        assert_eq!(opcodes, vec![0x00, 0x1a, 0x99, 0x00, 0xb1, 0x00, 0xb1]);
        // The branch to the second return now lands on its advice.
        assert_eq!(body.items[5].origin, Some(5));
        assert!(body.items[6].origin.is_none());
    }
}
