//! Discovery of advice declarations on aspect classes.

use anyhow::{Context, Result};

use crate::classfile::{ByteReader, ClassFile, ConstantPool, MemberInfo};
use crate::classpath::TypeResolver;
use crate::descriptor::{MethodSignature, object_class_name};
use crate::error::WeaveError;
use crate::pointcut::{AdviceBinding, AdviceTiming, PointcutKind, PointcutModel, PointcutModelBuilder};

pub(crate) const DEFAULT_ANNOTATION_PACKAGE: &str = "weft/annotation";

const ANNOTATION_ATTRIBUTES: [&str; 2] = ["RuntimeVisibleAnnotations", "RuntimeInvisibleAnnotations"];

/// Advice annotation kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AdviceKind {
    BeforeCall,
    AfterCall,
    BeforeExecute,
    AfterExecute,
    BeforeSuperExecute,
    AfterSuperExecute,
}

impl AdviceKind {
    const ALL: [AdviceKind; 6] = [
        AdviceKind::BeforeCall,
        AdviceKind::AfterCall,
        AdviceKind::BeforeExecute,
        AdviceKind::AfterExecute,
        AdviceKind::BeforeSuperExecute,
        AdviceKind::AfterSuperExecute,
    ];

    fn simple_name(self) -> &'static str {
        match self {
            AdviceKind::BeforeCall => "BeforeCall",
            AdviceKind::AfterCall => "AfterCall",
            AdviceKind::BeforeExecute => "BeforeExecute",
            AdviceKind::AfterExecute => "AfterExecute",
            AdviceKind::BeforeSuperExecute => "BeforeSuperExecute",
            AdviceKind::AfterSuperExecute => "AfterSuperExecute",
        }
    }

    pub(crate) fn pointcut_kind(self) -> PointcutKind {
        match self {
            AdviceKind::BeforeCall | AdviceKind::AfterCall => PointcutKind::Call,
            AdviceKind::BeforeExecute | AdviceKind::AfterExecute => PointcutKind::Execute,
            AdviceKind::BeforeSuperExecute | AdviceKind::AfterSuperExecute => {
                PointcutKind::SuperExecute
            }
        }
    }

    pub(crate) fn timing(self) -> AdviceTiming {
        match self {
            AdviceKind::BeforeCall | AdviceKind::BeforeExecute | AdviceKind::BeforeSuperExecute => {
                AdviceTiming::Before
            }
            _ => AdviceTiming::After,
        }
    }
}

/// Annotation type descriptors recognized by the scanner.
#[derive(Clone, Debug)]
pub(crate) struct Vocabulary {
    aspect: String,
    advice: Vec<(AdviceKind, String, String)>,
}

impl Vocabulary {
    /// Vocabulary living in `package`, given in dotted or slash form.
    pub(crate) fn new(package: &str) -> Self {
        let package = package.replace('.', "/");
        let package = package.trim_end_matches('/');
        let descriptor = |simple: &str| format!("L{package}/{simple};");
        Self {
            aspect: descriptor("Aspect"),
            advice: AdviceKind::ALL
                .iter()
                .map(|kind| {
                    (
                        *kind,
                        descriptor(kind.simple_name()),
                        descriptor(&format!("{}s", kind.simple_name())),
                    )
                })
                .collect(),
        }
    }

    fn single(&self, descriptor: &str) -> Option<AdviceKind> {
        self.advice
            .iter()
            .find(|(_, single, _)| single == descriptor)
            .map(|(kind, _, _)| *kind)
    }

    fn container(&self, descriptor: &str) -> Option<AdviceKind> {
        self.advice
            .iter()
            .find(|(_, _, container)| container == descriptor)
            .map(|(kind, _, _)| *kind)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION_PACKAGE)
    }
}

/// Parsed annotation with the element values the scanner understands.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Annotation {
    pub(crate) descriptor: String,
    pub(crate) elements: Vec<(String, ElementValue)>,
}

impl Annotation {
    fn element(&self, name: &str) -> Option<&ElementValue> {
        self.elements
            .iter()
            .find(|(element, _)| element == name)
            .map(|(_, value)| value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElementValue {
    String(String),
    Class(String),
    Annotation(Annotation),
    Array(Vec<ElementValue>),
    /// Primitive constants and enum values, kept opaque.
    Other,
}

/// Parse a Runtime(In)VisibleAnnotations attribute body.
pub(crate) fn parse_annotations(info: &[u8], pool: &ConstantPool) -> Result<Vec<Annotation>> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push(parse_annotation(&mut reader, pool)?);
    }
    Ok(annotations)
}

fn parse_annotation(reader: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<Annotation> {
    let descriptor = pool.utf8(reader.u16()?).context("annotation type")?;
    let count = reader.u16()?;
    let mut elements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = pool.utf8(reader.u16()?).context("element name")?;
        elements.push((name, parse_element_value(reader, pool)?));
    }
    Ok(Annotation {
        descriptor,
        elements,
    })
}

fn parse_element_value(reader: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<ElementValue> {
    let tag = reader.u8()?;
    let value = match tag {
        b's' => ElementValue::String(pool.utf8(reader.u16()?)?),
        b'c' => ElementValue::Class(pool.utf8(reader.u16()?)?),
        b'@' => ElementValue::Annotation(parse_annotation(reader, pool)?),
        b'[' => {
            let count = reader.u16()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(parse_element_value(reader, pool)?);
            }
            ElementValue::Array(values)
        }
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => {
            reader.u16()?;
            ElementValue::Other
        }
        b'e' => {
            reader.u16()?;
            reader.u16()?;
            ElementValue::Other
        }
        _ => anyhow::bail!("unknown element value tag {}", tag as char),
    };
    Ok(value)
}

/// One `(kind, clazz, method)` triple read off an advice method.
#[derive(Clone, Debug, Eq, PartialEq)]
struct AdviceTarget {
    kind: AdviceKind,
    class: String,
    method: String,
}

/// Builds the pointcut model from aspect classes.
pub(crate) struct AnnotationScanner<'a> {
    vocabulary: &'a Vocabulary,
    resolver: &'a dyn TypeResolver,
    builder: PointcutModelBuilder,
    aspects: usize,
}

impl<'a> AnnotationScanner<'a> {
    pub(crate) fn new(vocabulary: &'a Vocabulary, resolver: &'a dyn TypeResolver) -> Self {
        Self {
            vocabulary,
            resolver,
            builder: PointcutModelBuilder::new(),
            aspects: 0,
        }
    }

    /// Scan one class. Unreadable classes are logged and ignored; a dangling
    /// pointcut aborts the scan.
    pub(crate) fn scan_class(&mut self, location: &str, data: &[u8]) -> Result<()> {
        let class = match ClassFile::parse(data) {
            Ok(class) => class,
            Err(err) => {
                tracing::debug!(entry = location, error = %err, "skipping unreadable class during scan");
                return Ok(());
            }
        };
        let annotations = match member_annotations(&class.attributes, &class.constant_pool) {
            Ok(annotations) => annotations,
            Err(err) => {
                tracing::warn!(entry = location, error = %err, "skipping class with malformed annotations");
                return Ok(());
            }
        };
        if !annotations
            .iter()
            .any(|annotation| annotation.descriptor == self.vocabulary.aspect)
        {
            return Ok(());
        }
        let aspect = class.name()?;
        tracing::info!(aspect = %aspect, "found aspect class");
        self.aspects += 1;
        for method in &class.methods {
            self.scan_method(&class, &aspect, method)
                .with_context(|| format!("scan advice of {aspect}"))?;
        }
        Ok(())
    }

    fn scan_method(&mut self, class: &ClassFile, aspect: &str, method: &MemberInfo) -> Result<()> {
        let pool = &class.constant_pool;
        let annotations = member_annotations(&method.attributes, pool)?;
        let targets = self.advice_targets(&annotations);
        if targets.is_empty() {
            return Ok(());
        }
        let name = method.name(pool)?;
        let descriptor = method.descriptor(pool)?;
        if !method.is_static() {
            tracing::warn!(aspect, advice = %name, "skipping non-static advice method");
            return Ok(());
        }
        let signature = MethodSignature::parse(&descriptor)?;
        for target in targets {
            let prefixes = candidate_prefixes(&signature, target.kind);
            let resolved = self
                .resolver
                .resolve_method_descriptor(&target.class, &target.method, &prefixes)
                .ok_or_else(|| WeaveError::DanglingPointcut {
                    class: target.class.clone(),
                    method: target.method.clone(),
                    prefix: prefixes.join(" | "),
                    aspect: aspect.to_string(),
                    advice: format!("{name}{descriptor}"),
                })?;
            tracing::info!(
                kind = ?target.kind,
                pointcut = %format!("{}.{}{}", target.class, target.method, resolved),
                advice = %format!("{aspect}.{name}{descriptor}"),
                "registered advice"
            );
            self.builder.register(
                target.kind.pointcut_kind(),
                &target.class,
                &target.method,
                &resolved,
                AdviceBinding {
                    aspect: aspect.to_string(),
                    method: name.clone(),
                    descriptor: descriptor.clone(),
                    timing: target.kind.timing(),
                },
            );
        }
        Ok(())
    }

    fn advice_targets(&self, annotations: &[Annotation]) -> Vec<AdviceTarget> {
        let mut targets = Vec::new();
        for annotation in annotations {
            if let Some(kind) = self.vocabulary.single(&annotation.descriptor) {
                targets.extend(advice_target(kind, annotation));
            } else if let Some(kind) = self.vocabulary.container(&annotation.descriptor) {
                let Some(ElementValue::Array(values)) = annotation.element("value") else {
                    tracing::warn!(annotation = %annotation.descriptor, "container without value array");
                    continue;
                };
                for value in values {
                    if let ElementValue::Annotation(nested) = value {
                        targets.extend(advice_target(kind, nested));
                    }
                }
            }
        }
        targets
    }

    pub(crate) fn aspect_count(&self) -> usize {
        self.aspects
    }

    pub(crate) fn finish(self) -> PointcutModel {
        self.builder.build()
    }
}

fn advice_target(kind: AdviceKind, annotation: &Annotation) -> Option<AdviceTarget> {
    let class = match annotation.element("clazz") {
        Some(ElementValue::Class(descriptor)) => object_class_name(descriptor),
        _ => None,
    };
    let method = match annotation.element("method") {
        Some(ElementValue::String(method)) => Some(method),
        _ => None,
    };
    match (class, method) {
        (Some(class), Some(method)) => Some(AdviceTarget {
            kind,
            class: class.to_string(),
            method: method.clone(),
        }),
        _ => {
            tracing::warn!(annotation = %annotation.descriptor, "advice annotation lacks clazz or method");
            None
        }
    }
}

/// Both annotation attributes of a class or member, visible first.
fn member_annotations(
    attributes: &[crate::classfile::AttributeInfo],
    pool: &ConstantPool,
) -> Result<Vec<Annotation>> {
    let mut annotations = Vec::new();
    for wanted in ANNOTATION_ATTRIBUTES {
        for attribute in attributes {
            if pool.utf8(attribute.name_index).ok().as_deref() == Some(wanted) {
                annotations.extend(
                    parse_annotations(&attribute.info, pool)
                        .with_context(|| format!("parse {wanted}"))?,
                );
            }
        }
    }
    Ok(annotations)
}

/// Descriptor prefixes a pointcut may start with for an advice signature.
pub(crate) fn candidate_prefixes(signature: &MethodSignature, kind: AdviceKind) -> Vec<String> {
    let mut prefixes = vec![parameter_prefix(signature.parameters.get(1..).unwrap_or(&[]))];
    if kind.pointcut_kind() == PointcutKind::SuperExecute {
        let full = parameter_prefix(&signature.parameters);
        if !prefixes.contains(&full) {
            prefixes.push(full);
        }
    }
    prefixes
}

/// Closed parameter list, so advice parameters line up one-to-one with the
/// pointcut's.
fn parameter_prefix(parameters: &[String]) -> String {
    format!("({})", parameters.concat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::classpath::{ClassIndex, summary};
    use crate::testing::{ClassBuilder, TestAnnotation};

    const ASPECT: &str = "Lweft/annotation/Aspect;";
    const AFTER_CALL: &str = "Lweft/annotation/AfterCall;";
    const BEFORE_EXECUTE: &str = "Lweft/annotation/BeforeExecute;";
    const BEFORE_EXECUTES: &str = "Lweft/annotation/BeforeExecutes;";
    const BEFORE_SUPER_EXECUTE: &str = "Lweft/annotation/BeforeSuperExecute;";

    fn resolver() -> ClassIndex {
        ClassIndex::from_summaries([
            summary(
                "com/example/A",
                Some("com/example/Base"),
                &[],
                &[("foo", "(I)V", ACC_PUBLIC), ("bar", "(IJ)V", ACC_PUBLIC)],
            ),
            summary(
                "com/example/Base",
                Some("java/lang/Object"),
                &[],
                &[("run", "()V", ACC_PUBLIC), ("helper", "(Ljava/lang/String;I)V", ACC_PUBLIC)],
            ),
            summary(
                "com/example/I",
                Some("java/lang/Object"),
                &[],
                &[("run", "()V", ACC_PUBLIC)],
            ),
            summary(
                "com/example/Util",
                Some("java/lang/Object"),
                &[],
                &[("log", "(Ljava/lang/String;)V", ACC_PUBLIC | ACC_STATIC)],
            ),
        ])
    }

    fn scan(bytes: &[u8]) -> Result<PointcutModel> {
        let vocabulary = Vocabulary::default();
        let resolver = resolver();
        let mut scanner = AnnotationScanner::new(&vocabulary, &resolver);
        scanner.scan_class("Aspect.class", bytes)?;
        Ok(scanner.finish())
    }

    #[test]
    fn registers_call_advice_with_resolved_descriptor() {
        let bytes = ClassBuilder::new("com/example/Aspect")
            .annotation(TestAnnotation::marker(ASPECT))
            .method(ACC_PUBLIC | ACC_STATIC, "afterFoo", "(Lcom/example/A;I)V", vec![0xb1], 0, 2)
            .method_annotation(TestAnnotation::advice(AFTER_CALL, "com/example/A", "foo"))
            .build();

        let model = scan(&bytes).expect("scan");

        let method = model
            .class(PointcutKind::Call, "com/example/A")
            .and_then(|class| class.method("foo", "(I)V"))
            .expect("pointcut");
        assert_eq!(method.advice.len(), 1);
        assert_eq!(method.advice[0].method, "afterFoo");
        assert_eq!(method.advice[0].timing, AdviceTiming::After);
    }

    #[test]
    fn repeatable_container_registers_every_target() {
        let bytes = ClassBuilder::new("com/example/Aspect")
            .annotation(TestAnnotation::marker(ASPECT))
            .method(ACC_PUBLIC | ACC_STATIC, "beforeRun", "(Ljava/lang/Object;)V", vec![0xb1], 0, 1)
            .method_annotation(TestAnnotation::container(
                BEFORE_EXECUTES,
                vec![
                    TestAnnotation::advice(BEFORE_EXECUTE, "com/example/A", "run"),
                    TestAnnotation::advice(BEFORE_EXECUTE, "com/example/I", "run"),
                ],
            ))
            .build();

        let model = scan(&bytes).expect("scan");

        // Found on Base but registered under the annotated class.
        assert!(
            model
                .class(PointcutKind::Execute, "com/example/A")
                .and_then(|class| class.method("run", "()V"))
                .is_some()
        );
        assert!(model.class(PointcutKind::Execute, "com/example/I").is_some());
    }

    #[test]
    fn super_execute_accepts_full_parameter_list_for_static_targets() {
        let bytes = ClassBuilder::new("com/example/Aspect")
            .annotation(TestAnnotation::marker(ASPECT))
            .method(ACC_PUBLIC | ACC_STATIC, "beforeLog", "(Ljava/lang/String;)V", vec![0xb1], 0, 1)
            .method_annotation(TestAnnotation::advice(
                BEFORE_SUPER_EXECUTE,
                "com/example/Util",
                "log",
            ))
            .build();

        let model = scan(&bytes).expect("scan");

        assert!(
            model
                .class(PointcutKind::SuperExecute, "com/example/Util")
                .and_then(|class| class.method("log", "(Ljava/lang/String;)V"))
                .is_some()
        );
    }

    #[test]
    fn dangling_pointcut_is_fatal() {
        let bytes = ClassBuilder::new("com/example/Aspect")
            .annotation(TestAnnotation::marker(ASPECT))
            .method(ACC_PUBLIC | ACC_STATIC, "afterGone", "(Lcom/example/A;)V", vec![0xb1], 0, 1)
            .method_annotation(TestAnnotation::advice(AFTER_CALL, "com/example/A", "gone"))
            .build();

        let error = scan(&bytes).expect_err("dangling");

        assert!(crate::error::is_fatal(&error));
    }

    #[test]
    fn non_static_advice_and_unmarked_classes_are_ignored() {
        let non_static = ClassBuilder::new("com/example/Aspect")
            .annotation(TestAnnotation::marker(ASPECT))
            .method(ACC_PUBLIC, "afterFoo", "(Lcom/example/A;I)V", vec![0xb1], 0, 3)
            .method_annotation(TestAnnotation::advice(AFTER_CALL, "com/example/A", "foo"))
            .build();
        let unmarked = ClassBuilder::new("com/example/NotAspect")
            .method(ACC_PUBLIC | ACC_STATIC, "afterFoo", "(Lcom/example/A;I)V", vec![0xb1], 0, 2)
            .method_annotation(TestAnnotation::advice(AFTER_CALL, "com/example/A", "foo"))
            .build();

        assert!(scan(&non_static).expect("scan").is_empty());
        assert!(scan(&unmarked).expect("scan").is_empty());
    }

    #[test]
    fn prefixes_drop_the_receiver_parameter() {
        let signature = MethodSignature::parse("(Lcom/example/A;ILjava/lang/String;)V").expect("parse");
        assert_eq!(
            candidate_prefixes(&signature, AdviceKind::AfterCall),
            vec!["(ILjava/lang/String;)".to_string()]
        );

        let receiver_only = MethodSignature::parse("(Lcom/example/A;)V").expect("parse");
        assert_eq!(
            candidate_prefixes(&receiver_only, AdviceKind::BeforeSuperExecute),
            vec!["()".to_string(), "(Lcom/example/A;)".to_string()]
        );
    }

    #[test]
    fn pointcut_with_extra_trailing_parameters_does_not_match() {
        let bytes = ClassBuilder::new("com/example/Aspect")
            .annotation(TestAnnotation::marker(ASPECT))
            .method(ACC_PUBLIC | ACC_STATIC, "afterBar", "(Lcom/example/A;I)V", vec![0xb1], 0, 2)
            .method_annotation(TestAnnotation::advice(AFTER_CALL, "com/example/A", "bar"))
            .build();

        let error = scan(&bytes).expect_err("no bar(I) declared");

        assert!(crate::error::is_fatal(&error));
        assert!(
            error
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<WeaveError>(), Some(WeaveError::DanglingPointcut { .. })))
        );
    }

    #[test]
    fn vocabulary_accepts_dotted_package() {
        let vocabulary = Vocabulary::new("org.acme.aop.");

        assert_eq!(vocabulary.aspect, "Lorg/acme/aop/Aspect;");
        assert_eq!(
            vocabulary.container("Lorg/acme/aop/AfterCalls;"),
            Some(AdviceKind::AfterCall)
        );
    }
}
