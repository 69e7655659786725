use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::methods::MethodFlags;
use rayon::prelude::*;

use crate::classfile::{ACC_ABSTRACT, ACC_FINAL, ACC_STATIC, ClassFile};
use crate::scan::ClassEntry;

const OBJECT: &str = "java/lang/Object";

/// Declared method as seen by hierarchy queries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSummary {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_static: bool,
    pub(crate) is_abstract: bool,
    pub(crate) is_final: bool,
}

impl MethodSummary {
    pub(crate) fn is_constructor(&self) -> bool {
        self.name == "<init>" || self.name == "<clinit>"
    }
}

/// Hierarchy facts about one class.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ClassSummary {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) methods: Vec<MethodSummary>,
}

impl ClassSummary {
    pub(crate) fn method(&self, name: &str, descriptor: &str) -> Option<&MethodSummary> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }
}

/// Implementation located by [`TypeResolver::find_implementation`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Implementation {
    pub(crate) owner: String,
    pub(crate) method: MethodSummary,
}

/// Type queries answered from a class index. Unknown classes never fail a
/// query; they simply contribute nothing.
pub(crate) trait TypeResolver: Send + Sync {
    fn class(&self, name: &str) -> Option<&ClassSummary>;

    /// Whether `class` can be assigned to `target`.
    fn is_subtype(&self, class: &str, target: &str) -> bool {
        if class == target || target == OBJECT {
            return true;
        }
        let mut pending = vec![class.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some(summary) = self.class(&current) else {
                continue;
            };
            for parent in summary.super_name.iter().chain(&summary.interfaces) {
                if parent == target {
                    return true;
                }
                pending.push(parent.clone());
            }
        }
        false
    }

    /// Descriptor of the first method named `name` declared by `class` or one
    /// of its superclasses whose descriptor starts with one of `prefixes`.
    fn resolve_method_descriptor(
        &self,
        class: &str,
        name: &str,
        prefixes: &[String],
    ) -> Option<String> {
        let constructor = name == "<init>";
        let mut current = Some(class.to_string());
        while let Some(class_name) = current {
            if class_name == OBJECT {
                break;
            }
            let summary = self.class(&class_name)?;
            let found = summary.methods.iter().find(|method| {
                method.name == name
                    && (constructor || !method.is_constructor())
                    && prefixes
                        .iter()
                        .any(|prefix| method.descriptor.starts_with(prefix.as_str()))
            });
            if let Some(method) = found {
                return Some(method.descriptor.clone());
            }
            // Constructors are not inherited.
            if constructor {
                break;
            }
            current = summary.super_name.clone();
        }
        None
    }

    /// Nearest declaration of `name descriptor` walking up from `start`.
    fn find_implementation(&self, start: &str, name: &str, descriptor: &str) -> Option<Implementation> {
        let mut current = Some(start.to_string());
        while let Some(class_name) = current {
            let summary = self.class(&class_name)?;
            if let Some(method) = summary.method(name, descriptor) {
                return Some(Implementation {
                    owner: class_name,
                    method: method.clone(),
                });
            }
            current = summary.super_name.clone();
        }
        None
    }
}

/// Class index over input classes and platform libraries. The first
/// definition of a class name wins.
#[derive(Debug, Default)]
pub(crate) struct ClassIndex {
    classes: HashMap<String, ClassSummary>,
}

impl ClassIndex {
    pub(crate) fn build<'a>(entries: impl IntoIterator<Item = &'a ClassEntry>) -> Self {
        let entries: Vec<&ClassEntry> = entries.into_iter().collect();
        let summaries: Vec<Option<ClassSummary>> = entries
            .par_iter()
            .map(|entry| match summarize(&entry.bytes) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    tracing::warn!(entry = %entry.location, error = %format!("{err:#}"), "skipping unreadable class");
                    None
                }
            })
            .collect();
        Self::from_summaries(summaries.into_iter().flatten())
    }

    pub(crate) fn from_summaries(summaries: impl IntoIterator<Item = ClassSummary>) -> Self {
        let mut classes = HashMap::new();
        for summary in summaries {
            classes.entry(summary.name.clone()).or_insert(summary);
        }
        Self { classes }
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }
}

impl TypeResolver for ClassIndex {
    fn class(&self, name: &str) -> Option<&ClassSummary> {
        self.classes.get(name)
    }
}

/// Summarize class bytes with jclassfile, falling back to the lossless codec
/// for class files jclassfile rejects.
pub(crate) fn summarize(data: &[u8]) -> Result<ClassSummary> {
    match summarize_with_jclassfile(data) {
        Ok(summary) => Ok(summary),
        Err(err) => {
            tracing::trace!(error = %err, "jclassfile rejected class, using fallback parser");
            summarize_with_codec(data)
        }
    }
}

fn summarize_with_jclassfile(data: &[u8]) -> Result<ClassSummary> {
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
    let super_name = if class_file.super_class() == 0 {
        None
    } else {
        Some(
            resolve_class_name(constant_pool, class_file.super_class())
                .context("resolve super class name")?,
        )
    };
    let mut interfaces = Vec::new();
    for interface in class_file.interfaces() {
        interfaces
            .push(resolve_class_name(constant_pool, *interface).context("resolve interface name")?);
    }
    let mut methods = Vec::new();
    for method in class_file.methods() {
        let access_flags = method.access_flags();
        methods.push(MethodSummary {
            name: resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?,
            descriptor: resolve_utf8(constant_pool, method.descriptor_index())
                .context("resolve method descriptor")?,
            is_static: access_flags.contains(MethodFlags::ACC_STATIC),
            is_abstract: access_flags.contains(MethodFlags::ACC_ABSTRACT),
            is_final: access_flags.contains(MethodFlags::ACC_FINAL),
        });
    }
    Ok(ClassSummary {
        name,
        super_name,
        interfaces,
        methods,
    })
}

fn summarize_with_codec(data: &[u8]) -> Result<ClassSummary> {
    let class = ClassFile::parse(data).context("failed to parse class file bytes")?;
    let pool = &class.constant_pool;
    let methods = class
        .methods
        .iter()
        .map(|method| {
            Ok(MethodSummary {
                name: method.name(pool)?,
                descriptor: method.descriptor(pool)?,
                is_static: method.access_flags & ACC_STATIC != 0,
                is_abstract: method.access_flags & ACC_ABSTRACT != 0,
                is_final: method.access_flags & ACC_FINAL != 0,
            })
        })
        .collect::<Result<Vec<_>>>()
        .context("resolve methods")?;
    Ok(ClassSummary {
        name: class.name()?,
        super_name: class.super_name()?,
        interfaces: class.interface_names()?,
        methods,
    })
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

#[cfg(test)]
pub(crate) fn summary(
    name: &str,
    super_name: Option<&str>,
    interfaces: &[&str],
    methods: &[(&str, &str, u16)],
) -> ClassSummary {
    ClassSummary {
        name: name.to_string(),
        super_name: super_name.map(str::to_string),
        interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
        methods: methods
            .iter()
            .map(|(name, descriptor, access)| MethodSummary {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                is_static: access & ACC_STATIC != 0,
                is_abstract: access & ACC_ABSTRACT != 0,
                is_final: access & ACC_FINAL != 0,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ACC_PUBLIC;
    use crate::testing::ClassBuilder;

    fn index() -> ClassIndex {
        ClassIndex::from_summaries([
            summary(
                "com/example/Base",
                Some(OBJECT),
                &["com/example/I"],
                &[
                    ("<init>", "()V", ACC_PUBLIC),
                    ("foo", "(ILjava/lang/String;)V", ACC_PUBLIC),
                    ("run", "()V", ACC_PUBLIC),
                ],
            ),
            summary(
                "com/example/A",
                Some("com/example/Base"),
                &[],
                &[("<init>", "(I)V", ACC_PUBLIC), ("bar", "()I", ACC_PUBLIC)],
            ),
            summary(
                "com/example/I",
                Some(OBJECT),
                &["com/example/J"],
                &[("run", "()V", ACC_PUBLIC | ACC_ABSTRACT)],
            ),
        ])
    }

    #[test]
    fn subtype_follows_superclasses_and_interfaces() {
        let index = index();

        assert!(index.is_subtype("com/example/A", "com/example/Base"));
        assert!(index.is_subtype("com/example/A", "com/example/J"));
        assert!(index.is_subtype("com/example/Unknown", OBJECT));
        assert!(!index.is_subtype("com/example/Base", "com/example/A"));
        assert!(!index.is_subtype("com/example/Unknown", "com/example/Base"));
    }

    #[test]
    fn resolves_descriptor_through_superclass_chain() {
        let index = index();

        assert_eq!(
            index.resolve_method_descriptor("com/example/A", "foo", &["(I".to_string()]),
            Some("(ILjava/lang/String;)V".to_string())
        );
        assert_eq!(
            index.resolve_method_descriptor("com/example/A", "foo", &["()".to_string()]),
            None
        );
        assert_eq!(
            index.resolve_method_descriptor("com/example/Missing", "foo", &["()".to_string()]),
            None
        );
    }

    #[test]
    fn constructors_resolve_only_when_requested_on_the_class_itself() {
        let index = index();

        assert_eq!(
            index.resolve_method_descriptor("com/example/A", "<init>", &["(I".to_string()]),
            Some("(I)V".to_string())
        );
        assert_eq!(
            index.resolve_method_descriptor("com/example/A", "<init>", &["()".to_string()]),
            None
        );
    }

    #[test]
    fn finds_nearest_implementation() {
        let index = index();

        let found = index
            .find_implementation("com/example/A", "run", "()V")
            .expect("implementation");
        assert_eq!(found.owner, "com/example/Base");
        assert!(!found.method.is_abstract);
        assert!(index.find_implementation("com/example/A", "gone", "()V").is_none());
    }

    #[test]
    fn build_summarizes_class_bytes_and_skips_garbage() {
        let entries = vec![
            ClassEntry {
                location: "com/example/A.class".to_string(),
                bytes: ClassBuilder::new("com/example/A")
                    .super_name("com/example/Base")
                    .method(ACC_PUBLIC | ACC_STATIC, "helper", "()V", vec![0xb1], 0, 0)
                    .build(),
            },
            ClassEntry {
                location: "bad.class".to_string(),
                bytes: b"nope".to_vec(),
            },
        ];

        let index = ClassIndex::build(&entries);

        assert_eq!(index.len(), 1);
        let class = index.class("com/example/A").expect("summary");
        assert_eq!(class.super_name.as_deref(), Some("com/example/Base"));
        assert!(class.method("helper", "()V").expect("method").is_static);
    }
}
