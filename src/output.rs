//! Mirrors every input into the output directory with woven classes swapped in.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use zip::read::ZipFile;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::report::{FailedClass, InputReport};
use crate::scan::{InputKind, InputSource};
use crate::weave::{WeaveOutcome, Weaver};

/// Woven replacements for one input, keyed by class location.
#[derive(Debug, Default)]
pub(crate) struct WovenInput {
    pub(crate) report: InputReport,
    replacements: HashMap<String, Vec<u8>>,
}

/// Weave every class of `input` in parallel. Fatal errors abort; other
/// failures are recorded and the class is kept as is.
pub(crate) fn weave_input(input: &InputSource, weaver: &Weaver<'_>) -> Result<WovenInput> {
    let outcomes = input
        .classes
        .par_iter()
        .map(|entry| {
            weaver
                .weave(&entry.location, &entry.bytes)
                .map(|outcome| (entry.location.clone(), outcome))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut woven = WovenInput {
        report: InputReport {
            input: input.path.display().to_string(),
            classes: input.classes.len(),
            ..InputReport::default()
        },
        ..WovenInput::default()
    };
    for (location, outcome) in outcomes {
        match outcome {
            WeaveOutcome::Woven { class_name, bytes } => {
                woven.report.woven.push(class_name);
                woven.replacements.insert(location, bytes);
            }
            WeaveOutcome::Unchanged => woven.report.unchanged += 1,
            WeaveOutcome::Excluded => woven.report.excluded += 1,
            WeaveOutcome::Failed { message } => {
                woven.report.failed.push(FailedClass { location, message })
            }
        }
    }
    Ok(woven)
}

/// Output location of `input`: same file name under `output_dir`.
pub(crate) fn output_path(output_dir: &Path, input: &Path) -> Result<PathBuf> {
    let name = input
        .file_name()
        .with_context(|| format!("input has no file name: {}", input.display()))?;
    Ok(output_dir.join(name))
}

pub(crate) fn write_input(
    input: &InputSource,
    woven: &mut WovenInput,
    output_dir: &Path,
) -> Result<PathBuf> {
    let target = output_path(output_dir, &input.path)?;
    match input.kind {
        InputKind::Directory => copy_tree(&input.path, &target, &woven.replacements, "")?,
        InputKind::Archive => rewrite_archive(&input.path, &target, &woven.replacements)?,
        InputKind::ClassFile => {
            let bytes = match input.classes.first() {
                Some(entry) => woven.replacements.get(&entry.location).unwrap_or(&entry.bytes),
                None => anyhow::bail!("no class read from {}", input.path.display()),
            };
            fs::write(&target, bytes)
                .with_context(|| format!("failed to write {}", target.display()))?;
        }
    }
    woven.report.output = target.display().to_string();
    tracing::info!(
        input = %input.path.display(),
        output = %target.display(),
        woven = woven.report.woven.len(),
        failed = woven.report.failed.len(),
        "wrote output"
    );
    Ok(target)
}

fn copy_tree(
    source: &Path,
    target: &Path,
    replacements: &HashMap<String, Vec<u8>>,
    prefix: &str,
) -> Result<()> {
    fs::create_dir_all(target)
        .with_context(|| format!("failed to create directory {}", target.display()))?;
    let mut entries = Vec::new();
    for entry in fs::read_dir(source)
        .with_context(|| format!("failed to read directory {}", source.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", source.display()))?;
        entries.push(entry.path());
    }
    entries.sort();

    for entry in entries {
        let Some(name) = entry.file_name().map(|name| name.to_string_lossy().to_string()) else {
            continue;
        };
        let location = format!("{prefix}{name}");
        let destination = target.join(&name);
        if entry.is_dir() {
            copy_tree(&entry, &destination, replacements, &format!("{location}/"))?;
        } else if let Some(bytes) = replacements.get(&location) {
            fs::write(&destination, bytes)
                .with_context(|| format!("failed to write {}", destination.display()))?;
        } else {
            fs::copy(&entry, &destination).with_context(|| {
                format!("failed to copy {} to {}", entry.display(), destination.display())
            })?;
        }
    }
    Ok(())
}

/// Copy archive entries in their original order; untouched ones are copied
/// raw so compression and metadata survive.
fn rewrite_archive(
    source: &Path,
    target: &Path,
    replacements: &HashMap<String, Vec<u8>>,
) -> Result<()> {
    let file =
        fs::File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", source.display()))?;
    let output = fs::File::create(target)
        .with_context(|| format!("failed to create {}", target.display()))?;
    let mut writer = ZipWriter::new(output);

    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .with_context(|| format!("failed to read {}", source.display()))?;
        let name = entry.name().to_string();
        match replacements.get(&name) {
            Some(bytes) => {
                let options = replacement_options(&entry);
                drop(entry);
                writer
                    .start_file(name.as_str(), options)
                    .with_context(|| format!("failed to add {}:{}", target.display(), name))?;
                writer
                    .write_all(bytes)
                    .with_context(|| format!("failed to write {}:{}", target.display(), name))?;
            }
            None => writer
                .raw_copy_file(entry)
                .with_context(|| format!("failed to copy {}:{}", source.display(), name))?,
        }
    }
    writer
        .finish()
        .with_context(|| format!("failed to finish {}", target.display()))?;
    Ok(())
}

/// Options for a rewritten entry, keeping the source entry's compression,
/// timestamp and permissions so output archives are reproducible.
fn replacement_options<R: Read>(entry: &ZipFile<'_, R>) -> SimpleFileOptions {
    let mut options = SimpleFileOptions::default().compression_method(entry.compression());
    if let Some(modified) = entry.last_modified() {
        options = options.last_modified_time(modified);
    }
    if let Some(mode) = entry.unix_mode() {
        options = options.unix_permissions(mode);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::classpath::{ClassIndex, summary};
    use crate::opcodes;
    use crate::pointcut::{AdviceBinding, AdviceTiming, PointcutKind, PointcutModel, PointcutModelBuilder};
    use crate::scan::read_input;
    use crate::testing::{ClassBuilder, invoke, invoked_methods};
    use tempfile::tempdir;

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

    fn caller() -> Vec<u8> {
        let mut builder = ClassBuilder::new("com/example/C");
        let foo = builder.method_ref("com/example/A", "foo", "(I)V", false);
        let mut code = vec![0x2a, 0x08];
        code.extend(invoke(opcodes::INVOKEVIRTUAL, foo, 1));
        code.push(opcodes::RETURN);
        builder
            .method(ACC_PUBLIC | ACC_STATIC, "main", "(Lcom/example/A;)V", code, 2, 1)
            .build()
    }

    fn class_time() -> zip::DateTime {
        zip::DateTime::from_date_and_time(2021, 3, 4, 5, 6, 8).expect("valid timestamp")
    }

    #[test]
    fn archive_output_replaces_woven_classes_and_copies_the_rest() {
        let temp = tempdir().expect("temp dir");
        let jar_path = temp.path().join("app.jar");
        {
            let file = fs::File::create(&jar_path).expect("create jar");
            let mut zip = ZipWriter::new(file);
            zip.start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
                .expect("start manifest");
            zip.write_all(b"Manifest-Version: 1.0\n").expect("write manifest");
            zip.start_file(
                "com/example/C.class",
                SimpleFileOptions::default().last_modified_time(class_time()),
            )
            .expect("start class");
            zip.write_all(&caller()).expect("write class");
            zip.start_file("com/example/Plain.class", SimpleFileOptions::default())
                .expect("start plain");
            zip.write_all(&ClassBuilder::new("com/example/Plain").build())
                .expect("write plain");
            zip.finish().expect("finish jar");
        }
        let output_dir = temp.path().join("out");
        fs::create_dir(&output_dir).expect("create output dir");

        let model = model();
        let resolver = resolver();
        let weaver = Weaver::new(&model, &resolver, &[]);
        let input = read_input(&jar_path).expect("read input");
        let mut woven = weave_input(&input, &weaver).expect("weave input");
        let target = write_input(&input, &mut woven, &output_dir).expect("write input");

        assert_eq!(woven.report.woven, vec!["com/example/C"]);
        assert_eq!(woven.report.unchanged, 1);
        let mut archive = ZipArchive::new(fs::File::open(&target).expect("open output"))
            .expect("read output");
        let names: Vec<_> = archive.file_names().map(str::to_string).collect();
        assert_eq!(
            names,
            vec!["META-INF/MANIFEST.MF", "com/example/C.class", "com/example/Plain.class"]
        );
        let mut manifest = String::new();
        archive
            .by_name("META-INF/MANIFEST.MF")
            .expect("manifest")
            .read_to_string(&mut manifest)
            .expect("read manifest");
        assert_eq!(manifest, "Manifest-Version: 1.0\n");
        let mut class = Vec::new();
        let mut entry = archive.by_name("com/example/C.class").expect("class");
        assert_eq!(entry.last_modified(), Some(class_time()));
        entry.read_to_end(&mut class).expect("read class");
        drop(entry);
        assert_eq!(
            invoked_methods(&class, "main", "(Lcom/example/A;)V"),
            vec!["com/example/A.foo", "com/example/Aspect.afterFoo"]
        );
    }

    #[test]
    fn directory_output_mirrors_tree() {
        let temp = tempdir().expect("temp dir");
        let classes = temp.path().join("classes");
        fs::create_dir_all(classes.join("com/example")).expect("create dirs");
        fs::write(classes.join("com/example/C.class"), caller()).expect("write class");
        fs::write(classes.join("app.properties"), "name=app\n").expect("write resource");
        let output_dir = temp.path().join("out");
        fs::create_dir(&output_dir).expect("create output dir");

        let model = model();
        let resolver = resolver();
        let weaver = Weaver::new(&model, &resolver, &[]);
        let input = read_input(&classes).expect("read input");
        let mut woven = weave_input(&input, &weaver).expect("weave input");
        let target = write_input(&input, &mut woven, &output_dir).expect("write input");

        assert_eq!(target, output_dir.join("classes"));
        assert_eq!(
            fs::read_to_string(target.join("app.properties")).expect("resource"),
            "name=app\n"
        );
        let class = fs::read(target.join("com/example/C.class")).expect("class");
        assert_eq!(
            invoked_methods(&class, "main", "(Lcom/example/A;)V"),
            vec!["com/example/A.foo", "com/example/Aspect.afterFoo"]
        );
        assert!(woven.report.output.ends_with("classes"));
    }

    #[test]
    fn failed_class_is_copied_verbatim() {
        let temp = tempdir().expect("temp dir");
        let class_path = temp.path().join("Broken.class");
        fs::write(&class_path, b"\xca\xfe\xba\xbe").expect("write class");
        let output_dir = temp.path().join("out");
        fs::create_dir(&output_dir).expect("create output dir");

        let model = model();
        let resolver = resolver();
        let weaver = Weaver::new(&model, &resolver, &[]);
        let input = read_input(&class_path).expect("read input");
        let mut woven = weave_input(&input, &weaver).expect("weave input");
        let target = write_input(&input, &mut woven, &output_dir).expect("write input");

        assert_eq!(woven.report.failed.len(), 1);
        assert_eq!(woven.report.failed[0].location, "Broken.class");
        assert_eq!(fs::read(target).expect("output"), b"\xca\xfe\xba\xbe");
    }
}
