use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zip::ZipArchive;

/// Shape of an input, mirrored by its output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InputKind {
    Directory,
    Archive,
    ClassFile,
}

/// Class file found in an input, addressed by its relative path or entry name.
#[derive(Clone, Debug)]
pub(crate) struct ClassEntry {
    pub(crate) location: String,
    pub(crate) bytes: Vec<u8>,
}

/// One input path with every class it contains, in deterministic order.
#[derive(Debug)]
pub(crate) struct InputSource {
    pub(crate) path: PathBuf,
    pub(crate) kind: InputKind,
    pub(crate) classes: Vec<ClassEntry>,
}

pub(crate) fn read_inputs(paths: &[PathBuf]) -> Result<Vec<InputSource>> {
    paths.iter().map(|path| read_input(path)).collect()
}

pub(crate) fn read_input(path: &Path) -> Result<InputSource> {
    let kind = input_kind(path)
        .with_context(|| format!("unsupported input file: {}", path.display()))?;
    let classes = read_classes(path, kind)?;
    Ok(InputSource {
        path: path.to_path_buf(),
        kind,
        classes,
    })
}

/// Classes of platform libraries and other resolution-only entries.
pub(crate) fn read_classpath(classpath: &[PathBuf]) -> Result<Vec<ClassEntry>> {
    // Keep deterministic ordering by sorting classpath entries and directory listings.
    let mut entries = classpath.to_vec();
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    let mut classes = Vec::new();
    for entry in entries {
        match input_kind(&entry) {
            Some(kind) => classes.extend(read_classes(&entry, kind)?),
            None => tracing::warn!(path = %entry.display(), "ignoring unsupported classpath entry"),
        }
    }
    Ok(classes)
}

pub(crate) fn input_kind(path: &Path) -> Option<InputKind> {
    if path.is_dir() {
        return Some(InputKind::Directory);
    }
    match path.extension().and_then(|ext| ext.to_str()).unwrap_or("") {
        "jar" | "zip" => Some(InputKind::Archive),
        "class" => Some(InputKind::ClassFile),
        _ => None,
    }
}

fn read_classes(path: &Path, kind: InputKind) -> Result<Vec<ClassEntry>> {
    match kind {
        InputKind::Directory => {
            let mut classes = Vec::new();
            read_dir(path, path, &mut classes)?;
            Ok(classes)
        }
        InputKind::Archive => read_jar_file(path),
        InputKind::ClassFile => {
            let bytes =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let location = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(vec![ClassEntry { location, bytes }])
        }
    }
}

fn read_dir(root: &Path, path: &Path, classes: &mut Vec<ClassEntry>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            read_dir(root, &entry, classes)?;
        } else if is_class_name(&path_key(&entry)) {
            let bytes =
                fs::read(&entry).with_context(|| format!("failed to read {}", entry.display()))?;
            classes.push(ClassEntry {
                location: relative_location(root, &entry),
                bytes,
            });
        }
    }

    Ok(())
}

fn read_jar_file(path: &Path) -> Result<Vec<ClassEntry>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if is_class_name(&name) {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    let mut classes = Vec::with_capacity(entry_names.len());
    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        classes.push(ClassEntry {
            location: name,
            bytes,
        });
    }

    Ok(classes)
}

/// Class entries excluding module and package descriptors.
pub(crate) fn is_class_name(name: &str) -> bool {
    name.ends_with(".class")
        && !name.ends_with("module-info.class")
        && !name.ends_with("package-info.class")
}

fn relative_location(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn directory_classes_are_sorted_and_relative() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let nested = temp_dir.path().join("com").join("example");
        fs::create_dir_all(&nested).expect("create dirs");
        fs::write(nested.join("B.class"), b"b").expect("write B");
        fs::write(nested.join("A.class"), b"a").expect("write A");
        fs::write(nested.join("notes.txt"), b"ignored").expect("write txt");
        fs::write(nested.join("package-info.class"), b"p").expect("write package-info");

        let input = read_input(temp_dir.path()).expect("read input");

        assert_eq!(input.kind, InputKind::Directory);
        let locations: Vec<_> = input.classes.iter().map(|c| c.location.as_str()).collect();
        assert_eq!(locations, vec!["com/example/A.class", "com/example/B.class"]);
    }

    #[test]
    fn jar_classes_are_read_by_entry_name() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let jar_path = temp_dir.path().join("lib.jar");
        let file = fs::File::create(&jar_path).expect("create jar");
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer
            .start_file("z/Last.class", options)
            .expect("start entry");
        writer.write_all(b"z").expect("write entry");
        writer
            .start_file("META-INF/MANIFEST.MF", options)
            .expect("start manifest");
        writer.write_all(b"Manifest-Version: 1.0\n").expect("write manifest");
        writer
            .start_file("a/First.class", options)
            .expect("start entry");
        writer.write_all(b"a").expect("write entry");
        writer.finish().expect("finish jar");

        let input = read_input(&jar_path).expect("read jar");

        assert_eq!(input.kind, InputKind::Archive);
        let locations: Vec<_> = input.classes.iter().map(|c| c.location.as_str()).collect();
        assert_eq!(locations, vec!["a/First.class", "z/Last.class"]);
        assert_eq!(input.classes[0].bytes, b"a");
    }

    #[test]
    fn rejects_unsupported_input() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("notes.txt");
        fs::write(&path, b"nope").expect("write file");

        assert!(read_input(&path).is_err());
    }
}
